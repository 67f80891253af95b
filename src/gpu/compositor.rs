//! Final composition of trails and the velocity magnitude.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::bbox::BoundingBoxScaling;
use crate::colormap::{ColorMap, ColorScaleRange, Rgba8, RAMP_WIDTH};
use crate::options::StreamlineStyle;

use super::{
    create_sampler, create_texture, sampler_entry, texture_entry, uniform_entry, write_texture,
    FieldTexture, GpuContext, FIELD_WGSL, FULLSCREEN_WGSL,
};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct CompositorUniforms {
    bbox: [f32; 4],
    particle_color: [f32; 4],
    decode: [f32; 4],
    range_start: f32,
    range_end: f32,
    style: u32,
    _pad: u32,
}

/// Inputs of one composite that change from frame to frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeParams {
    pub style: StreamlineStyle,
    pub particle_color: Rgba8,
    pub range: ColorScaleRange,
    pub bbox: BoundingBoxScaling,
}

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Blends the trail image with the colour-mapped speed onto the surface.
pub struct Compositor {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    trail_sampler: wgpu::Sampler,
    ramp_texture: wgpu::Texture,
    ramp_view: wgpu::TextureView,
    ramp_sampler: wgpu::Sampler,
    /// Surface stores sRGB, so uniform colours are linearised.
    srgb: bool,
}

impl Compositor {
    pub fn new(context: &GpuContext, surface_format: wgpu::TextureFormat, color_map: &ColorMap) -> Self {
        let device = &context.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Compositor Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_shader().into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Compositor Bind Group Layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
                texture_entry(1, wgpu::ShaderStages::FRAGMENT),
                sampler_entry(2, wgpu::ShaderStages::FRAGMENT),
                texture_entry(3, wgpu::ShaderStages::FRAGMENT),
                sampler_entry(4, wgpu::ShaderStages::FRAGMENT),
                texture_entry(5, wgpu::ShaderStages::FRAGMENT),
                sampler_entry(6, wgpu::ShaderStages::FRAGMENT),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Compositor Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Compositor Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Compositor Uniform Buffer"),
            contents: bytemuck::bytes_of(&CompositorUniforms::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let srgb = surface_format.is_srgb();
        let ramp_format = if srgb {
            wgpu::TextureFormat::Rgba8UnormSrgb
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let (ramp_texture, ramp_view) = create_texture(
            device,
            "Colour Ramp Texture",
            RAMP_WIDTH,
            1,
            ramp_format,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );

        let compositor = Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            pipeline,
            bind_group_layout,
            uniform_buffer,
            trail_sampler: create_sampler(device, "Compositor Trail Sampler", wgpu::FilterMode::Linear),
            ramp_texture,
            ramp_view,
            ramp_sampler: create_sampler(device, "Colour Ramp Sampler", wgpu::FilterMode::Linear),
            srgb,
        };
        compositor.set_color_map(color_map);
        compositor
    }

    /// Upload the ramp for a new colour map.
    pub fn set_color_map(&self, color_map: &ColorMap) {
        write_texture(&self.queue, &self.ramp_texture, &color_map.ramp(RAMP_WIDTH), 4);
    }

    /// Composite `trail` over the field's colour-mapped speed into `target`.
    pub fn render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        trail: &wgpu::TextureView,
        field: &FieldTexture,
        params: &CompositeParams,
    ) {
        let mut particle_color = params.particle_color.to_f32();
        if self.srgb {
            for c in &mut particle_color[..3] {
                *c = srgb_to_linear(*c);
            }
        }
        let bbox = params.bbox;
        let uniforms = CompositorUniforms {
            bbox: [bbox.scale_x, bbox.scale_y, bbox.offset_x, bbox.offset_y],
            particle_color,
            decode: field.decode_uniform(),
            range_start: params.range.start,
            range_end: params.range.end,
            style: params.style.shader_index(),
            _pad: 0,
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Compositor Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(trail),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.trail_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(field.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(field.sampler()),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::TextureView(&self.ramp_view),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::Sampler(&self.ramp_sampler),
                },
            ],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Compositor Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}

pub(crate) fn generate_shader() -> String {
    format!(
        r#"
struct Uniforms {{
    bbox: vec4<f32>,
    particle_color: vec4<f32>,
    decode: vec4<f32>,
    range_start: f32,
    range_end: f32,
    style: u32,
    _pad: u32,
}};

@group(0) @binding(0)
var<uniform> params: Uniforms;
@group(0) @binding(1)
var trail_texture: texture_2d<f32>;
@group(0) @binding(2)
var trail_sampler: sampler;
@group(0) @binding(3)
var field: texture_2d<f32>;
@group(0) @binding(4)
var field_sampler: sampler;
@group(0) @binding(5)
var ramp: texture_2d<f32>;
@group(0) @binding(6)
var ramp_sampler: sampler;

const RAMP_WIDTH: f32 = {RAMP_WIDTH}.0;

{FULLSCREEN_WGSL}
{FIELD_WGSL}

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> FullscreenOutput {{
    return fullscreen_vertex(vertex_index, params.bbox.xy, params.bbox.zw);
}}

fn ramp_position(speed: f32) -> f32 {{
    let span = params.range_end - params.range_start;
    var t = select(0.0, 1.0, speed >= params.range_end);
    if span > 0.0 {{
        t = clamp((speed - params.range_start) / span, 0.0, 1.0);
    }}
    // Texel centres of the first and last entry.
    return (t * (RAMP_WIDTH - 1.0) + 0.5) / RAMP_WIDTH;
}}

@fragment
fn fs_main(in: FullscreenOutput) -> @location(0) vec4<f32> {{
    let inside = all(in.uv >= vec2<f32>(0.0)) && all(in.uv <= vec2<f32>(1.0));
    if !inside || is_no_data(in.uv) {{
        return vec4<f32>(0.0);
    }}
    let speed = length(physical_velocity(in.uv, params.decode));
    if speed <= 0.0 {{
        return vec4<f32>(0.0);
    }}

    let magnitude = textureSampleLevel(ramp, ramp_sampler, vec2<f32>(ramp_position(speed), 0.5), 0.0);
    let intensity = textureSampleLevel(trail_texture, trail_sampler, in.uv, 0.0).a;
    let particle = params.particle_color;

    var color: vec4<f32>;
    switch params.style {{
        case 0u: {{
            color = vec4<f32>(mix(magnitude.rgb, particle.rgb, intensity), magnitude.a);
        }}
        case 1u: {{
            color = vec4<f32>(mix(magnitude.rgb, vec3<f32>(0.0), intensity), magnitude.a);
        }}
        case 2u: {{
            color = vec4<f32>(magnitude.rgb, magnitude.a * intensity);
        }}
        default: {{
            color = mix(particle, magnitude, intensity);
        }}
    }}
    return color;
}}
"#
    )
}

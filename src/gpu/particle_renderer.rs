//! Instanced particle quads.
//!
//! One quad per particle is drawn at its current position, reading the
//! propagator's storage buffers by instance index. The same shader serves
//! two passes: trail particles blended into the accumulation target, and an
//! optional sprite overlay alpha-blended onto the final surface with the
//! bounding-box remap applied.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::bbox::BoundingBoxScaling;
use crate::options::VisualiserOptions;

use super::{
    create_sampler, create_texture, sampler_entry, storage_entry, texture_entry, uniform_entry,
    write_texture, GpuContext, Propagator, ADDITIVE_MAX_ALPHA, TRAIL_FORMAT,
};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct RenderUniforms {
    color: [f32; 4],
    /// `(scale_x, scale_y, offset_x, offset_y)`
    bbox: [f32; 4],
    viewport: [f32; 2],
    max_size: f32,
    growth_rate: f32,
    max_age: f32,
    shrink_duration: f32,
    rotate: u32,
    _pad: u32,
}

impl RenderUniforms {
    fn new(
        options: &VisualiserOptions,
        max_size: f32,
        max_age: f32,
        viewport: (u32, u32),
        bbox: BoundingBoxScaling,
    ) -> Self {
        Self {
            color: options.particle_color.to_f32(),
            bbox: [bbox.scale_x, bbox.scale_y, bbox.offset_x, bbox.offset_y],
            viewport: [viewport.0.max(1) as f32, viewport.1.max(1) as f32],
            max_size,
            growth_rate: options.growth_rate,
            max_age,
            // Ages grow without bound when particles retire by index.
            shrink_duration: if options.elimination.bounds_age() {
                options.shrink_duration
            } else {
                0.0
            },
            rotate: options.rotate_particles as u32,
            _pad: 0,
        }
    }
}

/// Per-particle size in pixels at `age`. Mirrors `particle_size` in the shader.
pub fn particle_size(age: f32, max_size: f32, growth_rate: f32, max_age: f32, shrink_duration: f32) -> f32 {
    let mut size = (growth_rate * age).min(max_size);
    let remaining = max_age - age;
    if shrink_duration > 0.0 && remaining < shrink_duration {
        size *= (remaining / shrink_duration).clamp(0.0, 1.0);
    }
    size
}

/// An RGBA image drawn in place of the overlay particles.
pub struct Sprite {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

impl Sprite {
    pub fn from_image(device: &wgpu::Device, queue: &wgpu::Queue, image: &image::RgbaImage) -> Self {
        let (texture, view) = create_texture(
            device,
            "Sprite Texture",
            image.width(),
            image.height(),
            wgpu::TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        write_texture(queue, &texture, image.as_raw(), 4);
        Self {
            _texture: texture,
            view,
            sampler: create_sampler(device, "Sprite Sampler", wgpu::FilterMode::Linear),
        }
    }
}

struct UniformBinding {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl UniformBinding {
    fn new(device: &wgpu::Device, layout: &wgpu::BindGroupLayout, label: &str) -> Self {
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(&RenderUniforms::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });
        Self { buffer, bind_group }
    }
}

/// Draws particles into the trail target and, optionally, sprites onto the surface.
pub struct ParticleRenderer {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    trail_pipeline: wgpu::RenderPipeline,
    sprite_pipeline: wgpu::RenderPipeline,
    trail_uniforms: UniformBinding,
    sprite_uniforms: UniformBinding,
    particle_layout: wgpu::BindGroupLayout,
    /// `particle_bind_groups[i]` reads slot `i`.
    particle_bind_groups: [wgpu::BindGroup; 2],
    generation: u64,
    sprite_layout: wgpu::BindGroupLayout,
    sprite: Option<(Sprite, wgpu::BindGroup)>,
}

impl ParticleRenderer {
    pub fn new(context: &GpuContext, surface_format: wgpu::TextureFormat, propagator: &Propagator) -> Self {
        let device = &context.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Particle Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_shader().into()),
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Particle Uniform Bind Group Layout"),
            entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT)],
        });
        let particle_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Particle Storage Bind Group Layout"),
            entries: &[
                storage_entry(0, wgpu::ShaderStages::VERTEX, true),
                storage_entry(1, wgpu::ShaderStages::VERTEX, true),
            ],
        });
        let sprite_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Sprite Bind Group Layout"),
            entries: &[
                texture_entry(0, wgpu::ShaderStages::FRAGMENT),
                sampler_entry(1, wgpu::ShaderStages::FRAGMENT),
            ],
        });

        let trail_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Particle Trail Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout, &particle_layout],
            push_constant_ranges: &[],
        });
        let sprite_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Particle Sprite Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout, &particle_layout, &sprite_layout],
            push_constant_ranges: &[],
        });

        let trail_pipeline = create_pipeline(
            device,
            "Particle Trail Pipeline",
            &trail_layout,
            &shader,
            "fs_trail",
            TRAIL_FORMAT,
            ADDITIVE_MAX_ALPHA,
        );
        let sprite_pipeline = create_pipeline(
            device,
            "Particle Sprite Pipeline",
            &sprite_pipeline_layout,
            &shader,
            "fs_sprite",
            surface_format,
            wgpu::BlendState::ALPHA_BLENDING,
        );

        Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            trail_pipeline,
            sprite_pipeline,
            trail_uniforms: UniformBinding::new(device, &uniform_layout, "Particle Trail Uniforms"),
            sprite_uniforms: UniformBinding::new(device, &uniform_layout, "Particle Sprite Uniforms"),
            particle_bind_groups: create_particle_bind_groups(device, &particle_layout, propagator),
            particle_layout,
            generation: propagator.generation(),
            sprite_layout,
            sprite: None,
        }
    }

    /// Rebuild storage bindings if the propagator reallocated its buffers.
    pub fn sync(&mut self, propagator: &Propagator) {
        if propagator.generation() != self.generation {
            self.particle_bind_groups =
                create_particle_bind_groups(&self.device, &self.particle_layout, propagator);
            self.generation = propagator.generation();
        }
    }

    pub fn set_sprite(&mut self, sprite: Option<Sprite>) {
        self.sprite = sprite.map(|sprite| {
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Sprite Bind Group"),
                layout: &self.sprite_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&sprite.view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&sprite.sampler),
                    },
                ],
            });
            (sprite, bind_group)
        });
    }

    pub fn has_sprite(&self) -> bool {
        self.sprite.is_some()
    }

    /// Draw the current particles into `target` on top of its contents.
    pub fn draw_particles(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        propagator: &Propagator,
        options: &VisualiserOptions,
        viewport: (u32, u32),
    ) {
        let uniforms = RenderUniforms::new(
            options,
            options.particle_size,
            propagator.max_age(),
            viewport,
            BoundingBoxScaling::IDENTITY,
        );
        self.queue
            .write_buffer(&self.trail_uniforms.buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut pass = begin_load_pass(encoder, target, "Particle Trail Pass");
        pass.set_pipeline(&self.trail_pipeline);
        pass.set_bind_group(0, &self.trail_uniforms.bind_group, &[]);
        pass.set_bind_group(1, &self.particle_bind_groups[propagator.parity()], &[]);
        pass.draw(0..6, 0..propagator.num_particles());
    }

    /// Draw the sprite at every particle onto the final surface.
    /// Does nothing without a sprite.
    pub fn draw_sprites(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        propagator: &Propagator,
        options: &VisualiserOptions,
        viewport: (u32, u32),
        bbox: BoundingBoxScaling,
    ) {
        let Some((_, sprite_bind_group)) = &self.sprite else {
            return;
        };
        let uniforms = RenderUniforms::new(options, options.sprite_size, propagator.max_age(), viewport, bbox);
        self.queue
            .write_buffer(&self.sprite_uniforms.buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut pass = begin_load_pass(encoder, target, "Particle Sprite Pass");
        pass.set_pipeline(&self.sprite_pipeline);
        pass.set_bind_group(0, &self.sprite_uniforms.bind_group, &[]);
        pass.set_bind_group(1, &self.particle_bind_groups[propagator.parity()], &[]);
        pass.set_bind_group(2, sprite_bind_group, &[]);
        pass.draw(0..6, 0..propagator.num_particles());
    }
}

fn begin_load_pass<'a>(
    encoder: &'a mut wgpu::CommandEncoder,
    target: &wgpu::TextureView,
    label: &str,
) -> wgpu::RenderPass<'a> {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
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
    })
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    fragment_entry: &str,
    format: wgpu::TextureFormat,
    blend: wgpu::BlendState,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs_main"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(blend),
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
    })
}

fn create_particle_bind_groups(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    propagator: &Propagator,
) -> [wgpu::BindGroup; 2] {
    [0, 1].map(|slot| {
        let buffers = propagator.buffers().slot(slot);
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Particle Storage Bind Group {slot}")),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffers.state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.age.as_entire_binding(),
                },
            ],
        })
    })
}

pub(crate) fn generate_shader() -> String {
    r#"
struct Uniforms {
    color: vec4<f32>,
    bbox: vec4<f32>,
    viewport: vec2<f32>,
    max_size: f32,
    growth_rate: f32,
    max_age: f32,
    shrink_duration: f32,
    rotate: u32,
    _pad: u32,
};

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@group(0) @binding(0)
var<uniform> params: Uniforms;

@group(1) @binding(0)
var<storage, read> particle_state: array<vec4<f32>>;
@group(1) @binding(1)
var<storage, read> particle_age: array<f32>;

@group(2) @binding(0)
var sprite_texture: texture_2d<f32>;
@group(2) @binding(1)
var sprite_sampler: sampler;

fn particle_size(age: f32) -> f32 {
    var size = min(params.growth_rate * age, params.max_size);
    let remaining = params.max_age - age;
    if params.shrink_duration > 0.0 && remaining < params.shrink_duration {
        size = size * clamp(remaining / params.shrink_duration, 0.0, 1.0);
    }
    return size;
}

@vertex
fn vs_main(
    @builtin(vertex_index) vertex_index: u32,
    @builtin(instance_index) instance_index: u32,
) -> VertexOutput {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-0.5, -0.5),
        vec2<f32>(0.5, -0.5),
        vec2<f32>(0.5, 0.5),
        vec2<f32>(-0.5, -0.5),
        vec2<f32>(0.5, 0.5),
        vec2<f32>(-0.5, 0.5),
    );
    let corner = corners[vertex_index];
    let state = particle_state[instance_index];
    let velocity = state.zw;

    var out: VertexOutput;
    out.uv = vec2<f32>(corner.x + 0.5, 0.5 - corner.y);

    // No data: every vertex collapses onto one point.
    if all(velocity == vec2<f32>(0.0)) {
        out.clip_position = vec4<f32>(0.0, 0.0, 0.0, 1.0);
        return out;
    }

    let size = particle_size(particle_age[instance_index]);
    var offset = corner * size;
    if params.rotate != 0u {
        let up = normalize(velocity * params.viewport);
        let right = vec2<f32>(up.y, -up.x);
        offset = (corner.x * right + corner.y * up) * size;
    }

    let center = state.xy * params.bbox.xy + params.bbox.zw;
    out.clip_position = vec4<f32>(center + offset * 2.0 / params.viewport, 0.0, 1.0);
    return out;
}

@fragment
fn fs_trail(in: VertexOutput) -> @location(0) vec4<f32> {
    let radius = length(in.uv - vec2<f32>(0.5)) * 2.0;
    let coverage = (1.0 - smoothstep(0.7, 1.0, radius)) * params.color.a;
    if coverage <= 0.0 {
        discard;
    }
    return vec4<f32>(params.color.rgb * coverage, coverage);
}

@fragment
fn fs_sprite(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(sprite_texture, sprite_sampler, in.uv);
}
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EliminationMode;

    #[test]
    fn test_uniforms_layout() {
        assert_eq!(std::mem::size_of::<RenderUniforms>(), 64);
    }

    #[test]
    fn test_shader_validates() {
        let module = naga::front::wgsl::parse_str(&generate_shader()).expect("particle WGSL should parse");
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("particle WGSL should validate");
    }

    #[test]
    fn test_size_grows_then_caps() {
        assert_eq!(particle_size(0.0, 4.0, 8.0, 10.0, 0.5), 0.0);
        assert_eq!(particle_size(0.25, 4.0, 8.0, 10.0, 0.5), 2.0);
        assert_eq!(particle_size(2.0, 4.0, 8.0, 10.0, 0.5), 4.0);
    }

    #[test]
    fn test_size_shrinks_to_zero_at_max_age() {
        let halfway = particle_size(9.75, 4.0, 8.0, 10.0, 0.5);
        assert!((halfway - 2.0).abs() < 1e-5);
        assert_eq!(particle_size(10.0, 4.0, 8.0, 10.0, 0.5), 0.0);
        assert_eq!(particle_size(11.0, 4.0, 8.0, 10.0, 0.5), 0.0);
    }

    #[test]
    fn test_no_shrink_when_disabled() {
        assert_eq!(particle_size(10.0, 4.0, 8.0, 10.0, 0.0), 4.0);
    }

    #[test]
    fn test_index_range_particles_outlive_max_age() {
        let options = VisualiserOptions {
            elimination: EliminationMode::IndexRange { per_second: 100.0 },
            ..Default::default()
        };
        let uniforms = RenderUniforms::new(&options, 4.0, 10.0, (64, 64), BoundingBoxScaling::IDENTITY);
        assert_eq!(uniforms.shrink_duration, 0.0);
        let size = particle_size(25.0, 4.0, 8.0, 10.0, uniforms.shrink_duration);
        assert_eq!(size, 4.0);
    }

    #[test]
    fn test_age_mode_keeps_shrink() {
        let options = VisualiserOptions::default();
        let uniforms = RenderUniforms::new(&options, 4.0, 10.0, (64, 64), BoundingBoxScaling::IDENTITY);
        assert_eq!(uniforms.shrink_duration, options.shrink_duration);
    }
}

//! Fading trail accumulation.
//!
//! Two offscreen targets hold the particle image of the previous and the
//! current step. Each step the previous image is copied into the current
//! target with its opacity reduced, then new particles are drawn on top, so
//! older positions fade into comet-like trails.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use wgpu::util::DeviceExt;

use crate::double_buffer::DoubleBuffer;

use super::{
    create_sampler, create_texture, sampler_entry, texture_entry, uniform_entry, GpuContext,
    FULLSCREEN_WGSL, RANDOM_WGSL, TRAIL_FORMAT,
};

/// Alpha code of a texel after fading `code` by `fade`, given a uniform
/// random number `r` in `[0, 1)`.
///
/// The exact result `code * (1 - fade)` rarely lands on an 8-bit code, and
/// rounding to nearest would leave faint texels stuck forever. Instead the
/// removed amount is rounded up with probability equal to its fractional
/// part, so the expected alpha follows the exponential decay exactly and any
/// positive fade eventually reaches zero.
pub fn fade_alpha(code: u8, fade: f32, r: f32) -> u8 {
    let code = f32::from(code);
    let reduction = code * fade.clamp(0.0, 1.0);
    let whole = reduction.floor();
    let steps = if r < reduction - whole { whole + 1.0 } else { whole };
    (code - steps).max(0.0) as u8
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct FadeUniforms {
    fade: f32,
    seed: u32,
    _pad: [u32; 2],
}

struct TrailTarget {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// Double-buffered trail targets.
pub struct TrailAccumulator {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    targets: DoubleBuffer<TrailTarget>,
    /// `bind_groups[p]` samples slot `1 - p`, for drawing into slot `p`.
    bind_groups: [wgpu::BindGroup; 2],
    width: u32,
    height: u32,
    rng: SmallRng,
}

impl TrailAccumulator {
    pub fn new(context: &GpuContext, width: u32, height: u32) -> Self {
        let device = &context.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Trail Fade Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_shader().into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Trail Fade Bind Group Layout"),
            entries: &[
                texture_entry(0, wgpu::ShaderStages::FRAGMENT),
                sampler_entry(1, wgpu::ShaderStages::FRAGMENT),
                uniform_entry(2, wgpu::ShaderStages::FRAGMENT),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Trail Fade Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Trail Fade Pipeline"),
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
                    format: TRAIL_FORMAT,
                    blend: None,
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
            label: Some("Trail Fade Uniform Buffer"),
            contents: bytemuck::bytes_of(&FadeUniforms::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        // Targets match the surface one to one.
        let sampler = create_sampler(device, "Trail Sampler", wgpu::FilterMode::Nearest);
        let targets = create_targets(device, width, height);
        let bind_groups = create_bind_groups(device, &bind_group_layout, &targets, &sampler, &uniform_buffer);

        Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            pipeline,
            bind_group_layout,
            uniform_buffer,
            sampler,
            targets,
            bind_groups,
            width,
            height,
            rng: SmallRng::from_entropy(),
        }
    }

    /// Recreate both targets at a new size. Accumulated trails are lost.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.targets = create_targets(&self.device, width, height);
        self.bind_groups = create_bind_groups(
            &self.device,
            &self.bind_group_layout,
            &self.targets,
            &self.sampler,
            &self.uniform_buffer,
        );
    }

    /// Draw the previous image into the current target with `fade_amount`
    /// of its opacity removed, rounded per texel as in [`fade_alpha`].
    pub fn render(&mut self, encoder: &mut wgpu::CommandEncoder, fade_amount: f32) {
        let uniforms = FadeUniforms {
            fade: fade_amount.clamp(0.0, 1.0),
            seed: self.rng.gen(),
            _pad: [0; 2],
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Trail Fade Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.targets.current().view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_groups[self.targets.parity()], &[]);
        pass.draw(0..3, 0..1);
    }

    /// Erase both targets.
    pub fn clear(&self, encoder: &mut wgpu::CommandEncoder) {
        for target in self.targets.iter() {
            let _ = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Trail Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
    }

    pub fn swap_buffers(&mut self) {
        self.targets.swap();
    }

    /// The most recently rendered trail image.
    pub fn current_view(&self) -> &wgpu::TextureView {
        &self.targets.current().view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

fn create_targets(device: &wgpu::Device, width: u32, height: u32) -> DoubleBuffer<TrailTarget> {
    DoubleBuffer::from_fn(|slot| {
        let (texture, view) = create_texture(
            device,
            &format!("Trail Texture {slot}"),
            width,
            height,
            TRAIL_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        TrailTarget {
            _texture: texture,
            view,
        }
    })
}

fn create_bind_groups(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    targets: &DoubleBuffer<TrailTarget>,
    sampler: &wgpu::Sampler,
    uniform_buffer: &wgpu::Buffer,
) -> [wgpu::BindGroup; 2] {
    [0, 1].map(|write| {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Trail Fade Bind Group {write}")),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&targets.slot(1 - write).view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        })
    })
}

pub(crate) fn generate_shader() -> String {
    format!(
        r#"
struct FadeUniforms {{
    fade: f32,
    seed: u32,
    _pad0: u32,
    _pad1: u32,
}};

@group(0) @binding(0)
var previous: texture_2d<f32>;
@group(0) @binding(1)
var previous_sampler: sampler;
@group(0) @binding(2)
var<uniform> params: FadeUniforms;

{FULLSCREEN_WGSL}
{RANDOM_WGSL}

fn fade_alpha(code: f32, fade: f32, r: f32) -> f32 {{
    let reduction = code * fade;
    let whole = floor(reduction);
    let steps = select(whole, whole + 1.0, r < reduction - whole);
    return max(code - steps, 0.0);
}}

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> FullscreenOutput {{
    return fullscreen_vertex(vertex_index, vec2<f32>(1.0), vec2<f32>(0.0));
}}

@fragment
fn fs_main(in: FullscreenOutput) -> @location(0) vec4<f32> {{
    let texel = textureSample(previous, previous_sampler, in.uv);
    let code = round(texel.a * 255.0);
    if (code <= 0.0) {{
        return vec4<f32>(0.0);
    }}
    let pixel = vec2<u32>(in.clip_position.xy);
    let index = pixel.y * textureDimensions(previous).x + pixel.x;
    let faded = fade_alpha(code, params.fade, random_unit(params.seed, index, 0u));
    // Premultiplied: colour keeps its ratio to alpha.
    return vec4<f32>(texel.rgb * (faded / code), faded / 255.0);
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_validates() {
        let module = naga::front::wgsl::parse_str(&generate_shader()).expect("fade WGSL should parse");
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .expect("fade WGSL should validate");
    }

    /// Fade a texel the way the 8-bit target stores it until it clears.
    fn steps_to_clear(start: u8, fade: f32, rng: &mut SmallRng, limit: u32) -> Option<u32> {
        let mut code = start;
        for step in 0..limit {
            if code == 0 {
                return Some(step);
            }
            code = fade_alpha(code, fade, rng.gen());
        }
        None
    }

    #[test]
    fn test_whole_reductions_are_exact() {
        assert_eq!(fade_alpha(200, 0.5, 0.99), 100);
        assert_eq!(fade_alpha(255, 1.0, 0.0), 0);
        assert_eq!(fade_alpha(255, 3.0, 0.5), 0);
        assert_eq!(fade_alpha(37, 0.0, 0.0), 37);
        assert_eq!(fade_alpha(0, 0.5, 0.0), 0);
    }

    #[test]
    fn test_fractional_reduction_rounds_either_way() {
        // 10 * 0.25 = 2.5 codes removed.
        assert_eq!(fade_alpha(10, 0.25, 0.2), 7);
        assert_eq!(fade_alpha(10, 0.25, 0.7), 8);
        // Far below one code per step still clears the texel sometimes.
        assert_eq!(fade_alpha(1, 0.001, 0.0005), 0);
        assert_eq!(fade_alpha(1, 0.001, 0.5), 1);
    }

    #[test]
    fn test_faint_trails_reach_zero() {
        let mut rng = SmallRng::seed_from_u64(42);
        for start in [255u8, 200, 25, 1] {
            assert!(
                steps_to_clear(start, 0.02, &mut rng, 10_000).is_some(),
                "alpha {start} should clear at 0.02 per step"
            );
            assert!(
                steps_to_clear(start, 0.3 / 255.0, &mut rng, 1_000_000).is_some(),
                "alpha {start} should clear below one code per step"
            );
        }
    }

    #[test]
    fn test_mean_alpha_follows_exponential_decay() {
        let mut rng = SmallRng::seed_from_u64(7);
        let (fade, steps) = (0.01f32, 50);
        let mut texels = vec![200u8; 10_000];
        for _ in 0..steps {
            for code in &mut texels {
                *code = fade_alpha(*code, fade, rng.gen());
            }
        }
        let mean = texels.iter().map(|&c| f64::from(c)).sum::<f64>() / texels.len() as f64;
        let expected = 200.0 * (1.0 - f64::from(fade)).powi(steps);
        assert!(
            (mean - expected).abs() < 1.0,
            "mean alpha {mean} should track {expected}"
        );
    }
}

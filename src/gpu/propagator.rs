//! Particle propagation on the GPU.
//!
//! Particle state lives in two storage buffers per slot: `vec4` position and
//! velocity, and an `f32` age. A compute pass reads the previous slot and
//! writes the current one; nothing is rasterised. Before every step the
//! slots are swapped so the most recent output becomes the next input.
//!
//! The kernel makes the same decisions as [`crate::particle::step_particle`]
//! and draws its random numbers from the same hash.

use std::sync::{mpsc, Arc};

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use wgpu::util::DeviceExt;

use crate::double_buffer::DoubleBuffer;
use crate::error::GpuError;
use crate::options::EliminationMode;
use crate::particle::{
    resample_velocity, seed_particles, EliminationRange, Particle, ParticleGpu, StepParams,
    SEED_VELOCITY,
};
use crate::speed_curve::SpeedCurve;
use crate::velocity::VelocityImage;

use super::{
    sampler_entry, storage_entry, texture_entry, uniform_entry, FieldTexture, GpuContext,
    FIELD_WGSL, RANDOM_WGSL, WORKGROUP_SIZE,
};

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct PropagatorUniforms {
    decode: [f32; 4],
    speed_exponent: f32,
    speed_factor: f32,
    aspect_ratio: f32,
    dt: f32,
    max_age: f32,
    num_particles: u32,
    seed: u32,
    elimination_mode: u32,
    elimination_start: u32,
    elimination_count: u32,
    randomise_respawn_age: u32,
    _pad: u32,
}

impl PropagatorUniforms {
    fn new(params: &StepParams, decode: [f32; 4]) -> Self {
        let elimination_mode = match params.elimination {
            EliminationMode::Age => 0,
            EliminationMode::IndexRange { .. } => 1,
        };
        Self {
            decode,
            speed_exponent: params.speed_curve.exponent(),
            speed_factor: params.speed_curve.factor(),
            aspect_ratio: params.aspect_ratio,
            dt: params.dt,
            max_age: params.max_age,
            num_particles: params.num_particles,
            seed: params.seed,
            elimination_mode,
            elimination_start: params.elimination_range.start,
            elimination_count: params.elimination_range.count,
            randomise_respawn_age: params.randomise_respawn_age as u32,
            _pad: 0,
        }
    }
}

/// Per-step inputs owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropagatorStep {
    pub dt: f32,
    pub aspect_ratio: f32,
    pub speed_curve: SpeedCurve,
    pub elimination: EliminationMode,
    /// Respawn eliminated particles with random ages this step.
    pub randomise_respawn_age: bool,
}

/// Largest particle count whose state buffer fits the device limits.
pub fn max_particles(limits: &wgpu::Limits) -> u32 {
    let bytes = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
    (bytes / std::mem::size_of::<ParticleGpu>() as u64).min(u64::from(u32::MAX)) as u32
}

/// State and age buffers of one slot.
pub struct ParticleBuffers {
    pub state: wgpu::Buffer,
    pub age: wgpu::Buffer,
}

impl ParticleBuffers {
    fn new(device: &wgpu::Device, num_particles: u32, slot: usize) -> Self {
        let count = num_particles.max(1) as u64;
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        Self {
            state: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("Particle State Buffer {slot}")),
                size: count * std::mem::size_of::<ParticleGpu>() as u64,
                usage,
                mapped_at_creation: false,
            }),
            age: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("Particle Age Buffer {slot}")),
                size: count * std::mem::size_of::<f32>() as u64,
                usage,
                mapped_at_creation: false,
            }),
        }
    }
}

/// GPU particle simulation.
pub struct Propagator {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    pipeline: wgpu::ComputePipeline,
    field_layout: wgpu::BindGroupLayout,
    particle_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    field_bind_group: wgpu::BindGroup,
    decode: [f32; 4],
    buffers: DoubleBuffer<ParticleBuffers>,
    /// `bind_groups[p]` reads slot `1 - p` and writes slot `p`.
    bind_groups: [wgpu::BindGroup; 2],
    num_particles: u32,
    max_age: f32,
    /// Bumped whenever the buffers are reallocated.
    generation: u64,
    rng: SmallRng,
}

impl Propagator {
    /// Create buffers for `num_particles` and seed them without a field.
    pub fn new(context: &GpuContext, field: &FieldTexture, num_particles: u32, max_age: f32) -> Self {
        let device = &context.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Propagator Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_shader().into()),
        });

        let field_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Propagator Field Bind Group Layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::COMPUTE),
                texture_entry(1, wgpu::ShaderStages::COMPUTE),
                sampler_entry(2, wgpu::ShaderStages::COMPUTE),
            ],
        });

        let particle_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Propagator Particle Bind Group Layout"),
            entries: &[
                storage_entry(0, wgpu::ShaderStages::COMPUTE, true),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, true),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(3, wgpu::ShaderStages::COMPUTE, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Propagator Pipeline Layout"),
            bind_group_layouts: &[&field_layout, &particle_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Propagator Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Propagator Uniform Buffer"),
            contents: bytemuck::bytes_of(&PropagatorUniforms::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let field_bind_group = create_field_bind_group(device, &field_layout, &uniform_buffer, field);
        let buffers = DoubleBuffer::from_fn(|slot| ParticleBuffers::new(device, num_particles, slot));
        let bind_groups = create_particle_bind_groups(device, &particle_layout, &buffers);

        let mut propagator = Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            pipeline,
            field_layout,
            particle_layout,
            uniform_buffer,
            field_bind_group,
            decode: field.decode_uniform(),
            buffers,
            bind_groups,
            num_particles,
            max_age,
            generation: 0,
            rng: SmallRng::from_entropy(),
        };
        propagator.reset(None, &SpeedCurve::default(), 1.0);
        propagator
    }

    /// Reseed every particle at a random position with a random age in
    /// `[0, max_age)`. Velocities are sampled from `field` when given.
    ///
    /// Both slots receive the seed and the parity returns to slot 0, so the
    /// next [`update`](Self::update) reads the seed whatever the previous
    /// parity was.
    pub fn reset(&mut self, field: Option<&VelocityImage>, speed_curve: &SpeedCurve, aspect_ratio: f32) {
        let sample = field.map(|image| move |p: Vec2| resample_velocity(image, p, speed_curve, aspect_ratio));
        let particles = seed_particles(
            &mut self.rng,
            self.num_particles,
            self.max_age,
            sample.as_ref().map(|f| f as &dyn Fn(Vec2) -> Vec2),
        );

        if !particles.is_empty() {
            let states: Vec<ParticleGpu> = particles.iter().map(Particle::to_gpu).collect();
            let ages: Vec<f32> = particles.iter().map(|p| p.age).collect();
            for slot in self.buffers.iter() {
                self.queue.write_buffer(&slot.state, 0, bytemuck::cast_slice(&states));
                self.queue.write_buffer(&slot.age, 0, bytemuck::cast_slice(&ages));
            }
        }
        self.buffers.set_parity(0);
        log::debug!("Reseeded {} particles (max age {}s)", self.num_particles, self.max_age);
    }

    /// Reallocate for a new particle count and reseed.
    pub fn set_num_particles(
        &mut self,
        num_particles: u32,
        field: Option<&VelocityImage>,
        speed_curve: &SpeedCurve,
        aspect_ratio: f32,
    ) {
        if num_particles != self.num_particles {
            self.num_particles = num_particles;
            self.buffers = DoubleBuffer::from_fn(|slot| ParticleBuffers::new(&self.device, num_particles, slot));
            self.bind_groups = create_particle_bind_groups(&self.device, &self.particle_layout, &self.buffers);
            self.generation += 1;
        }
        self.reset(field, speed_curve, aspect_ratio);
    }

    /// Change the particle lifetime and reseed ages.
    pub fn set_max_age(
        &mut self,
        max_age: f32,
        field: Option<&VelocityImage>,
        speed_curve: &SpeedCurve,
        aspect_ratio: f32,
    ) {
        self.max_age = max_age;
        self.reset(field, speed_curve, aspect_ratio);
    }

    /// Sample a new velocity texture from the next step on.
    pub fn set_field(&mut self, field: &FieldTexture) {
        self.field_bind_group =
            create_field_bind_group(&self.device, &self.field_layout, &self.uniform_buffer, field);
        self.decode = field.decode_uniform();
    }

    /// Swap slots and encode one propagation step.
    ///
    /// Uniforms are written through the queue, so the encoder must be
    /// submitted before the next step is encoded.
    pub fn update(&mut self, encoder: &mut wgpu::CommandEncoder, step: &PropagatorStep) {
        self.buffers.swap();
        if self.num_particles == 0 {
            return;
        }

        let elimination_range = match step.elimination {
            EliminationMode::Age => EliminationRange::default(),
            EliminationMode::IndexRange { per_second } => {
                EliminationRange::random(&mut self.rng, per_second, step.dt, self.num_particles)
            }
        };
        let params = StepParams {
            dt: step.dt,
            max_age: self.max_age,
            aspect_ratio: step.aspect_ratio,
            speed_curve: step.speed_curve,
            elimination: step.elimination,
            elimination_range,
            num_particles: self.num_particles,
            randomise_respawn_age: step.randomise_respawn_age,
            seed: self.rng.gen(),
        };
        self.queue.write_buffer(
            &self.uniform_buffer,
            0,
            bytemuck::bytes_of(&PropagatorUniforms::new(&params, self.decode)),
        );

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Propagator Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.field_bind_group, &[]);
        pass.set_bind_group(1, &self.bind_groups[self.buffers.parity()], &[]);
        pass.dispatch_workgroups(self.num_particles.div_ceil(WORKGROUP_SIZE), 1, 1);
    }

    /// Copy the current slot back to the host. Blocks until the GPU is idle.
    pub fn read_particles(&self) -> Result<Vec<Particle>, GpuError> {
        let current = self.buffers.current();
        let state_size = self.num_particles as u64 * std::mem::size_of::<ParticleGpu>() as u64;
        let age_size = self.num_particles as u64 * std::mem::size_of::<f32>() as u64;
        if self.num_particles == 0 {
            return Ok(Vec::new());
        }

        let staging = |label: &str, size: u64| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let state_staging = staging("Particle State Staging Buffer", state_size);
        let age_staging = staging("Particle Age Staging Buffer", age_size);

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Particle Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&current.state, 0, &state_staging, 0, state_size);
        encoder.copy_buffer_to_buffer(&current.age, 0, &age_staging, 0, age_size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let states = read_buffer(&self.device, &state_staging)?;
        let ages = read_buffer(&self.device, &age_staging)?;

        Ok(states
            .chunks_exact(std::mem::size_of::<ParticleGpu>())
            .zip(ages.chunks_exact(std::mem::size_of::<f32>()))
            .map(|(state, age)| {
                Particle::from_gpu(
                    &bytemuck::pod_read_unaligned::<ParticleGpu>(state),
                    bytemuck::pod_read_unaligned::<f32>(age),
                )
            })
            .collect())
    }

    pub fn buffers(&self) -> &DoubleBuffer<ParticleBuffers> {
        &self.buffers
    }

    pub fn num_particles(&self) -> u32 {
        self.num_particles
    }

    pub fn max_age(&self) -> f32 {
        self.max_age
    }

    pub fn parity(&self) -> usize {
        self.buffers.parity()
    }

    /// Changes whenever buffers are reallocated; bind groups built from an
    /// older generation are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn read_buffer(device: &wgpu::Device, buffer: &wgpu::Buffer) -> Result<Vec<u8>, GpuError> {
    let slice = buffer.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);

    receiver
        .recv()
        .map_err(|e| GpuError::BufferMapping(e.to_string()))?
        .map_err(|e| GpuError::BufferMapping(e.to_string()))?;

    let data = slice.get_mapped_range().to_vec();
    buffer.unmap();
    Ok(data)
}

fn create_field_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    uniform_buffer: &wgpu::Buffer,
    field: &FieldTexture,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Propagator Field Bind Group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(field.view()),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(field.sampler()),
            },
        ],
    })
}

fn create_particle_bind_groups(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    buffers: &DoubleBuffer<ParticleBuffers>,
) -> [wgpu::BindGroup; 2] {
    [0, 1].map(|write| {
        let read = buffers.slot(1 - write);
        let written = buffers.slot(write);
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Propagator Particle Bind Group {write}")),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: read.state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: read.age.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: written.state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: written.age.as_entire_binding(),
                },
            ],
        })
    })
}

pub(crate) fn generate_shader() -> String {
    format!(
        r#"
struct Uniforms {{
    decode: vec4<f32>,
    speed_exponent: f32,
    speed_factor: f32,
    aspect_ratio: f32,
    dt: f32,
    max_age: f32,
    num_particles: u32,
    seed: u32,
    elimination_mode: u32,
    elimination_start: u32,
    elimination_count: u32,
    randomise_respawn_age: u32,
    _pad: u32,
}};

@group(0) @binding(0)
var<uniform> params: Uniforms;
@group(0) @binding(1)
var field: texture_2d<f32>;
@group(0) @binding(2)
var field_sampler: sampler;

@group(1) @binding(0)
var<storage, read> previous_state: array<vec4<f32>>;
@group(1) @binding(1)
var<storage, read> previous_age: array<f32>;
@group(1) @binding(2)
var<storage, read_write> next_state: array<vec4<f32>>;
@group(1) @binding(3)
var<storage, read_write> next_age: array<f32>;

const SEED_VELOCITY: f32 = {SEED_VELOCITY:e};
const STREAM_X: u32 = 0u;
const STREAM_Y: u32 = 1u;
const STREAM_AGE: u32 = 2u;

{RANDOM_WGSL}
{FIELD_WGSL}

fn transform_velocity(v: vec2<f32>) -> vec2<f32> {{
    let speed = length(v);
    if speed <= 0.0 {{
        return vec2<f32>(0.0);
    }}
    var transformed = params.speed_factor;
    if params.speed_exponent != 0.0 {{
        transformed = params.speed_factor * pow(speed, params.speed_exponent);
    }}
    return v / speed * transformed;
}}

// Clip units per second; exactly zero only where the field has no data.
fn resample_velocity(p: vec2<f32>) -> vec2<f32> {{
    let uv = clip_to_texture(p);
    if is_no_data(uv) {{
        return vec2<f32>(0.0);
    }}
    var v = transform_velocity(physical_velocity(uv, params.decode));
    v.x = v.x / params.aspect_ratio;
    if all(v == vec2<f32>(0.0)) {{
        v = vec2<f32>(SEED_VELOCITY);
    }}
    return v;
}}

fn respawn(index: u32, age: f32) {{
    let p = vec2<f32>(
        random_unit(params.seed, index, STREAM_X) * 2.0 - 1.0,
        random_unit(params.seed, index, STREAM_Y) * 2.0 - 1.0,
    );
    next_state[index] = vec4<f32>(p, resample_velocity(p));
    next_age[index] = age;
}}

fn in_elimination_range(index: u32) -> bool {{
    let n = params.num_particles;
    return (index + n - params.elimination_start % n) % n < params.elimination_count;
}}

@compute @workgroup_size({WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {{
    let index = global_id.x;
    if index >= params.num_particles {{
        return;
    }}

    let state = previous_state[index];
    let age = previous_age[index];
    let random_age = random_unit(params.seed, index, STREAM_AGE) * params.max_age;

    var eliminate = false;
    if params.elimination_mode == 0u {{
        eliminate = age > params.max_age;
    }} else {{
        eliminate = in_elimination_range(index);
    }}
    if eliminate {{
        var respawn_age = 0.0;
        if params.randomise_respawn_age != 0u {{
            respawn_age = random_age;
        }}
        respawn(index, respawn_age);
        return;
    }}

    let candidate = state.xy + state.zw * params.dt;
    if any(abs(candidate) > vec2<f32>(1.0)) {{
        respawn(index, 0.0);
        return;
    }}

    let velocity = resample_velocity(candidate);
    if all(velocity == vec2<f32>(0.0)) {{
        respawn(index, random_age);
        return;
    }}

    next_state[index] = vec4<f32>(candidate, velocity);
    next_age[index] = age + params.dt;
}}
"#
    )
}

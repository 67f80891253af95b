//! Particle state and the per-step decision rules.
//!
//! Particles live on the GPU; this module defines their memory layout and a
//! Rust rendition of the propagation kernel. The kernel in
//! [`gpu::propagator`](crate::gpu::propagator) and [`step_particle`] share the
//! same hash-based random numbers, so the Rust version reproduces the GPU's
//! decisions for a given seed and field (up to texture filtering).
//!
//! Each step every particle takes exactly one [`ParticleAction`], checked in
//! priority order:
//!
//! 1. [`Eliminate`](ParticleAction::Eliminate) - too old, or inside this
//!    step's elimination block
//! 2. [`OutOfBounds`](ParticleAction::OutOfBounds) - the advanced position
//!    leaves clip space
//! 3. [`NoField`](ParticleAction::NoField) - no velocity data at the advanced
//!    position
//! 4. [`Advance`](ParticleAction::Advance)

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use rand::Rng;

use crate::options::EliminationMode;
use crate::speed_curve::SpeedCurve;
use crate::velocity::{VelocityImage, NO_DATA};

/// Velocity given to particles seeded without a field. Small enough to be
/// invisible, non-zero so it is never mistaken for the no-data sentinel.
pub const SEED_VELOCITY: f32 = 1e-6;

/// Random streams drawn per particle per step.
const STREAM_X: u32 = 0;
const STREAM_Y: u32 = 1;
const STREAM_AGE: u32 = 2;

/// Position and velocity as stored in the particle state buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ParticleGpu {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
}

/// A particle as seen by the host.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Particle {
    pub position: Vec2,
    pub velocity: Vec2,
    pub age: f32,
}

impl Particle {
    pub fn from_gpu(gpu: &ParticleGpu, age: f32) -> Self {
        Self {
            position: Vec2::from(gpu.position),
            velocity: Vec2::from(gpu.velocity),
            age,
        }
    }

    pub fn to_gpu(&self) -> ParticleGpu {
        ParticleGpu {
            position: self.position.to_array(),
            velocity: self.velocity.to_array(),
        }
    }

    /// True when the velocity is the exact no-data sentinel.
    #[inline]
    pub fn has_no_field(&self) -> bool {
        self.velocity == Vec2::ZERO
    }
}

/// The decision taken for one particle in one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParticleAction {
    Eliminate,
    OutOfBounds,
    NoField,
    Advance,
}

/// Source of physical velocities in clip space. `None` means no data.
pub trait VelocitySampler {
    fn sample(&self, position: Vec2) -> Option<Vec2>;
}

impl VelocitySampler for VelocityImage {
    fn sample(&self, position: Vec2) -> Option<Vec2> {
        let raw = self.raw_at_clip(position);
        if raw == [NO_DATA; 2] {
            None
        } else {
            Some(self.decode().decode(raw))
        }
    }
}

impl<F: Fn(Vec2) -> Option<Vec2>> VelocitySampler for F {
    fn sample(&self, position: Vec2) -> Option<Vec2> {
        self(position)
    }
}

/// Contiguous, wrapping block of particle indices eliminated in one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct EliminationRange {
    pub start: u32,
    pub count: u32,
}

impl EliminationRange {
    /// Pick a random block of `floor(per_second * dt)` particles.
    pub fn random<R: Rng>(rng: &mut R, per_second: f32, dt: f32, num_particles: u32) -> Self {
        if num_particles == 0 {
            return Self::default();
        }
        let count = ((per_second * dt).floor().max(0.0) as u32).min(num_particles);
        Self {
            start: rng.gen_range(0..num_particles),
            count,
        }
    }

    pub fn contains(&self, index: u32, num_particles: u32) -> bool {
        if num_particles == 0 {
            return false;
        }
        (index + num_particles - self.start % num_particles) % num_particles < self.count
    }
}

/// Everything a single propagation step depends on.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct StepParams {
    pub dt: f32,
    pub max_age: f32,
    /// Surface width over height.
    pub aspect_ratio: f32,
    pub speed_curve: SpeedCurve,
    pub elimination: EliminationMode,
    pub elimination_range: EliminationRange,
    pub num_particles: u32,
    /// Respawn eliminated particles with random ages instead of zero.
    pub randomise_respawn_age: bool,
    pub seed: u32,
}

/// PCG hash, identical to `pcg_hash` in the propagation kernel.
#[inline]
pub fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Uniform random number in `[0, 1)` for a particle and stream.
#[inline]
pub fn random_unit(seed: u32, index: u32, stream: u32) -> f32 {
    let h = pcg_hash(seed ^ pcg_hash(index.wrapping_mul(4).wrapping_add(stream)));
    (h >> 8) as f32 / 16_777_216.0
}

/// Velocity in clip units per second at `position`, or zero without data.
///
/// The speed curve is applied to the physical magnitude and the horizontal
/// component divided by the aspect ratio so that motion is isotropic on
/// screen.
pub fn resample_velocity<S: VelocitySampler + ?Sized>(
    field: &S,
    position: Vec2,
    speed_curve: &SpeedCurve,
    aspect_ratio: f32,
) -> Vec2 {
    let Some(physical) = field.sample(position) else {
        return Vec2::ZERO;
    };
    let mut velocity = speed_curve.transform_velocity(physical);
    velocity.x /= aspect_ratio;
    if velocity == Vec2::ZERO {
        // Genuinely still water must not read as missing data.
        velocity = Vec2::splat(SEED_VELOCITY);
    }
    velocity
}

#[inline]
fn in_clip_space(position: Vec2) -> bool {
    position.x.abs() <= 1.0 && position.y.abs() <= 1.0
}

fn respawn<S: VelocitySampler + ?Sized>(
    index: u32,
    age: f32,
    field: &S,
    params: &StepParams,
) -> Particle {
    let position = Vec2::new(
        random_unit(params.seed, index, STREAM_X) * 2.0 - 1.0,
        random_unit(params.seed, index, STREAM_Y) * 2.0 - 1.0,
    );
    Particle {
        position,
        velocity: resample_velocity(field, position, &params.speed_curve, params.aspect_ratio),
        age,
    }
}

/// Advance one particle by one step.
pub fn step_particle<S: VelocitySampler + ?Sized>(
    index: u32,
    particle: &Particle,
    field: &S,
    params: &StepParams,
) -> (ParticleAction, Particle) {
    let random_age = random_unit(params.seed, index, STREAM_AGE) * params.max_age;

    let eliminate = match params.elimination {
        EliminationMode::Age => particle.age > params.max_age,
        EliminationMode::IndexRange { .. } => params
            .elimination_range
            .contains(index, params.num_particles),
    };
    if eliminate {
        let age = if params.randomise_respawn_age { random_age } else { 0.0 };
        return (ParticleAction::Eliminate, respawn(index, age, field, params));
    }

    let candidate = particle.position + particle.velocity * params.dt;
    if !in_clip_space(candidate) {
        return (ParticleAction::OutOfBounds, respawn(index, 0.0, field, params));
    }

    let velocity = resample_velocity(field, candidate, &params.speed_curve, params.aspect_ratio);
    if velocity == Vec2::ZERO {
        return (ParticleAction::NoField, respawn(index, random_age, field, params));
    }

    (
        ParticleAction::Advance,
        Particle {
            position: candidate,
            velocity,
            age: particle.age + params.dt,
        },
    )
}

/// Advance a whole population in place, returning how many took each action.
pub fn step_all<S: VelocitySampler + ?Sized>(
    particles: &mut [Particle],
    field: &S,
    params: &StepParams,
) -> ActionCounts {
    let mut counts = ActionCounts::default();
    for (i, particle) in particles.iter_mut().enumerate() {
        let (action, next) = step_particle(i as u32, particle, field, params);
        counts.record(action);
        *particle = next;
    }
    counts
}

/// Tally of actions in one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ActionCounts {
    pub eliminated: u32,
    pub out_of_bounds: u32,
    pub no_field: u32,
    pub advanced: u32,
}

impl ActionCounts {
    fn record(&mut self, action: ParticleAction) {
        match action {
            ParticleAction::Eliminate => self.eliminated += 1,
            ParticleAction::OutOfBounds => self.out_of_bounds += 1,
            ParticleAction::NoField => self.no_field += 1,
            ParticleAction::Advance => self.advanced += 1,
        }
    }
}

/// Fresh particles with uniform random positions and ages in `[0, max_age)`.
///
/// With a field, velocities are sampled at the seed positions; without one,
/// they get [`SEED_VELOCITY`].
pub fn seed_particles<R: Rng>(
    rng: &mut R,
    count: u32,
    max_age: f32,
    initial_velocity: Option<&dyn Fn(Vec2) -> Vec2>,
) -> Vec<Particle> {
    (0..count)
        .map(|_| {
            let position = Vec2::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
            let age = if max_age > 0.0 { rng.gen_range(0.0..max_age) } else { 0.0 };
            let velocity = match initial_velocity {
                Some(f) => f(position),
                None => Vec2::splat(SEED_VELOCITY),
            };
            Particle {
                position,
                velocity,
                age,
            }
        })
        .collect()
}

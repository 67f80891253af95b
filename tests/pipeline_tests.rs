//! Integration tests for the particle model and the visualiser lifecycle.
//!
//! The CPU model in `streamlines::particle` mirrors the propagation kernel,
//! so most invariants are checked there. Tests that need a device skip
//! themselves when no adapter is available.

use glam::Vec2;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use streamlines::gpu::GpuContext;
use streamlines::particle::{
    resample_velocity, seed_particles, step_all, EliminationRange, Particle, StepParams,
};
use streamlines::visualiser::{compute_substeps, min_timestep, MAX_SUBSTEPS};
use streamlines::{
    ColorMap, EliminationMode, GpuError, LinearDecode, OptionsUpdate, Palette, SpeedCurve, VelocityImage,
    Visualiser, VisualiserError, VisualiserOptions, VisualiserState,
};

// ============================================================================
// Particle model
// ============================================================================

fn params(dt: f32, max_age: f32, num_particles: u32) -> StepParams {
    StepParams {
        dt,
        max_age,
        aspect_ratio: 1.0,
        speed_curve: SpeedCurve::linear(1.0),
        elimination: EliminationMode::Age,
        elimination_range: EliminationRange::default(),
        num_particles,
        randomise_respawn_age: false,
        seed: 0,
    }
}

fn swirl(position: Vec2) -> Option<Vec2> {
    if position.length() < 0.1 {
        None
    } else {
        Some(Vec2::new(-position.y, position.x) * 3.0 + Vec2::new(0.5, 0.2))
    }
}

#[test]
fn test_particles_stay_in_clip_space_with_bounded_age() {
    let mut rng = SmallRng::seed_from_u64(1);
    let max_age = 1.5;
    let dt = 0.05;
    let field = |p: Vec2| swirl(p);
    let initial = |p: Vec2| resample_velocity(&field, p, &SpeedCurve::linear(1.0), 1.0);
    let initial: &dyn Fn(Vec2) -> Vec2 = &initial;
    let mut particles = seed_particles(&mut rng, 2000, max_age, Some(initial));

    for frame in 0..200u32 {
        let mut step = params(dt, max_age, particles.len() as u32);
        step.seed = frame;
        step_all(&mut particles, &field, &step);

        for particle in &particles {
            assert!(particle.position.x.abs() <= 1.0 && particle.position.y.abs() <= 1.0);
            assert!(particle.age >= 0.0 && particle.age <= max_age + dt, "age {}", particle.age);
        }
    }
}

#[test]
fn test_uniform_field_moves_particles_uniformly() {
    let field = |_: Vec2| Some(Vec2::X);
    let aspect_ratio = 2.0;
    let curve = SpeedCurve::linear(1.0);
    let mut particles = vec![Particle {
        position: Vec2::ZERO,
        velocity: resample_velocity(&field, Vec2::ZERO, &curve, aspect_ratio),
        age: 0.0,
    }];

    let mut step = params(0.1, 10.0, 1);
    step.aspect_ratio = aspect_ratio;
    let counts = step_all(&mut particles, &field, &step);

    assert_eq!(counts.advanced, 1);
    assert!((particles[0].position.x - 0.05).abs() < 1e-6);
    assert!(particles[0].position.y.abs() < 1e-6);
    assert!((particles[0].age - 0.1).abs() < 1e-6);
}

#[test]
fn test_empty_field_spreads_respawn_ages() {
    let mut rng = SmallRng::seed_from_u64(2);
    let max_age = 4.0;
    let field = |_: Vec2| -> Option<Vec2> { None };
    let mut particles = seed_particles(&mut rng, 1000, max_age, None);
    for particle in &mut particles {
        particle.velocity = Vec2::ZERO;
        particle.age = 0.0;
    }

    let mut step = params(0.016, max_age, 1000);
    step.randomise_respawn_age = true;
    let counts = step_all(&mut particles, &field, &step);

    assert_eq!(counts.no_field, 1000);
    assert!(particles.iter().all(|p| p.velocity == Vec2::ZERO));
    let min = particles.iter().map(|p| p.age).fold(f32::MAX, f32::min);
    let max = particles.iter().map(|p| p.age).fold(f32::MIN, f32::max);
    assert!(min < 0.2 * max_age);
    assert!(max > 0.8 * max_age && max < max_age);
}

#[test]
fn test_index_range_elimination_count() {
    let field = |_: Vec2| Some(Vec2::splat(1e-3));
    let curve = SpeedCurve::linear(1.0);
    let mut particles: Vec<Particle> = (0..100)
        .map(|i| {
            let position = Vec2::new(i as f32 / 100.0 - 0.5, 0.0);
            Particle {
                position,
                velocity: resample_velocity(&field, position, &curve, 1.0),
                age: 0.0,
            }
        })
        .collect();

    let mut step = params(0.1, 1.0, 100);
    step.elimination = EliminationMode::IndexRange { per_second: 100.0 };
    step.elimination_range = EliminationRange { start: 95, count: 10 };
    let counts = step_all(&mut particles, &field, &step);

    assert_eq!(counts.eliminated, 10);
    assert_eq!(counts.advanced, 90);
}

#[test]
fn test_decoded_image_drives_particles() {
    let decode = LinearDecode::new(2.0, -1.0, 2.0, -1.0);
    let image = VelocityImage::from_fn(8, 8, decode, |x, _| if x < 4 { None } else { Some(Vec2::Y) });
    let curve = SpeedCurve::linear(1.0);

    // Left half has no data, right half flows upward.
    assert_eq!(resample_velocity(&image, Vec2::new(-0.5, 0.0), &curve, 1.0), Vec2::ZERO);
    let velocity = resample_velocity(&image, Vec2::new(0.5, 0.0), &curve, 1.0);
    assert!(velocity.x.abs() < 0.01);
    assert!((velocity.y - 1.0).abs() < 0.01);
}

// ============================================================================
// Substeps
// ============================================================================

#[test]
fn test_substeps_respect_displacement_limit() {
    let curve = SpeedCurve::linear(1.0);
    let dt_min = min_timestep(1.0, &curve, Vec2::new(0.3, 0.4), 720);
    // 0.5 clip units per second at 360 px per unit.
    assert!((dt_min - 1.0 / 180.0).abs() < 1e-6);

    for frame_ms in [1.0f32, 8.0, 16.7, 33.3, 100.0, 1000.0] {
        let dt = frame_ms / 1000.0;
        let (n, dt_sub) = compute_substeps(dt, dt_min);
        assert!((1..=MAX_SUBSTEPS).contains(&n));
        assert!((dt_sub * n as f32 - dt).abs() < 1e-5);
        if n > 1 && n < MAX_SUBSTEPS {
            assert!(dt_sub < 2.0 * dt_min);
        }
    }
}

// ============================================================================
// Visualiser lifecycle (needs a GPU)
// ============================================================================

fn gpu_context() -> Option<GpuContext> {
    match pollster::block_on(GpuContext::new_headless()) {
        Ok(context) => Some(context),
        Err(e) => {
            eprintln!("Skipping GPU test: {e}");
            None
        }
    }
}

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

fn target_view(context: &GpuContext, width: u32, height: u32) -> wgpu::TextureView {
    let texture = context.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Test Target"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn small_options() -> VisualiserOptions {
    VisualiserOptions {
        num_particles: 256,
        ..Default::default()
    }
}

fn color_map() -> ColorMap {
    ColorMap::from_palette(Palette::Viridis, 0.0, 1.0)
}

#[test]
fn test_methods_before_initialise_fail() {
    let Some(context) = gpu_context() else { return };
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 64, 64, small_options());

    assert!(matches!(visualiser.start(), Err(VisualiserError::NotInitialised)));
    assert!(matches!(visualiser.set_num_particles(10), Err(VisualiserError::NotInitialised)));
    assert!(matches!(
        visualiser.update_options(OptionsUpdate::default()),
        Err(VisualiserError::NotInitialised)
    ));
    assert_eq!(visualiser.state(), VisualiserState::Uninitialised);
}

#[test]
fn test_lifecycle() {
    let Some(context) = gpu_context() else { return };
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 64, 64, small_options());

    visualiser.initialise(color_map()).unwrap();
    assert_eq!(visualiser.state(), VisualiserState::Stopped);
    visualiser.initialise(color_map()).unwrap();
    assert_eq!(visualiser.state(), VisualiserState::Stopped);

    visualiser.start().unwrap();
    assert!(visualiser.is_running());
    visualiser.stop().unwrap();
    assert_eq!(visualiser.state(), VisualiserState::Stopped);

    visualiser.destruct();
    assert_eq!(visualiser.state(), VisualiserState::Destructed);
    assert!(matches!(visualiser.start(), Err(VisualiserError::Destructed)));
    assert!(matches!(visualiser.initialise(color_map()), Err(VisualiserError::Destructed)));
}

#[test]
fn test_frames_flip_parity_and_keep_particles_in_bounds() {
    let Some(context) = gpu_context() else { return };
    let view = target_view(&context, 64, 64);
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 64, 64, small_options());
    visualiser.initialise(color_map()).unwrap();

    let decode = LinearDecode::new(2.0, -1.0, 2.0, -1.0);
    let image = VelocityImage::from_fn(16, 16, decode, |_, _| Some(Vec2::new(0.5, 0.25)));
    visualiser.set_velocity_image(image, true).unwrap();
    visualiser.start().unwrap();

    let before = visualiser.parity().unwrap();
    visualiser.render_frame(0.0, &view).unwrap();
    let after = visualiser.parity().unwrap();
    assert_ne!(before, after);

    for _ in 0..10 {
        visualiser.render_frame(0.016, &view).unwrap();
    }

    let particles = visualiser.read_particles().unwrap();
    assert_eq!(particles.len(), 256);
    for particle in &particles {
        assert!(particle.position.x.abs() <= 1.0 && particle.position.y.abs() <= 1.0);
        assert!(particle.age >= 0.0);
    }
}

#[test]
fn test_stopped_visualiser_does_not_advance() {
    let Some(context) = gpu_context() else { return };
    let view = target_view(&context, 32, 32);
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 32, 32, small_options());
    visualiser.initialise(color_map()).unwrap();

    let before = visualiser.parity();
    visualiser.render_frame(0.016, &view).unwrap();
    assert_eq!(visualiser.parity(), before);
}

#[test]
fn test_set_num_particles_reallocates() {
    let Some(context) = gpu_context() else { return };
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 32, 32, small_options());
    visualiser.initialise(color_map()).unwrap();

    visualiser.set_num_particles(1000).unwrap();
    assert_eq!(visualiser.options().num_particles, 1000);
    assert_eq!(visualiser.read_particles().unwrap().len(), 1000);
}

#[test]
fn test_oversized_particle_count_is_rejected() {
    let Some(context) = gpu_context() else { return };
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 32, 32, small_options());
    visualiser.initialise(color_map()).unwrap();

    let result = visualiser.set_num_particles(u32::MAX);
    assert!(
        matches!(result, Err(VisualiserError::Gpu(GpuError::LimitExceeded { .. }))),
        "got {result:?}"
    );
    assert_eq!(visualiser.options().num_particles, 256);
    assert_eq!(visualiser.read_particles().unwrap().len(), 256);
}

#[test]
fn test_oversized_field_and_targets_are_rejected() {
    let Some(context) = gpu_context() else { return };
    let too_wide = context.device.limits().max_texture_dimension_2d + 1;
    let view = target_view(&context, 32, 32);
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 32, 32, small_options());
    visualiser.initialise(color_map()).unwrap();
    visualiser.start().unwrap();

    let decode = LinearDecode::new(4.0, -2.0, 4.0, -2.0);
    let wide = VelocityImage::from_fn(too_wide, 1, decode, |_, _| Some(Vec2::X));
    assert!(matches!(
        visualiser.set_velocity_image(wide, true),
        Err(VisualiserError::Gpu(GpuError::LimitExceeded { .. }))
    ));
    assert!(visualiser.velocity_image().is_none());

    assert!(matches!(
        visualiser.set_dimensions(too_wide, 32),
        Err(VisualiserError::Gpu(GpuError::LimitExceeded { .. }))
    ));
    assert_eq!(visualiser.dimensions(), (32, 32));
    visualiser.render_frame(0.016, &view).unwrap();
}

#[test]
fn test_parity_round_trip_after_reallocation() {
    let Some(context) = gpu_context() else { return };
    let view = target_view(&context, 32, 32);
    let mut visualiser = Visualiser::new(context, TARGET_FORMAT, 32, 32, small_options());
    visualiser.initialise(color_map()).unwrap();
    visualiser.start().unwrap();

    visualiser.set_num_particles(512).unwrap();
    let seeded = visualiser.parity().unwrap();
    visualiser.render_frame(0.0, &view).unwrap();
    assert_ne!(visualiser.parity().unwrap(), seeded);
    visualiser.render_frame(0.0, &view).unwrap();
    assert_eq!(visualiser.parity().unwrap(), seeded);

    let particles = visualiser.read_particles().unwrap();
    assert_eq!(particles.len(), 512);
    assert!(particles.iter().all(|p| p.position.abs().max_element() <= 1.0));
}

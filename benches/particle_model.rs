//! Benchmarks for the CPU particle model and host-side preparation.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::Vec2;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use streamlines::colormap::{ColorMap, Palette, RAMP_WIDTH};
use streamlines::options::EliminationMode;
use streamlines::particle::{
    resample_velocity, seed_particles, step_all, EliminationRange, StepParams, VelocitySampler,
};
use streamlines::speed_curve::SpeedCurve;
use streamlines::velocity::{LinearDecode, VelocityImage};

fn vortex_image(size: u32) -> VelocityImage {
    let decode = LinearDecode::new(4.0, -2.0, 4.0, -2.0);
    VelocityImage::from_fn(size, size, decode, |x, y| {
        let p = Vec2::new(x as f32 / size as f32 - 0.5, 0.5 - y as f32 / size as f32);
        if p.length() < 0.05 {
            None
        } else {
            Some(Vec2::new(-p.y, p.x) * 3.0)
        }
    })
}

fn bench_step_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_all");
    let image = vortex_image(256);
    let curve = SpeedCurve::from_exponent_factor_and_speed(0.5, 0.3, 1.5);

    for count in [1_000u32, 10_000, 100_000] {
        let mut rng = SmallRng::seed_from_u64(7);
        let initial = |p: Vec2| resample_velocity(&image, p, &curve, 1.6);
        let initial: &dyn Fn(Vec2) -> Vec2 = &initial;
        let mut particles = seed_particles(&mut rng, count, 4.0, Some(initial));
        let mut params = StepParams {
            dt: 0.016,
            max_age: 4.0,
            aspect_ratio: 1.6,
            speed_curve: curve,
            elimination: EliminationMode::Age,
            elimination_range: EliminationRange::default(),
            num_particles: count,
            randomise_respawn_age: false,
            seed: 0,
        };

        group.bench_with_input(BenchmarkId::new("vortex", count), &count, |b, _| {
            b.iter(|| {
                params.seed = params.seed.wrapping_add(1);
                black_box(step_all(&mut particles, &image, &params))
            })
        });
    }

    group.finish();
}

fn bench_sampling(c: &mut Criterion) {
    let image = vortex_image(512);
    let points: Vec<Vec2> = (0..1024)
        .map(|i| {
            let t = i as f32 / 1024.0;
            Vec2::new((t * 37.0).sin(), (t * 23.0).cos()) * 0.99
        })
        .collect();

    c.bench_function("sample_1024_points", |b| {
        b.iter(|| {
            points
                .iter()
                .filter_map(|&p| image.sample(black_box(p)))
                .count()
        })
    });
}

fn bench_field_preparation(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_preparation");

    for size in [128u32, 512] {
        group.bench_with_input(BenchmarkId::new("from_fn", size), &size, |b, &size| {
            b.iter(|| black_box(vortex_image(size)))
        });
        let image = vortex_image(size);
        group.bench_with_input(BenchmarkId::new("is_all_no_data", size), &image, |b, image| {
            b.iter(|| black_box(image.is_all_no_data()))
        });
    }

    group.finish();
}

fn bench_color_ramp(c: &mut Criterion) {
    let json = r##"{"colourMap":[
        {"lowerValue":0.0,"color":"#081d58"},
        {"lowerValue":0.25,"color":"#225ea8"},
        {"lowerValue":0.5,"color":"#41b6c4"},
        {"lowerValue":1.0,"color":"#c7e9b4"},
        {"lowerValue":2.0,"color":"#ffffd9"}
    ]}"##;

    c.bench_function("legend_json_parse", |b| {
        b.iter(|| black_box(ColorMap::from_legend_json(black_box(json))))
    });

    let map = ColorMap::from_palette(Palette::Viridis, 0.0, 2.0);
    c.bench_function("ramp_256", |b| b.iter(|| black_box(map.ramp(RAMP_WIDTH))));
}

criterion_group!(
    benches,
    bench_step_all,
    bench_sampling,
    bench_field_preparation,
    bench_color_ramp,
);
criterion_main!(benches);

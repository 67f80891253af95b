//! The streamline visualiser: lifecycle, options and per-frame sequencing.
//!
//! A [`Visualiser`] starts [`Uninitialised`](VisualiserState::Uninitialised).
//! [`initialise`](Visualiser::initialise) builds every GPU stage and leaves it
//! [`Stopped`](VisualiserState::Stopped); [`start`](Visualiser::start) and
//! [`stop`](Visualiser::stop) toggle animation, and
//! [`destruct`](Visualiser::destruct) releases GPU resources for good.
//!
//! Each frame is split into substeps so that no particle moves more than
//! `max_displacement` pixels per step. Every substep fades the previous
//! trail image into the current one, advances particles, and draws them on
//! top. The last trail image is then composited onto the target and the
//! trail targets swap for the next frame.

use std::path::Path;

use glam::Vec2;

use crate::bbox::BoundingBoxScaling;
use crate::colormap::{ColorMap, ColorScaleRange};
use crate::error::{FetchError, GpuError, VisualiserError};
use crate::gpu::{
    check_limit, check_texture_size, max_particles, with_error_scopes, CompositeParams, Compositor,
    FieldTexture, GpuContext, ParticleRenderer, Propagator, PropagatorStep, ScopeKind, Sprite,
    TrailAccumulator,
};
use crate::options::{OptionsUpdate, VisualiserOptions};
use crate::particle::Particle;
use crate::speed_curve::SpeedCurve;
use crate::velocity::VelocityImage;

/// Upper bound on substeps per frame.
pub const MAX_SUBSTEPS: u32 = 32;

/// Frames longer than this fraction of `max_age` respawn with random ages.
const AGE_RESYNC_FRACTION: f32 = 0.1;

/// Longest substep for which the fastest particle moves at most
/// `max_displacement` pixels.
///
/// Clip space spans `height / 2` pixels per unit vertically; the aspect
/// correction applied to horizontal velocity makes the same hold
/// horizontally. Returns infinity when nothing can move.
pub fn min_timestep(max_displacement: f32, speed_curve: &SpeedCurve, max_velocity: Vec2, height: u32) -> f32 {
    let pixels_per_second = speed_curve.transform_speed(max_velocity.length()) * height as f32 * 0.5;
    if pixels_per_second <= 0.0 {
        return f32::INFINITY;
    }
    max_displacement.max(0.0) / pixels_per_second
}

/// Number and length of substeps for a frame of `dt` seconds.
///
/// Always at least one and at most [`MAX_SUBSTEPS`] substeps of equal length.
pub fn compute_substeps(dt: f32, dt_min: f32) -> (u32, f32) {
    let substeps = if dt > dt_min {
        if dt_min > 0.0 {
            ((dt / dt_min).floor() as u32).clamp(1, MAX_SUBSTEPS)
        } else {
            MAX_SUBSTEPS
        }
    } else {
        1
    };
    (substeps, dt / substeps as f32)
}

/// Per-frame facts about the current velocity field, computed once per upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSummary {
    pub max_velocity: Vec2,
    pub all_no_data: bool,
}

impl FieldSummary {
    /// No field loaded yet.
    pub const EMPTY: Self = Self {
        max_velocity: Vec2::ZERO,
        all_no_data: true,
    };

    pub fn of(image: &VelocityImage) -> Self {
        Self {
            max_velocity: image.max_velocity(),
            all_no_data: image.is_all_no_data(),
        }
    }
}

/// How a frame of `dt` seconds is stepped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePlan {
    pub substeps: u32,
    pub dt_sub: f32,
    /// Respawned particles get random ages instead of zero.
    pub randomise_respawn_age: bool,
    /// Trail opacity removed per substep.
    pub fade_amount: f32,
}

/// Plan a frame from the options and the current field.
///
/// Non-finite or negative `dt` is treated as zero. Long frames and fields
/// without data randomise respawn ages so particles never move in lockstep.
pub fn plan_frame(
    dt: f32,
    options: &VisualiserOptions,
    speed_curve: &SpeedCurve,
    field: &FieldSummary,
    height: u32,
) -> FramePlan {
    let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
    let dt_min = min_timestep(options.max_displacement, speed_curve, field.max_velocity, height);
    let (substeps, dt_sub) = compute_substeps(dt, dt_min);
    FramePlan {
        substeps,
        dt_sub,
        randomise_respawn_age: dt > AGE_RESYNC_FRACTION * options.max_age || field.all_no_data,
        fade_amount: options.fade_amount_per_second * dt_sub,
    }
}

/// Lifecycle of a [`Visualiser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualiserState {
    Uninitialised,
    Stopped,
    Running,
    Destructed,
}

/// Called with upstream failures that stopped the animation.
pub type ErrorCallback = Box<dyn FnMut(&FetchError)>;

/// Apply a reallocation under error scopes, re-applying `previous` if the
/// device rejects `value` so no invalid resource stays bound.
fn reallocate<T, V: Copy>(
    device: &wgpu::Device,
    label: &str,
    target: &mut T,
    value: V,
    previous: V,
    apply: impl Fn(&mut T, V),
) -> Result<(), GpuError> {
    let result = with_error_scopes(device, label, ScopeKind::Resource, || apply(target, value));
    if let Err(error) = result {
        let restored = with_error_scopes(device, label, ScopeKind::Resource, || apply(target, previous));
        if let Err(restore_error) = restored {
            log::error!("Failed to restore '{label}': {restore_error}");
        }
        return Err(error);
    }
    Ok(())
}

fn create_sprite(context: &GpuContext, image: &image::RgbaImage) -> Result<Sprite, GpuError> {
    let limits = context.device.limits();
    check_texture_size(&limits, "Sprite Texture", image.width(), image.height())?;
    with_error_scopes(&context.device, "Sprite Texture", ScopeKind::Resource, || {
        Sprite::from_image(&context.device, &context.queue, image)
    })
}

/// Decode any image format the `image` crate understands into a sprite.
fn load_sprite(context: &GpuContext, path: &Path) -> Result<Sprite, VisualiserError> {
    let image = image::open(path)?.to_rgba8();
    Ok(create_sprite(context, &image)?)
}

struct Pipeline {
    field: FieldTexture,
    propagator: Propagator,
    renderer: ParticleRenderer,
    trail: TrailAccumulator,
    compositor: Compositor,
}

/// Animated streamlines over a velocity field.
pub struct Visualiser {
    context: GpuContext,
    surface_format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    options: VisualiserOptions,
    state: VisualiserState,
    pipeline: Option<Pipeline>,
    color_map: Option<ColorMap>,
    /// Host copy of the current field, used for seeding and timestep bounds.
    velocity_image: Option<VelocityImage>,
    field_summary: FieldSummary,
    speed_curve: SpeedCurve,
    bbox_scaling: BoundingBoxScaling,
    on_error: Option<ErrorCallback>,
}

impl Visualiser {
    /// Create an uninitialised visualiser drawing into `surface_format` targets.
    pub fn new(
        context: GpuContext,
        surface_format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        options: VisualiserOptions,
    ) -> Self {
        Self {
            context,
            surface_format,
            width: width.max(1),
            height: height.max(1),
            speed_curve: SpeedCurve::linear(options.speed_factor),
            options,
            state: VisualiserState::Uninitialised,
            pipeline: None,
            color_map: None,
            velocity_image: None,
            field_summary: FieldSummary::EMPTY,
            bbox_scaling: BoundingBoxScaling::IDENTITY,
            on_error: None,
        }
    }

    /// Build shaders, buffers and targets. A second call does nothing.
    pub fn initialise(&mut self, color_map: ColorMap) -> Result<(), VisualiserError> {
        match self.state {
            VisualiserState::Destructed => return Err(VisualiserError::Destructed),
            VisualiserState::Uninitialised => {}
            VisualiserState::Stopped | VisualiserState::Running => {
                log::debug!("Visualiser already initialised");
                return Ok(());
            }
        }

        let context = &self.context;
        let (width, height) = (self.width, self.height);
        let (surface_format, options) = (self.surface_format, &self.options);
        let limits = context.device.limits();
        check_limit(
            "Particle State Buffer",
            u64::from(options.num_particles),
            u64::from(max_particles(&limits)),
        )?;
        check_texture_size(&limits, "Trail Texture", width, height)?;

        let mut pipeline = with_error_scopes(&context.device, "streamline pipeline", ScopeKind::Pipeline, || {
            let field = FieldTexture::empty(&context.device, &context.queue);
            let propagator = Propagator::new(context, &field, options.num_particles, options.max_age);
            let renderer = ParticleRenderer::new(context, surface_format, &propagator);
            let trail = TrailAccumulator::new(context, width, height);
            let compositor = Compositor::new(context, surface_format, &color_map);
            Pipeline {
                field,
                propagator,
                renderer,
                trail,
                compositor,
            }
        })?;
        if let Some(path) = &self.options.sprite_path {
            let sprite = load_sprite(&self.context, path)?;
            pipeline.renderer.set_sprite(Some(sprite));
        }

        self.pipeline = Some(pipeline);
        self.color_map = Some(color_map);
        self.update_speed_curve();
        self.state = VisualiserState::Stopped;
        log::info!(
            "Visualiser initialised: {} particles, {}x{}",
            self.options.num_particles,
            self.width,
            self.height
        );
        Ok(())
    }

    fn ensure_initialised(&self) -> Result<(), VisualiserError> {
        match self.state {
            VisualiserState::Uninitialised => Err(VisualiserError::NotInitialised),
            VisualiserState::Destructed => Err(VisualiserError::Destructed),
            VisualiserState::Stopped | VisualiserState::Running => Ok(()),
        }
    }

    fn pipeline_mut(pipeline: &mut Option<Pipeline>) -> Result<&mut Pipeline, VisualiserError> {
        pipeline.as_mut().ok_or(VisualiserError::NotInitialised)
    }

    pub fn start(&mut self) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        self.state = VisualiserState::Running;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        self.state = VisualiserState::Stopped;
        Ok(())
    }

    /// Resize the trail targets to the drawable size.
    ///
    /// Sizes beyond the device's texture limit fail and keep the old targets.
    pub fn set_dimensions(&mut self, width: u32, height: u32) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        let size = (width.max(1), height.max(1));
        check_texture_size(&self.context.device.limits(), "Trail Texture", size.0, size.1)?;
        let trail = &mut Self::pipeline_mut(&mut self.pipeline)?.trail;
        let previous = trail.size();
        reallocate(&self.context.device, "Trail Texture", trail, size, previous, |trail, (w, h)| {
            trail.resize(w, h)
        })?;
        (self.width, self.height) = size;
        log::debug!("Visualiser resized to {}x{}", self.width, self.height);
        Ok(())
    }

    /// Reallocate and reseed the particle buffers.
    ///
    /// Counts whose state buffer exceeds the device limits fail with
    /// [`GpuError::LimitExceeded`] and leave the particles untouched.
    pub fn set_num_particles(&mut self, num_particles: u32) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        let limit = max_particles(&self.context.device.limits());
        check_limit("Particle State Buffer", u64::from(num_particles), u64::from(limit))?;

        let aspect_ratio = self.aspect_ratio();
        let (field, curve) = (self.velocity_image.as_ref(), &self.speed_curve);
        let propagator = &mut Self::pipeline_mut(&mut self.pipeline)?.propagator;
        let previous = propagator.num_particles();
        reallocate(
            &self.context.device,
            "Particle State Buffer",
            propagator,
            num_particles,
            previous,
            |propagator, n| propagator.set_num_particles(n, field, curve, aspect_ratio),
        )?;
        self.options.num_particles = num_particles;
        log::info!("Particle count set to {num_particles}");
        Ok(())
    }

    /// Replace the colour map. The speed curve is recalibrated to its range.
    pub fn set_color_map(&mut self, color_map: ColorMap) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        Self::pipeline_mut(&mut self.pipeline)?
            .compositor
            .set_color_map(&color_map);
        self.color_map = Some(color_map);
        self.update_speed_curve();
        Ok(())
    }

    /// Upload a new velocity field. With `reset`, particles are reseeded
    /// and trails cleared; otherwise they continue in the new field.
    ///
    /// A field the device cannot hold fails and keeps the previous one.
    pub fn set_velocity_image(&mut self, image: VelocityImage, reset: bool) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        let aspect_ratio = self.aspect_ratio();
        let image = image.with_filter(self.options.field_filter);
        let (device, queue) = (&self.context.device, &self.context.queue);
        check_texture_size(&device.limits(), "Velocity Field Texture", image.width(), image.height())?;
        let pipeline = Self::pipeline_mut(&mut self.pipeline)?;

        let field = with_error_scopes(device, "Velocity Field Texture", ScopeKind::Resource, || {
            FieldTexture::new(device, queue, &image)
        })?;
        pipeline.propagator.set_field(&field);
        pipeline.field = field;

        if reset {
            pipeline
                .propagator
                .reset(Some(&image), &self.speed_curve, aspect_ratio);
            let mut encoder = self
                .context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Trail Reset Encoder"),
                });
            pipeline.trail.clear(&mut encoder);
            self.context.queue.submit(std::iter::once(encoder.finish()));
        }

        let summary = FieldSummary::of(&image);
        if summary.all_no_data {
            log::warn!("Velocity field {}x{} contains no data", image.width(), image.height());
        } else {
            log::info!("Velocity field updated: {}x{}", image.width(), image.height());
        }
        self.field_summary = summary;
        self.velocity_image = Some(image);
        Ok(())
    }

    /// Merge a partial options update, rebuilding whatever it invalidates.
    ///
    /// A sprite that fails to load keeps the previous sprite and path.
    pub fn update_options(&mut self, update: OptionsUpdate) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        let previous_sprite = self.options.sprite_path.clone();
        let changes = update.apply(&mut self.options);

        if changes.speed_curve {
            self.update_speed_curve();
        }

        let aspect_ratio = self.aspect_ratio();
        let pipeline = Self::pipeline_mut(&mut self.pipeline)?;
        if changes.max_age {
            pipeline.propagator.set_max_age(
                self.options.max_age,
                self.velocity_image.as_ref(),
                &self.speed_curve,
                aspect_ratio,
            );
        }
        if changes.field_filter {
            let (device, filter) = (&self.context.device, self.options.field_filter);
            with_error_scopes(device, "Velocity Field Sampler", ScopeKind::Resource, || {
                pipeline.field.set_filter(device, filter);
                pipeline.propagator.set_field(&pipeline.field);
            })?;
            if let Some(image) = self.velocity_image.take() {
                self.velocity_image = Some(image.with_filter(self.options.field_filter));
            }
        }
        if changes.sprite {
            let loaded = self
                .options
                .sprite_path
                .as_deref()
                .map(|path| load_sprite(&self.context, path))
                .transpose();
            match loaded {
                Ok(sprite) => pipeline.renderer.set_sprite(sprite),
                Err(error) => {
                    self.options.sprite_path = previous_sprite;
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Use an in-memory sprite for the overlay pass, or remove it.
    pub fn set_sprite(&mut self, image: Option<&image::RgbaImage>) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        let sprite = image
            .map(|image| create_sprite(&self.context, image))
            .transpose()?;
        Self::pipeline_mut(&mut self.pipeline)?.renderer.set_sprite(sprite);
        Ok(())
    }

    /// Remap applied when compositing, for views that moved since the field
    /// was fetched.
    pub fn set_bounding_box_scaling(&mut self, scaling: BoundingBoxScaling) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        self.bbox_scaling = scaling;
        Ok(())
    }

    pub fn set_error_callback(&mut self, callback: impl FnMut(&FetchError) + 'static) {
        self.on_error = Some(Box::new(callback));
    }

    /// Apply the outcome of a velocity fetch.
    ///
    /// Failures stop the animation and keep the previous field. Aborted
    /// fetches are expected when the view changes quickly and are only
    /// logged; other failures go to the error callback.
    pub fn handle_velocity_result(
        &mut self,
        result: Result<VelocityImage, FetchError>,
        reset: bool,
    ) -> Result<(), VisualiserError> {
        match result {
            Ok(image) => self.set_velocity_image(image, reset),
            Err(error) => {
                self.stop()?;
                if error.is_abort() {
                    log::debug!("Velocity fetch aborted, keeping previous field");
                } else {
                    log::warn!("Velocity fetch failed: {error}");
                    if let Some(callback) = self.on_error.as_mut() {
                        callback(&error);
                    }
                }
                Ok(())
            }
        }
    }

    /// Advance the animation by `dt` seconds and composite into `target`.
    ///
    /// Does nothing unless running.
    pub fn render_frame(&mut self, dt: f32, target: &wgpu::TextureView) -> Result<(), VisualiserError> {
        self.ensure_initialised()?;
        if self.state != VisualiserState::Running {
            return Ok(());
        }

        let aspect_ratio = self.aspect_ratio();
        let viewport = (self.width, self.height);
        let plan = plan_frame(dt, &self.options, &self.speed_curve, &self.field_summary, self.height);
        let pipeline = Self::pipeline_mut(&mut self.pipeline)?;
        if plan.substeps > 1 {
            log::trace!("Frame of {dt:.4}s split into {} substeps", plan.substeps);
        }

        let step = PropagatorStep {
            dt: plan.dt_sub,
            aspect_ratio,
            speed_curve: self.speed_curve,
            elimination: self.options.elimination,
            randomise_respawn_age: plan.randomise_respawn_age,
        };
        let substeps = plan.substeps;
        let device = &self.context.device;
        let queue = &self.context.queue;

        pipeline.renderer.sync(&pipeline.propagator);
        for substep in 0..substeps {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Substep Encoder"),
            });
            pipeline.trail.render(&mut encoder, plan.fade_amount);
            pipeline.propagator.update(&mut encoder, &step);
            pipeline.renderer.draw_particles(
                &mut encoder,
                pipeline.trail.current_view(),
                &pipeline.propagator,
                &self.options,
                viewport,
            );
            queue.submit(std::iter::once(encoder.finish()));

            // The final image stays current for compositing.
            if substep + 1 < substeps {
                pipeline.trail.swap_buffers();
            }
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Composite Encoder"),
        });
        let range = self
            .color_map
            .as_ref()
            .map_or(ColorScaleRange { start: 0.0, end: 1.0 }, ColorMap::range);
        pipeline.compositor.render(
            &mut encoder,
            target,
            pipeline.trail.current_view(),
            &pipeline.field,
            &CompositeParams {
                style: self.options.style,
                particle_color: self.options.particle_color,
                range,
                bbox: self.bbox_scaling,
            },
        );
        pipeline.renderer.draw_sprites(
            &mut encoder,
            target,
            &pipeline.propagator,
            &self.options,
            viewport,
            self.bbox_scaling,
        );
        queue.submit(std::iter::once(encoder.finish()));

        pipeline.trail.swap_buffers();
        Ok(())
    }

    /// Release all GPU resources. Every later call fails with
    /// [`VisualiserError::Destructed`].
    pub fn destruct(&mut self) {
        if self.state != VisualiserState::Destructed {
            self.pipeline = None;
            self.velocity_image = None;
            self.field_summary = FieldSummary::EMPTY;
            self.state = VisualiserState::Destructed;
            log::info!("Visualiser destructed");
        }
    }

    /// Copy the current particle state back from the GPU.
    pub fn read_particles(&self) -> Result<Vec<Particle>, VisualiserError> {
        self.ensure_initialised()?;
        let pipeline = self.pipeline.as_ref().ok_or(VisualiserError::NotInitialised)?;
        Ok(pipeline.propagator.read_particles()?)
    }

    fn update_speed_curve(&mut self) {
        let reference_speed = self.color_map.as_ref().map_or(0.0, |map| map.range().end);
        self.speed_curve = SpeedCurve::from_exponent_factor_and_speed(
            self.options.speed_exponent,
            self.options.speed_factor,
            reference_speed,
        );
        log::debug!("Speed curve: {:?}", self.speed_curve);
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    pub fn state(&self) -> VisualiserState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == VisualiserState::Running
    }

    pub fn options(&self) -> &VisualiserOptions {
        &self.options
    }

    pub fn speed_curve(&self) -> &SpeedCurve {
        &self.speed_curve
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bounding_box_scaling(&self) -> BoundingBoxScaling {
        self.bbox_scaling
    }

    pub fn velocity_image(&self) -> Option<&VelocityImage> {
        self.velocity_image.as_ref()
    }

    /// Current particle parity, `None` before initialisation.
    pub fn parity(&self) -> Option<usize> {
        self.pipeline.as_ref().map(|p| p.propagator.parity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::velocity::LinearDecode;

    #[test]
    fn test_short_frames_take_one_step() {
        assert_eq!(compute_substeps(0.01, 0.02), (1, 0.01));
        assert_eq!(compute_substeps(0.0, 0.02), (1, 0.0));
    }

    #[test]
    fn test_long_frames_split_evenly() {
        let (n, dt_sub) = compute_substeps(0.1, 0.03);
        assert_eq!(n, 3);
        assert!((dt_sub * n as f32 - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_substeps_are_capped() {
        let (n, dt_sub) = compute_substeps(10.0, 0.001);
        assert_eq!(n, MAX_SUBSTEPS);
        assert!((dt_sub * MAX_SUBSTEPS as f32 - 10.0).abs() < 1e-4);
        assert_eq!(compute_substeps(1.0, 0.0).0, MAX_SUBSTEPS);
    }

    #[test]
    fn test_substep_bounds_hold_for_many_frames() {
        for i in 0..1000 {
            let dt = i as f32 * 0.0137;
            let (n, dt_sub) = compute_substeps(dt, 0.004);
            assert!((1..=MAX_SUBSTEPS).contains(&n));
            assert!((dt_sub * n as f32 - dt).abs() <= dt * 1e-5 + 1e-7);
        }
    }

    #[test]
    fn test_min_timestep_limits_displacement() {
        let curve = SpeedCurve::linear(1.0);
        // 2 clip units per second on a 200 px tall surface is 200 px/s.
        let dt_min = min_timestep(1.0, &curve, Vec2::new(0.0, 2.0), 200);
        assert!((dt_min - 0.005).abs() < 1e-7);
    }

    fn moving_field() -> FieldSummary {
        FieldSummary {
            max_velocity: Vec2::new(0.0, 2.0),
            all_no_data: false,
        }
    }

    #[test]
    fn test_plan_splits_fast_fields() {
        let options = VisualiserOptions::default();
        let curve = SpeedCurve::linear(1.0);
        // 200 px/s at 1 px per substep allows 5 ms substeps.
        let plan = plan_frame(0.016, &options, &curve, &moving_field(), 200);
        assert_eq!(plan.substeps, 3);
        assert!((plan.fade_amount - options.fade_amount_per_second * plan.dt_sub).abs() < 1e-7);
        assert!(!plan.randomise_respawn_age);
    }

    #[test]
    fn test_plan_randomises_ages_without_data() {
        let options = VisualiserOptions::default();
        let curve = SpeedCurve::linear(1.0);
        let plan = plan_frame(0.016, &options, &curve, &FieldSummary::EMPTY, 200);
        assert_eq!(plan.substeps, 1);
        assert!(plan.randomise_respawn_age);
    }

    #[test]
    fn test_plan_randomises_ages_after_long_frames() {
        let options = VisualiserOptions::default();
        let curve = SpeedCurve::linear(1.0);
        let long = plan_frame(options.max_age, &options, &curve, &moving_field(), 200);
        assert!(long.randomise_respawn_age);
        assert_eq!(long.substeps, MAX_SUBSTEPS);
    }

    #[test]
    fn test_plan_ignores_invalid_dt() {
        let options = VisualiserOptions::default();
        let curve = SpeedCurve::linear(1.0);
        for dt in [f32::NAN, f32::INFINITY, -1.0] {
            let plan = plan_frame(dt, &options, &curve, &moving_field(), 200);
            assert_eq!((plan.substeps, plan.dt_sub, plan.fade_amount), (1, 0.0, 0.0));
        }
    }

    #[test]
    fn test_field_summary_detects_empty_fields() {
        let decode = LinearDecode::new(4.0, -2.0, 4.0, -2.0);
        let empty = VelocityImage::from_fn(4, 4, decode, |_, _| None);
        assert!(FieldSummary::of(&empty).all_no_data);
        let flowing = VelocityImage::from_fn(4, 4, decode, |_, _| Some(Vec2::new(1.0, 0.0)));
        assert!(!FieldSummary::of(&flowing).all_no_data);
    }

    #[test]
    fn test_min_timestep_without_motion() {
        let curve = SpeedCurve::linear(1.0);
        assert!(min_timestep(1.0, &curve, Vec2::ZERO, 200).is_infinite());
        assert_eq!(compute_substeps(5.0, f32::INFINITY).0, 1);
    }
}

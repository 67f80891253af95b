//! # Streamlines - GPU particle visualisation of velocity fields
//!
//! Animates many particles through a 2D raster velocity field and renders
//! them as fading trails over a colour-mapped speed background.
//!
//! Streamlines handles the GPU pipeline (particle propagation, trail
//! accumulation, compositing) so a host only supplies a device, a target
//! view and velocity rasters.
//!
//! ## Quick Start
//!
//! ```ignore
//! use streamlines::prelude::*;
//!
//! let context = pollster::block_on(GpuContext::new_headless())?;
//! let mut visualiser = Visualiser::new(context, format, 1280, 720, VisualiserOptions::default());
//! visualiser.initialise(ColorMap::from_palette(Palette::Viridis, 0.0, 1.5))?;
//! visualiser.set_velocity_image(image, true)?;
//! visualiser.start()?;
//!
//! // every frame
//! visualiser.render_frame(dt, &target_view)?;
//! ```
//!
//! ## Pipeline
//!
//! Each frame is split into substeps. Per substep:
//!
//! 1. [`TrailAccumulator`](gpu::TrailAccumulator) copies the previous trail
//!    image into the current one with reduced opacity
//! 2. [`Propagator`](gpu::Propagator) advances every particle in a compute
//!    pass reading one particle buffer and writing the other
//! 3. [`ParticleRenderer`](gpu::ParticleRenderer) draws the new positions
//!    into the current trail image
//!
//! The final trail image is blended with the colour-mapped speed field by the
//! [`Compositor`](gpu::Compositor), and an optional sprite is drawn per
//! particle on top.
//!
//! ## Coordinates
//!
//! Particles live in clip space, `[-1, 1]` on both axes with `+y` up. The
//! velocity raster has row 0 at the top. Horizontal velocity is divided by
//! the surface aspect ratio so a given speed covers the same number of
//! pixels along both axes.
//!
//! ## Speed curve
//!
//! | Option | Effect |
//! |--------|--------|
//! | `speed_exponent = 1` | rendered speed proportional to physical speed |
//! | `speed_exponent = 0` | every particle moves equally fast |
//! | `speed_factor` | rendered speed at the top of the colour scale |

pub mod bbox;
pub mod colormap;
pub mod double_buffer;
pub mod error;
pub mod fetch;
pub mod gpu;
pub mod options;
pub mod particle;
pub mod speed_curve;
pub mod velocity;
pub mod visualiser;

pub use bytemuck;
pub use glam::Vec2;

pub use bbox::{BoundingBox, BoundingBoxScaling};
pub use colormap::{Breakpoint, ColorMap, ColorScaleRange, Palette, Rgba8};
pub use error::{ColorMapError, ConfigError, DecodeError, FetchError, GpuError, VisualiserError};
pub use fetch::{AbortSignal, LegendRequest, RasterFetcher, RequestTransform, VelocityRequest};
pub use gpu::GpuContext;
pub use options::{EliminationMode, OptionsUpdate, StreamlineStyle, VisualiserOptions};
pub use speed_curve::SpeedCurve;
pub use velocity::{FilterMode, LinearDecode, RasterMetadata, VelocityImage};
pub use visualiser::{Visualiser, VisualiserState};

/// Commonly used types.
///
/// This imports:
/// - [`Visualiser`] and its [`VisualiserOptions`]
/// - [`GpuContext`] - device and queue
/// - [`VelocityImage`] and [`ColorMap`] - the inputs
/// - [`Vec2`] - glam vector type
pub mod prelude {
    pub use crate::bbox::{BoundingBox, BoundingBoxScaling};
    pub use crate::colormap::{ColorMap, ColorScaleRange, Palette, Rgba8};
    pub use crate::error::VisualiserError;
    pub use crate::fetch::{AbortSignal, LegendRequest, RasterFetcher, VelocityRequest};
    pub use crate::gpu::GpuContext;
    pub use crate::options::{EliminationMode, OptionsUpdate, StreamlineStyle, VisualiserOptions};
    pub use crate::speed_curve::SpeedCurve;
    pub use crate::velocity::{FilterMode, LinearDecode, VelocityImage};
    pub use crate::visualiser::{Visualiser, VisualiserState};
    pub use crate::Vec2;
}

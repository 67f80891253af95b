//! Error types for the streamline visualiser.
//!
//! Errors are grouped by concern: GPU resource creation, raster decoding,
//! fetching of remote data, colour maps, configuration, and the visualiser
//! lifecycle itself. Only [`VisualiserError`] crosses the public API of
//! [`Visualiser`](crate::Visualiser); the others convert into it.

use thiserror::Error;

/// Errors raised while creating GPU resources.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No compatible GPU adapter found.
    #[error("No compatible GPU adapter found. Ensure your system has a GPU with WebGPU/Vulkan/Metal/DX12 support.")]
    NoAdapter,
    /// Failed to create GPU device.
    #[error("Failed to create GPU device: {0}")]
    DeviceCreation(#[from] wgpu::RequestDeviceError),
    /// Failed to create a surface for rendering.
    #[error("Failed to create GPU surface: {0}")]
    SurfaceCreation(#[from] wgpu::CreateSurfaceError),
    /// A shader module or pipeline failed validation.
    #[error("Shader '{label}' failed validation:\n{diagnostics}")]
    ShaderValidation {
        /// Label of the pipeline being built.
        label: String,
        /// Compiler diagnostics reported by the device.
        diagnostics: String,
    },
    /// Creating a buffer, texture or bind group failed validation.
    #[error("Failed to create '{label}':\n{diagnostics}")]
    Validation {
        /// Label of the resource being created.
        label: String,
        /// Diagnostics reported by the device.
        diagnostics: String,
    },
    /// A request exceeds a device limit.
    #[error("'{label}' needs {requested}, the device allows at most {limit}")]
    LimitExceeded {
        /// Label of the resource.
        label: String,
        /// Requested size.
        requested: u64,
        /// Device limit.
        limit: u64,
    },
    /// The device refused to allocate a buffer or texture.
    #[error("Failed to allocate '{label}': {reason}")]
    Allocation {
        /// Label of the resource.
        label: String,
        /// Reason reported by the device.
        reason: String,
    },
    /// Failed to map buffer for reading.
    #[error("Failed to map GPU buffer: {0}")]
    BufferMapping(String),
}

/// Errors raised while decoding a velocity raster.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Channels are not 8 bits wide.
    #[error("Unsupported bit depth {0}, velocity rasters must use 8 bits per channel")]
    UnsupportedBitDepth(u16),
    /// The raster has a channel count other than 2, 3 or 4.
    #[error("Unsupported channel count {0}, expected 2, 3 or 4")]
    UnsupportedChannels(u8),
    /// The pixel buffer length does not match `width * height * channels`.
    #[error("Pixel buffer holds {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },
    /// A metadata field needed for the linear decode is absent.
    #[error("Missing raster metadata field '{0}'")]
    MissingMetadata(&'static str),
    /// The raster has zero width or height.
    #[error("Raster has empty dimensions {0}x{1}")]
    EmptyRaster(u32, u32),
    /// The image container could not be decoded.
    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    /// Failed to read file from disk.
    #[error("Failed to read raster file: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while parsing a colour legend.
#[derive(Debug, Error)]
pub enum ColorMapError {
    /// The legend contained no breakpoints.
    #[error("Colour map has no breakpoints")]
    Empty,
    /// A colour string could not be parsed.
    #[error("Invalid colour '{0}', expected #rrggbb or #rrggbbaa")]
    InvalidColor(String),
    /// Breakpoint thresholds are not ascending.
    #[error("Colour map thresholds must be ascending ({previous} followed by {next})")]
    Unordered {
        /// Threshold preceding the offending one.
        previous: f32,
        /// Offending threshold.
        next: f32,
    },
    /// The legend JSON was malformed or missing fields.
    #[error("Malformed legend: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by a [`RasterFetcher`](crate::fetch::RasterFetcher).
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request was cancelled through its abort signal.
    #[error("Request was aborted")]
    Aborted,
    /// The transport failed.
    #[error("Request to '{url}' failed: {reason}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Transport-level reason.
        reason: String,
    },
    /// The response could not be decoded as a velocity raster.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The response could not be decoded as a colour legend.
    #[error(transparent)]
    Legend(#[from] ColorMapError),
}

impl FetchError {
    /// Aborted fetches are expected during view changes and are not reported.
    pub fn is_abort(&self) -> bool {
        matches!(self, FetchError::Aborted)
    }
}

/// Errors raised while loading or saving options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or write the options file.
    #[error("Failed to access options file: {0}")]
    Io(#[from] std::io::Error),
    /// The options file is not valid JSON for [`VisualiserOptions`](crate::VisualiserOptions).
    #[error("Invalid options: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the [`Visualiser`](crate::Visualiser) API.
#[derive(Debug, Error)]
pub enum VisualiserError {
    /// A mutating method was called before `initialise`.
    #[error("Visualiser has not been initialised")]
    NotInitialised,
    /// A method was called after `destruct`.
    #[error("Visualiser has been destructed")]
    Destructed,
    /// GPU resource creation failed.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    /// An option value is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The sprite image could not be loaded.
    #[error("Failed to load sprite: {0}")]
    Sprite(#[from] image::ImageError),
}

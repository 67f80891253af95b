//! Velocity rasters and their linear decode.
//!
//! A velocity raster stores the horizontal (`u`) and vertical (`v`)
//! components of a flow field as 8-bit channels. The physical velocity is
//! recovered with a per-axis linear transform:
//!
//! ```text
//! physical = raw / 255 * scale + offset
//! ```
//!
//! A texel with both channels at 255 is the "no data" sentinel and decodes
//! to an exact zero vector.
//!
//! # Example
//!
//! ```
//! use streamlines::velocity::{LinearDecode, VelocityImage};
//! use glam::Vec2;
//!
//! let decode = LinearDecode::new(2.0, -1.0, 2.0, -1.0);
//! let image = VelocityImage::from_fn(4, 4, decode, |_, _| Some(Vec2::new(1.0, 0.0)));
//! assert!(image.max_velocity().x >= 1.0);
//! ```

use std::path::Path;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Raw channel value marking a texel without data.
pub const NO_DATA: u8 = u8::MAX;

/// Filter mode for sampling the velocity texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Bilinear filtering. Smooth motion, but blends data texels with
    /// no-data texels along coastlines.
    #[default]
    Linear,
    /// Nearest-texel filtering.
    Nearest,
}

impl From<FilterMode> for wgpu::FilterMode {
    fn from(mode: FilterMode) -> Self {
        match mode {
            FilterMode::Linear => wgpu::FilterMode::Linear,
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
        }
    }
}

/// Per-axis linear transform from raw channel values to physical velocity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearDecode {
    pub u_scale: f32,
    pub u_offset: f32,
    pub v_scale: f32,
    pub v_offset: f32,
}

impl LinearDecode {
    pub fn new(u_scale: f32, u_offset: f32, v_scale: f32, v_offset: f32) -> Self {
        Self {
            u_scale,
            u_offset,
            v_scale,
            v_offset,
        }
    }

    /// Physical velocity for a raw texel. The sentinel decodes to zero.
    pub fn decode(&self, raw: [u8; 2]) -> Vec2 {
        if raw == [NO_DATA, NO_DATA] {
            return Vec2::ZERO;
        }
        Vec2::new(
            raw[0] as f32 / 255.0 * self.u_scale + self.u_offset,
            raw[1] as f32 / 255.0 * self.v_scale + self.v_offset,
        )
    }

    /// Nearest raw texel for a physical velocity.
    ///
    /// Never produces the sentinel: a velocity that would encode to
    /// `(255, 255)` is nudged to `(255, 254)`.
    pub fn encode(&self, velocity: Vec2) -> [u8; 2] {
        let u = encode_axis(velocity.x, self.u_scale, self.u_offset);
        let mut v = encode_axis(velocity.y, self.v_scale, self.v_offset);
        if u == NO_DATA && v == NO_DATA {
            v = NO_DATA - 1;
        }
        [u, v]
    }

    /// Largest absolute physical velocity per axis, taken at the raw extremes.
    pub fn max_velocity(&self) -> Vec2 {
        Vec2::new(
            self.u_offset.abs().max((self.u_scale + self.u_offset).abs()),
            self.v_offset.abs().max((self.v_scale + self.v_offset).abs()),
        )
    }
}

fn encode_axis(value: f32, scale: f32, offset: f32) -> u8 {
    if scale == 0.0 {
        return 0;
    }
    ((value - offset) / scale * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Metadata accompanying a decoded raster.
///
/// `offset` comes from the source's tiepoint and `scale` from its pixel
/// scale; both are `[u, v]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RasterMetadata {
    pub bits_per_sample: u16,
    pub offset: Option<[f32; 2]>,
    pub scale: Option<[f32; 2]>,
}

impl RasterMetadata {
    fn linear_decode(&self) -> Result<LinearDecode, DecodeError> {
        if self.bits_per_sample != 8 {
            return Err(DecodeError::UnsupportedBitDepth(self.bits_per_sample));
        }
        let offset = self.offset.ok_or(DecodeError::MissingMetadata("tiepoint"))?;
        let scale = self.scale.ok_or(DecodeError::MissingMetadata("pixel_scale"))?;
        Ok(LinearDecode::new(scale[0], offset[0], scale[1], offset[1]))
    }
}

/// A decoded velocity raster, ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityImage {
    width: u32,
    height: u32,
    /// Interleaved `(u, v)` raw bytes, row 0 at the top of the map.
    data: Vec<u8>,
    decode: LinearDecode,
    filter: FilterMode,
}

impl VelocityImage {
    /// Build from an already decoded raster with 2, 3 or 4 interleaved channels.
    ///
    /// Only the first two channels are kept.
    pub fn from_raw(
        width: u32,
        height: u32,
        channels: u8,
        pixels: &[u8],
        metadata: &RasterMetadata,
    ) -> Result<Self, DecodeError> {
        let decode = metadata.linear_decode()?;
        Self::from_channels(width, height, channels, pixels, decode)
    }

    /// Decode a PNG or JPEG container with a known linear decode.
    pub fn from_png_bytes(bytes: &[u8], decode: LinearDecode) -> Result<Self, DecodeError> {
        let image = image::load_from_memory(bytes)?;
        let color = image.color();
        let channels = color.channel_count();
        let bits = u16::from(color.bytes_per_pixel()) * 8 / u16::from(channels.max(1));
        if bits != 8 {
            return Err(DecodeError::UnsupportedBitDepth(bits));
        }
        let (width, height) = (image.width(), image.height());
        let pixels = image.into_bytes();
        Self::from_channels(width, height, channels, &pixels, decode)
    }

    /// Read and decode an image file.
    pub fn from_file<P: AsRef<Path>>(path: P, decode: LinearDecode) -> Result<Self, DecodeError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_png_bytes(&bytes, decode)
    }

    /// Build a raster by evaluating `f` at every texel. `None` marks no data.
    pub fn from_fn<F>(width: u32, height: u32, decode: LinearDecode, f: F) -> Self
    where
        F: Fn(u32, u32) -> Option<Vec2>,
    {
        let mut data = Vec::with_capacity((width * height * 2) as usize);
        for y in 0..height {
            for x in 0..width {
                match f(x, y) {
                    Some(velocity) => data.extend_from_slice(&decode.encode(velocity)),
                    None => data.extend_from_slice(&[NO_DATA, NO_DATA]),
                }
            }
        }
        Self {
            width,
            height,
            data,
            decode,
            filter: FilterMode::Linear,
        }
    }

    fn from_channels(
        width: u32,
        height: u32,
        channels: u8,
        pixels: &[u8],
        decode: LinearDecode,
    ) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::EmptyRaster(width, height));
        }
        if !(2..=4).contains(&channels) {
            return Err(DecodeError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: pixels.len(),
            });
        }
        let data = pixels
            .chunks_exact(channels as usize)
            .flat_map(|texel| [texel[0], texel[1]])
            .collect();
        Ok(Self {
            width,
            height,
            data,
            decode,
            filter: FilterMode::Linear,
        })
    }

    /// Set the filter used when the texture is sampled on the GPU.
    pub fn with_filter(mut self, filter: FilterMode) -> Self {
        self.filter = filter;
        self
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn filter(&self) -> FilterMode {
        self.filter
    }

    #[inline]
    pub fn decode(&self) -> &LinearDecode {
        &self.decode
    }

    /// Interleaved two-channel bytes, as uploaded to the `Rg8Unorm` texture.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Upper bound on physical velocity per axis, used to bound the timestep.
    pub fn max_velocity(&self) -> Vec2 {
        self.decode.max_velocity()
    }

    /// Raw texel at pixel coordinates, clamped to the raster.
    pub fn raw_at(&self, x: u32, y: u32) -> [u8; 2] {
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        let i = ((y * self.width + x) * 2) as usize;
        [self.data[i], self.data[i + 1]]
    }

    /// Physical velocity at a clip-space position using nearest-texel lookup.
    ///
    /// The raster's first row is the top of the map while clip-space `y`
    /// grows upwards, so the vertical texture coordinate is inverted.
    pub fn sample_clip(&self, position: Vec2) -> Vec2 {
        self.decode.decode(self.raw_at_clip(position))
    }

    /// Raw texel under a clip-space position.
    pub fn raw_at_clip(&self, position: Vec2) -> [u8; 2] {
        let tex = clip_to_texture(position);
        let x = (tex.x * self.width as f32).floor().max(0.0) as u32;
        let y = (tex.y * self.height as f32).floor().max(0.0) as u32;
        self.raw_at(x, y)
    }

    /// True when every texel is the no-data sentinel.
    pub fn is_all_no_data(&self) -> bool {
        self.data.iter().all(|&b| b == NO_DATA)
    }
}

/// Convert clip-space coordinates to texture coordinates with `v` inverted.
#[inline]
pub fn clip_to_texture(position: Vec2) -> Vec2 {
    Vec2::new((position.x + 1.0) * 0.5, 1.0 - (position.y + 1.0) * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RasterMetadata {
        RasterMetadata {
            bits_per_sample: 8,
            offset: Some([-5.0, -2.0]),
            scale: Some([10.0, 4.0]),
        }
    }

    #[test]
    fn test_decode_extremes() {
        let decode = LinearDecode::new(10.0, -5.0, 4.0, -2.0);
        assert_eq!(decode.decode([0, 0]), Vec2::new(-5.0, -2.0));
        let top = decode.decode([255, 254]);
        assert!((top.x - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_sentinel_decodes_to_zero() {
        let decode = LinearDecode::new(10.0, -5.0, 4.0, -2.0);
        assert_eq!(decode.decode([NO_DATA, NO_DATA]), Vec2::ZERO);
    }

    #[test]
    fn test_encode_never_produces_sentinel() {
        let decode = LinearDecode::new(1.0, 0.0, 1.0, 0.0);
        assert_eq!(decode.encode(Vec2::new(1.0, 1.0)), [255, 254]);
    }

    #[test]
    fn test_max_velocity_uses_extremes() {
        let decode = LinearDecode::new(10.0, -3.0, 4.0, 1.0);
        assert_eq!(decode.max_velocity(), Vec2::new(7.0, 5.0));
    }

    #[test]
    fn test_from_raw_drops_extra_channels() {
        let pixels = [1, 2, 3, 4, 5, 6];
        let image = VelocityImage::from_raw(2, 1, 3, &pixels, &metadata()).unwrap();
        assert_eq!(image.as_bytes(), &[1, 2, 4, 5]);
    }

    #[test]
    fn test_from_raw_rejects_bit_depth() {
        let meta = RasterMetadata {
            bits_per_sample: 16,
            ..metadata()
        };
        let err = VelocityImage::from_raw(1, 1, 2, &[0, 0], &meta).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedBitDepth(16)));
    }

    #[test]
    fn test_from_raw_requires_metadata() {
        let meta = RasterMetadata {
            offset: None,
            ..metadata()
        };
        let err = VelocityImage::from_raw(1, 1, 2, &[0, 0], &meta).unwrap_err();
        assert!(matches!(err, DecodeError::MissingMetadata("tiepoint")));

        let meta = RasterMetadata {
            scale: None,
            ..metadata()
        };
        let err = VelocityImage::from_raw(1, 1, 2, &[0, 0], &meta).unwrap_err();
        assert!(matches!(err, DecodeError::MissingMetadata("pixel_scale")));
    }

    #[test]
    fn test_from_raw_rejects_bad_sizes() {
        let err = VelocityImage::from_raw(2, 2, 2, &[0; 7], &metadata()).unwrap_err();
        assert!(matches!(err, DecodeError::SizeMismatch { expected: 8, actual: 7 }));
        let err = VelocityImage::from_raw(1, 1, 1, &[0], &metadata()).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedChannels(1)));
    }

    #[test]
    fn test_sample_clip_flips_vertical_axis() {
        let decode = LinearDecode::new(1.0, 0.0, 1.0, 0.0);
        // Top row fast, bottom row slow.
        let image = VelocityImage::from_fn(1, 2, decode, |_, y| {
            Some(if y == 0 { Vec2::new(1.0, 0.0) } else { Vec2::ZERO })
        });
        assert!(image.sample_clip(Vec2::new(0.0, 0.5)).x > 0.9);
        assert!(image.sample_clip(Vec2::new(0.0, -0.5)).x < 0.1);
    }

    #[test]
    fn test_all_no_data() {
        let decode = LinearDecode::new(1.0, 0.0, 1.0, 0.0);
        let image = VelocityImage::from_fn(3, 3, decode, |_, _| None);
        assert!(image.is_all_no_data());
        let image = VelocityImage::from_fn(3, 3, decode, |x, _| (x == 1).then_some(Vec2::ONE));
        assert!(!image.is_all_no_data());
    }
}

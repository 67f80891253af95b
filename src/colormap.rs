//! Colour maps for the velocity-magnitude field.
//!
//! A [`ColorMap`] is an ordered list of `(threshold, colour)` breakpoints as
//! published by a legend service. The compositor samples it through a small
//! ramp texture, indexed by speed mapped onto `[range.start, range.end]`.
//!
//! # Legend format
//!
//! ```json
//! { "colourMap": [ { "lowerValue": 0.0, "color": "#440154" },
//!                  { "lowerValue": 2.0, "color": "#fde725" } ] }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ColorMapError;

/// Number of texels in the ramp texture.
pub const RAMP_WIDTH: u32 = 256;

/// An RGBA colour with 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba8(pub [u8; 4]);

impl Rgba8 {
    pub const WHITE: Rgba8 = Rgba8([255, 255, 255, 255]);
    pub const BLACK: Rgba8 = Rgba8([0, 0, 0, 255]);

    /// Parse `#rrggbb` or `#rrggbbaa`.
    pub fn parse(hex: &str) -> Result<Self, ColorMapError> {
        let invalid = || ColorMapError::InvalidColor(hex.to_string());
        let digits = hex.strip_prefix('#').ok_or_else(invalid)?;
        if !(digits.len() == 6 || digits.len() == 8) || !digits.is_ascii() {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| invalid());
        let alpha = if digits.len() == 8 { channel(6)? } else { 255 };
        Ok(Rgba8([channel(0)?, channel(2)?, channel(4)?, alpha]))
    }

    /// Colour as normalised floats, for uniforms.
    pub fn to_f32(self) -> [f32; 4] {
        self.0.map(|c| c as f32 / 255.0)
    }

    pub fn to_hex(self) -> String {
        let [r, g, b, a] = self.0;
        if a == 255 {
            format!("#{r:02x}{g:02x}{b:02x}")
        } else {
            format!("#{r:02x}{g:02x}{b:02x}{a:02x}")
        }
    }

    fn lerp(self, other: Rgba8, t: f32) -> Rgba8 {
        let mut out = [0u8; 4];
        for (i, c) in out.iter_mut().enumerate() {
            *c = lerp_u8(self.0[i], other.0[i], t);
        }
        Rgba8(out)
    }
}

impl Serialize for Rgba8 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Rgba8 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Rgba8::parse(&hex).map_err(serde::de::Error::custom)
    }
}

fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    let a = a as f32;
    let b = b as f32;
    (a + (b - a) * t).round() as u8
}

/// Speed range covered by the colour scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorScaleRange {
    pub start: f32,
    pub end: f32,
}

impl ColorScaleRange {
    /// Clamped position of `speed` within the range.
    pub fn normalise(&self, speed: f32) -> f32 {
        let span = self.end - self.start;
        if span <= 0.0 {
            return if speed >= self.end { 1.0 } else { 0.0 };
        }
        ((speed - self.start) / span).clamp(0.0, 1.0)
    }
}

/// A single legend entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(rename = "lowerValue")]
    pub threshold: f32,
    pub color: Rgba8,
}

#[derive(Deserialize)]
struct Legend {
    #[serde(rename = "colourMap")]
    colour_map: Vec<Breakpoint>,
}

/// Ordered colour breakpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorMap {
    breakpoints: Vec<Breakpoint>,
}

impl ColorMap {
    /// Build from breakpoints with ascending thresholds.
    pub fn new(breakpoints: Vec<Breakpoint>) -> Result<Self, ColorMapError> {
        if breakpoints.is_empty() {
            return Err(ColorMapError::Empty);
        }
        for pair in breakpoints.windows(2) {
            if pair[1].threshold < pair[0].threshold {
                return Err(ColorMapError::Unordered {
                    previous: pair[0].threshold,
                    next: pair[1].threshold,
                });
            }
        }
        Ok(Self { breakpoints })
    }

    /// Parse a legend response.
    pub fn from_legend_json(json: &str) -> Result<Self, ColorMapError> {
        let legend: Legend = serde_json::from_str(json)?;
        Self::new(legend.colour_map)
    }

    /// Evenly spaced palette between `start` and `end`.
    pub fn from_palette(palette: Palette, start: f32, end: f32) -> Self {
        let stops = palette.stops();
        let n = stops.len() as f32 - 1.0;
        let breakpoints = stops
            .iter()
            .enumerate()
            .map(|(i, rgb)| Breakpoint {
                threshold: start + (end - start) * i as f32 / n,
                color: Rgba8([
                    (rgb[0] * 255.0).round() as u8,
                    (rgb[1] * 255.0).round() as u8,
                    (rgb[2] * 255.0).round() as u8,
                    255,
                ]),
            })
            .collect();
        Self { breakpoints }
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Range spanned by the first and last threshold.
    pub fn range(&self) -> ColorScaleRange {
        ColorScaleRange {
            start: self.breakpoints[0].threshold,
            end: self.breakpoints[self.breakpoints.len() - 1].threshold,
        }
    }

    /// Colour at a speed, interpolating between neighbouring breakpoints.
    pub fn color_at(&self, value: f32) -> Rgba8 {
        let first = self.breakpoints[0];
        if value <= first.threshold {
            return first.color;
        }
        for pair in self.breakpoints.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if value <= b.threshold {
                let span = b.threshold - a.threshold;
                let t = if span > 0.0 { (value - a.threshold) / span } else { 1.0 };
                return a.color.lerp(b.color, t);
            }
        }
        self.breakpoints[self.breakpoints.len() - 1].color
    }

    /// RGBA bytes of a `width x 1` ramp covering [`range`](Self::range).
    pub fn ramp(&self, width: u32) -> Vec<u8> {
        let range = self.range();
        let mut data = Vec::with_capacity((width * 4) as usize);
        for x in 0..width {
            let t = x as f32 / (width - 1).max(1) as f32;
            let value = range.start + (range.end - range.start) * t;
            data.extend_from_slice(&self.color_at(value).0);
        }
        data
    }
}

/// Built-in colour palettes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Palette {
    /// Perceptually uniform, colourblind-friendly (purple to yellow).
    #[default]
    Viridis,
    /// Black to light yellow through purple and orange.
    Magma,
    /// Deep blue to cyan.
    Ocean,
    Grayscale,
}

impl Palette {
    fn stops(&self) -> [[f32; 3]; 5] {
        match self {
            Palette::Viridis => [
                [0.267, 0.004, 0.329],
                [0.282, 0.140, 0.458],
                [0.127, 0.566, 0.551],
                [0.369, 0.789, 0.383],
                [0.993, 0.906, 0.144],
            ],
            Palette::Magma => [
                [0.001, 0.0, 0.014],
                [0.329, 0.071, 0.435],
                [0.716, 0.215, 0.475],
                [0.994, 0.541, 0.380],
                [0.987, 0.991, 0.749],
            ],
            Palette::Ocean => [
                [0.0, 0.05, 0.15],
                [0.0, 0.2, 0.4],
                [0.0, 0.4, 0.6],
                [0.2, 0.6, 0.8],
                [0.6, 0.9, 1.0],
            ],
            Palette::Grayscale => [
                [0.0, 0.0, 0.0],
                [0.25, 0.25, 0.25],
                [0.5, 0.5, 0.5],
                [0.75, 0.75, 0.75],
                [1.0, 1.0, 1.0],
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(Rgba8::parse("#ff8000").unwrap(), Rgba8([255, 128, 0, 255]));
        assert_eq!(Rgba8::parse("#00000080").unwrap(), Rgba8([0, 0, 0, 128]));
        assert!(Rgba8::parse("ff8000").is_err());
        assert!(Rgba8::parse("#ff80").is_err());
        assert!(Rgba8::parse("#gg0000").is_err());
    }

    #[test]
    fn test_legend_json() {
        let json = r##"{"colourMap":[
            {"lowerValue":0.0,"color":"#000000"},
            {"lowerValue":2.0,"color":"#ffffff"}
        ]}"##;
        let map = ColorMap::from_legend_json(json).unwrap();
        assert_eq!(map.range(), ColorScaleRange { start: 0.0, end: 2.0 });
        assert_eq!(map.color_at(1.0), Rgba8([128, 128, 128, 255]));
    }

    #[test]
    fn test_legend_missing_fields() {
        let err = ColorMap::from_legend_json(r##"{"colourMap":[{"color":"#000000"}]}"##);
        assert!(matches!(err, Err(ColorMapError::Json(_))));
        let err = ColorMap::from_legend_json(r#"{"colourMap":[]}"#);
        assert!(matches!(err, Err(ColorMapError::Empty)));
    }

    #[test]
    fn test_unordered_thresholds() {
        let err = ColorMap::new(vec![
            Breakpoint { threshold: 1.0, color: Rgba8::BLACK },
            Breakpoint { threshold: 0.5, color: Rgba8::WHITE },
        ]);
        assert!(matches!(err, Err(ColorMapError::Unordered { .. })));
    }

    #[test]
    fn test_ramp_endpoints() {
        let map = ColorMap::from_palette(Palette::Grayscale, 0.0, 4.0);
        let ramp = map.ramp(RAMP_WIDTH);
        assert_eq!(ramp.len(), RAMP_WIDTH as usize * 4);
        assert_eq!(&ramp[..4], &[0, 0, 0, 255]);
        assert_eq!(&ramp[ramp.len() - 4..], &[255, 255, 255, 255]);
    }

    #[test]
    fn test_range_normalise_clamps() {
        let range = ColorScaleRange { start: 1.0, end: 3.0 };
        assert_eq!(range.normalise(0.0), 0.0);
        assert_eq!(range.normalise(2.0), 0.5);
        assert_eq!(range.normalise(10.0), 1.0);
    }
}

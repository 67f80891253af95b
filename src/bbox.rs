//! Bounding boxes and the clip-space remap between two views.
//!
//! Particles are simulated in the clip space of the view the velocity field
//! was fetched for. When the camera pans or zooms before a new field
//! arrives, the already rendered frame is remapped into the current view
//! with a [`BoundingBoxScaling`] instead of being re-simulated.

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Box translated by `(dx, dy)` map units.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x_min + dx, self.y_min + dy, self.x_max + dx, self.y_max + dy)
    }

    /// Box scaled by `factor` around `(cx, cy)`.
    pub fn scaled_about(&self, factor: f64, cx: f64, cy: f64) -> Self {
        Self::new(
            cx + (self.x_min - cx) * factor,
            cy + (self.y_min - cy) * factor,
            cx + (self.x_max - cx) * factor,
            cy + (self.y_max - cy) * factor,
        )
    }

    /// Map coordinates of a clip-space point.
    pub fn clip_to_map(&self, clip: Vec2) -> (f64, f64) {
        (
            self.x_min + (clip.x as f64 + 1.0) * 0.5 * self.width(),
            self.y_min + (clip.y as f64 + 1.0) * 0.5 * self.height(),
        )
    }

    /// Comma-separated `x_min,y_min,x_max,y_max`, as used in request URLs.
    pub fn to_query(&self) -> String {
        format!("{},{},{},{}", self.x_min, self.y_min, self.x_max, self.y_max)
    }
}

/// Affine clip-space remap `clip' = clip * scale + offset`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BoundingBoxScaling {
    pub scale_x: f32,
    pub scale_y: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Default for BoundingBoxScaling {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl BoundingBoxScaling {
    pub const IDENTITY: Self = Self {
        scale_x: 1.0,
        scale_y: 1.0,
        offset_x: 0.0,
        offset_y: 0.0,
    };

    /// Remap from the clip space of `rendered` into the clip space of `view`.
    pub fn between(rendered: &BoundingBox, view: &BoundingBox) -> Self {
        let scale_x = rendered.width() / view.width();
        let scale_y = rendered.height() / view.height();
        let offset_x = (rendered.x_min + rendered.x_max - view.x_min - view.x_max) / view.width();
        let offset_y = (rendered.y_min + rendered.y_max - view.y_min - view.y_max) / view.height();
        Self {
            scale_x: scale_x as f32,
            scale_y: scale_y as f32,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
        }
    }

    pub fn apply(&self, clip: Vec2) -> Vec2 {
        Vec2::new(
            clip.x * self.scale_x + self.offset_x,
            clip.y * self.scale_y + self.offset_y,
        )
    }

    pub fn inverse(&self) -> Self {
        Self {
            scale_x: 1.0 / self.scale_x,
            scale_y: 1.0 / self.scale_y,
            offset_x: -self.offset_x / self.scale_x,
            offset_y: -self.offset_y / self.scale_y,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

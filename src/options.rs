//! Visualiser options.
//!
//! [`VisualiserOptions`] holds every tunable of the pipeline and can be
//! loaded from or saved to JSON. [`OptionsUpdate`] is the partial form
//! accepted by [`Visualiser::update_options`](crate::Visualiser::update_options):
//! fields left as `None` keep their current value.
//!
//! ```ignore
//! let options = VisualiserOptions::load("streamlines.json")?;
//! visualiser.update_options(OptionsUpdate {
//!     max_age: Some(6.0),
//!     ..Default::default()
//! })?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::colormap::Rgba8;
use crate::error::ConfigError;
use crate::velocity::FilterMode;

/// How particles and the magnitude field are blended in the final image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamlineStyle {
    /// Light particles on top of the magnitude-coloured background.
    #[default]
    LightParticlesOnMagnitude,
    /// Dark particles on top of the magnitude-coloured background.
    DarkParticlesOnMagnitude,
    /// Particles coloured by magnitude, transparent background.
    MagnitudeColoredParticles,
    /// Particles coloured by magnitude, background in the particle colour.
    ColoredParticles,
}

impl StreamlineStyle {
    /// Index used by the compositor shader.
    pub fn shader_index(self) -> u32 {
        match self {
            StreamlineStyle::LightParticlesOnMagnitude => 0,
            StreamlineStyle::DarkParticlesOnMagnitude => 1,
            StreamlineStyle::MagnitudeColoredParticles => 2,
            StreamlineStyle::ColoredParticles => 3,
        }
    }
}

/// When particles are retired and respawned regardless of where they are.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum EliminationMode {
    /// Respawn particles older than `max_age`.
    #[default]
    Age,
    /// Respawn a random contiguous block of `floor(per_second * dt)` particles each step.
    IndexRange { per_second: f32 },
}

impl EliminationMode {
    /// Whether every particle is respawned before it exceeds `max_age`.
    pub fn bounds_age(self) -> bool {
        matches!(self, EliminationMode::Age)
    }
}

/// Complete visualiser configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualiserOptions {
    /// Initial particle count; change it later with `set_num_particles`.
    pub num_particles: u32,
    pub style: StreamlineStyle,
    /// Maximum particle size in pixels.
    pub particle_size: f32,
    /// Rendered speed at the top of the colour scale, relative to physical speed.
    pub speed_factor: f32,
    /// Power-law exponent of the speed curve. 1 is linear, 0 is constant speed.
    pub speed_exponent: f32,
    /// Fraction of trail opacity removed per second.
    pub fade_amount_per_second: f32,
    /// Largest distance in pixels a particle may travel in one substep.
    pub max_displacement: f32,
    /// Particle lifetime in seconds.
    pub max_age: f32,
    /// Size growth in pixels per second of age.
    pub growth_rate: f32,
    /// Seconds over which a particle shrinks to nothing before retiring.
    pub shrink_duration: f32,
    pub particle_color: Rgba8,
    /// Rotate particle quads to follow the flow direction.
    pub rotate_particles: bool,
    pub elimination: EliminationMode,
    /// Filtering of the velocity texture.
    pub field_filter: FilterMode,
    /// Optional sprite drawn on top of the composited frame.
    pub sprite_path: Option<PathBuf>,
    /// Sprite size in pixels.
    pub sprite_size: f32,
}

impl Default for VisualiserOptions {
    fn default() -> Self {
        Self {
            num_particles: 10_000,
            style: StreamlineStyle::default(),
            particle_size: 3.0,
            speed_factor: 0.3,
            speed_exponent: 1.0,
            fade_amount_per_second: 2.0,
            max_displacement: 1.0,
            max_age: 4.0,
            growth_rate: 6.0,
            shrink_duration: 0.3,
            particle_color: Rgba8::WHITE,
            rotate_particles: false,
            elimination: EliminationMode::Age,
            field_filter: FilterMode::Linear,
            sprite_path: None,
            sprite_size: 12.0,
        }
    }
}

impl VisualiserOptions {
    /// Save the options to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Partial options update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsUpdate {
    pub style: Option<StreamlineStyle>,
    pub particle_size: Option<f32>,
    pub speed_factor: Option<f32>,
    pub speed_exponent: Option<f32>,
    pub fade_amount_per_second: Option<f32>,
    pub max_displacement: Option<f32>,
    pub max_age: Option<f32>,
    pub growth_rate: Option<f32>,
    pub shrink_duration: Option<f32>,
    pub particle_color: Option<Rgba8>,
    pub rotate_particles: Option<bool>,
    pub elimination: Option<EliminationMode>,
    pub field_filter: Option<FilterMode>,
    /// `Some(None)` removes the sprite.
    pub sprite_path: Option<Option<PathBuf>>,
    pub sprite_size: Option<f32>,
}

/// What an applied [`OptionsUpdate`] invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionsChanges {
    pub speed_curve: bool,
    pub max_age: bool,
    pub field_filter: bool,
    pub sprite: bool,
}

macro_rules! apply_field {
    ($update:expr, $options:expr, $field:ident) => {{
        match $update.$field.take() {
            Some(value) if value != $options.$field => {
                $options.$field = value;
                true
            }
            _ => false,
        }
    }};
}

impl OptionsUpdate {
    /// Merge into `options`, reporting which derived state must be rebuilt.
    pub fn apply(mut self, options: &mut VisualiserOptions) -> OptionsChanges {
        let speed_factor = apply_field!(self, options, speed_factor);
        let speed_exponent = apply_field!(self, options, speed_exponent);
        let max_age = apply_field!(self, options, max_age);
        let field_filter = apply_field!(self, options, field_filter);
        let sprite_path = apply_field!(self, options, sprite_path);

        apply_field!(self, options, style);
        apply_field!(self, options, particle_size);
        apply_field!(self, options, fade_amount_per_second);
        apply_field!(self, options, max_displacement);
        apply_field!(self, options, growth_rate);
        apply_field!(self, options, shrink_duration);
        apply_field!(self, options, particle_color);
        apply_field!(self, options, rotate_particles);
        apply_field!(self, options, elimination);
        apply_field!(self, options, sprite_size);

        OptionsChanges {
            speed_curve: speed_factor || speed_exponent,
            max_age,
            field_filter,
            sprite: sprite_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let options = VisualiserOptions::from_json(r##"{"max_age": 8.0, "particle_color": "#ff0000"}"##)
            .unwrap();
        assert_eq!(options.max_age, 8.0);
        assert_eq!(options.particle_color, Rgba8([255, 0, 0, 255]));
        assert_eq!(options.particle_size, VisualiserOptions::default().particle_size);
    }

    #[test]
    fn test_elimination_mode_json() {
        let options = VisualiserOptions::from_json(
            r#"{"elimination": {"mode": "index_range", "per_second": 500.0}}"#,
        )
        .unwrap();
        assert_eq!(options.elimination, EliminationMode::IndexRange { per_second: 500.0 });
        assert!(!options.elimination.bounds_age());
        assert!(EliminationMode::Age.bounds_age());
    }

    #[test]
    fn test_invalid_color_is_rejected() {
        let err = VisualiserOptions::from_json(r#"{"particle_color": "red"}"#);
        assert!(matches!(err, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_update_reports_changes() {
        let mut options = VisualiserOptions::default();
        let changes = OptionsUpdate {
            speed_exponent: Some(0.5),
            max_age: Some(options.max_age),
            particle_size: Some(7.0),
            ..Default::default()
        }
        .apply(&mut options);

        assert!(changes.speed_curve);
        assert!(!changes.max_age, "unchanged value must not trigger a reset");
        assert!(!changes.sprite);
        assert_eq!(options.particle_size, 7.0);
        assert_eq!(options.speed_exponent, 0.5);
    }

    #[test]
    fn test_sprite_can_be_removed() {
        let mut options = VisualiserOptions {
            sprite_path: Some(PathBuf::from("arrow.png")),
            ..Default::default()
        };
        let changes = OptionsUpdate {
            sprite_path: Some(None),
            ..Default::default()
        }
        .apply(&mut options);
        assert!(changes.sprite);
        assert!(options.sprite_path.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("streamlines-options-{}.json", std::process::id()));
        let options = VisualiserOptions {
            style: StreamlineStyle::DarkParticlesOnMagnitude,
            ..Default::default()
        };
        options.save(&path).unwrap();
        let loaded = VisualiserOptions::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(loaded, options);
    }
}

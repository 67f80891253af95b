//! Power-law mapping from physical speed to rendered speed.
//!
//! Real flow fields span orders of magnitude in speed. Rendering particles at
//! their physical speed makes slow regions look static and fast regions
//! smear. A [`SpeedCurve`] compresses the range with `factor * speed^exponent`
//! while keeping one reference speed (usually the top of the colour scale)
//! fixed at `base_factor * reference_speed`.

use serde::{Deserialize, Serialize};

/// Power-law speed transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedCurve {
    exponent: f32,
    factor: f32,
    base_factor: f32,
}

impl Default for SpeedCurve {
    fn default() -> Self {
        Self::linear(1.0)
    }
}

impl SpeedCurve {
    /// Identity-shaped curve scaled by `factor`.
    pub fn linear(factor: f32) -> Self {
        Self {
            exponent: 1.0,
            factor,
            base_factor: factor,
        }
    }

    /// Build a curve that maps `reference_speed` to `base_factor * reference_speed`.
    ///
    /// A non-positive reference speed cannot be calibrated against, so the
    /// factor falls back to `base_factor`.
    pub fn from_exponent_factor_and_speed(
        exponent: f32,
        base_factor: f32,
        reference_speed: f32,
    ) -> Self {
        let factor = if reference_speed > 0.0 {
            base_factor * reference_speed / reference_speed.powf(exponent)
        } else {
            base_factor
        };
        Self {
            exponent,
            factor,
            base_factor,
        }
    }

    #[inline]
    pub fn exponent(&self) -> f32 {
        self.exponent
    }

    #[inline]
    pub fn factor(&self) -> f32 {
        self.factor
    }

    #[inline]
    pub fn base_factor(&self) -> f32 {
        self.base_factor
    }

    /// Transformed magnitude for a physical speed.
    ///
    /// Exponent 0 yields `factor` for every positive speed, sidestepping the
    /// `0^0` ambiguity at zero speed.
    pub fn transform_speed(&self, speed: f32) -> f32 {
        if speed <= 0.0 {
            return 0.0;
        }
        if self.exponent == 0.0 {
            self.factor
        } else {
            self.factor * speed.powf(self.exponent)
        }
    }

    /// Transform a velocity vector, preserving its direction.
    pub fn transform_velocity(&self, velocity: glam::Vec2) -> glam::Vec2 {
        let speed = velocity.length();
        if speed <= 0.0 {
            return glam::Vec2::ZERO;
        }
        velocity / speed * self.transform_speed(speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    #[test]
    fn test_reference_speed_maps_to_scaled_reference() {
        for &(exponent, factor, speed) in &[
            (1.0, 1.0, 1.0),
            (0.5, 2.0, 3.0),
            (0.25, 0.1, 12.5),
            (2.0, 0.7, 0.3),
            (0.0, 1.5, 4.0),
        ] {
            let curve = SpeedCurve::from_exponent_factor_and_speed(exponent, factor, speed);
            let transformed = curve.transform_speed(speed);
            assert!(
                (transformed - factor * speed).abs() < 1e-4 * (factor * speed).max(1.0),
                "exponent {exponent}: {transformed} != {}",
                factor * speed
            );
        }
    }

    #[test]
    fn test_zero_exponent_is_constant_speed() {
        let curve = SpeedCurve::from_exponent_factor_and_speed(0.0, 1.0, 2.0);
        assert_eq!(curve.transform_speed(0.01), 2.0);
        assert_eq!(curve.transform_speed(100.0), 2.0);
        assert_eq!(curve.transform_speed(0.0), 0.0);
    }

    #[test]
    fn test_direction_is_preserved() {
        let curve = SpeedCurve::from_exponent_factor_and_speed(0.5, 1.0, 4.0);
        let v = curve.transform_velocity(Vec2::new(3.0, -4.0));
        let dir = v.normalize();
        assert!((dir - Vec2::new(0.6, -0.8)).length() < 1e-5);
    }

    #[test]
    fn test_compression_flattens_range() {
        let curve = SpeedCurve::from_exponent_factor_and_speed(0.5, 1.0, 1.0);
        let slow = curve.transform_speed(0.01);
        let fast = curve.transform_speed(100.0);
        // Physical ratio is 10^4, compressed ratio is 10^2.
        assert!((fast / slow - 100.0).abs() < 1e-2);
    }

    #[test]
    fn test_non_positive_reference_falls_back() {
        let curve = SpeedCurve::from_exponent_factor_and_speed(0.5, 3.0, 0.0);
        assert_eq!(curve.factor(), 3.0);
    }
}

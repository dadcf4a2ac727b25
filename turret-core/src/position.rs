//! Pan/tilt angle pairs and their range invariant.
//!
//! A [`Position`] can only be constructed through [`Position::new`] (which
//! rejects anything outside [-90, 90] on either axis) or [`Position::clamped`]
//! (which saturates). Every value handed to an actuator therefore satisfies
//! the range invariant by construction.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MotionError;

/// Lowest accepted angle for both axes, in degrees
pub const MIN_ANGLE: f64 = -90.0;
/// Highest accepted angle for both axes, in degrees
pub const MAX_ANGLE: f64 = 90.0;

/// One of the two rotational axes of the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Pan,
    Tilt,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Pan => write!(f, "pan"),
            Axis::Tilt => write!(f, "tilt"),
        }
    }
}

/// A validated pan/tilt angle pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pan: f64,
    tilt: f64,
}

impl Position {
    /// The centre position (0, 0)
    pub const CENTER: Position = Position { pan: 0.0, tilt: 0.0 };

    /// Create a position, rejecting out-of-range or NaN angles
    pub fn new(pan: f64, tilt: f64) -> Result<Self, MotionError> {
        check_axis(Axis::Pan, pan)?;
        check_axis(Axis::Tilt, tilt)?;
        Ok(Position { pan, tilt })
    }

    /// Create a position, saturating each axis into [-90, 90].
    ///
    /// NaN maps to 0.
    pub fn clamped(pan: f64, tilt: f64) -> Self {
        Position {
            pan: clamp_angle(pan),
            tilt: clamp_angle(tilt),
        }
    }

    pub fn pan(&self) -> f64 {
        self.pan
    }

    pub fn tilt(&self) -> f64 {
        self.tilt
    }

    /// Largest per-axis difference to `other`, in degrees
    pub fn max_axis_distance(&self, other: &Position) -> f64 {
        (self.pan - other.pan)
            .abs()
            .max((self.tilt - other.tilt).abs())
    }
}

impl Default for Position {
    fn default() -> Self {
        Position::CENTER
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(pan {:.2}, tilt {:.2})", self.pan, self.tilt)
    }
}

// Deserialization goes through `new` so the range invariant also holds for
// positions that arrive as JSON.
impl<'de> Deserialize<'de> for Position {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            pan: f64,
            tilt: f64,
        }
        let raw = Raw::deserialize(deserializer)?;
        Position::new(raw.pan, raw.tilt).map_err(serde::de::Error::custom)
    }
}

fn check_axis(axis: Axis, value: f64) -> Result<(), MotionError> {
    if value.is_nan() || !(MIN_ANGLE..=MAX_ANGLE).contains(&value) {
        return Err(MotionError::OutOfRange { axis, value });
    }
    Ok(())
}

/// Saturate an angle into [-90, 90]; NaN becomes 0
pub fn clamp_angle(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(MIN_ANGLE, MAX_ANGLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_full_range() {
        for pan in [-90.0, -45.5, 0.0, 12.25, 90.0] {
            for tilt in [-90.0, -0.1, 0.0, 89.9, 90.0] {
                let p = Position::new(pan, tilt).unwrap();
                assert_eq!(p.pan(), pan);
                assert_eq!(p.tilt(), tilt);
            }
        }
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert_eq!(
            Position::new(90.5, 0.0),
            Err(MotionError::OutOfRange {
                axis: Axis::Pan,
                value: 90.5
            })
        );
        assert!(matches!(
            Position::new(0.0, -91.0),
            Err(MotionError::OutOfRange {
                axis: Axis::Tilt,
                ..
            })
        ));
        assert!(Position::new(f64::NAN, 0.0).is_err());
        assert!(Position::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_clamped() {
        let p = Position::clamped(200.0, -1000.0);
        assert_eq!(p, Position::new(90.0, -90.0).unwrap());
        assert_eq!(Position::clamped(f64::NAN, 3.0).pan(), 0.0);
    }

    #[test]
    fn test_deserialize_validates() {
        let p: Position = serde_json::from_str(r#"{"pan": -45, "tilt": 30.5}"#).unwrap();
        assert_eq!(p, Position::new(-45.0, 30.5).unwrap());

        let r: Result<Position, _> = serde_json::from_str(r#"{"pan": -95, "tilt": 0}"#);
        assert!(r.is_err());
    }

    #[test]
    fn test_negative_values_survive_json() {
        let p = Position::new(-45.0, -30.0).unwrap();
        let text = serde_json::to_string(&p).unwrap();
        assert_eq!(text, r#"{"pan":-45.0,"tilt":-30.0}"#);
        let back: Position = serde_json::from_str(&text).unwrap();
        assert_eq!(back, p);
    }
}

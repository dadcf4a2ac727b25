//! Motion requests and where they come from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::MotionError;
use crate::position::Position;

/// Origin of a motion request.
///
/// The arbiter does not prioritise between sources; the value is carried for
/// logging, events and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MotionSource {
    Manual,
    AutoSweep,
    AutoTrack,
    Reset,
}

impl fmt::Display for MotionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionSource::Manual => write!(f, "manual"),
            MotionSource::AutoSweep => write!(f, "auto-sweep"),
            MotionSource::AutoTrack => write!(f, "auto-track"),
            MotionSource::Reset => write!(f, "reset"),
        }
    }
}

/// A single request to hold a position for some time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRequest {
    pub target: Position,
    pub duration: Duration,
    pub source: MotionSource,
}

impl MotionRequest {
    pub fn new(target: Position, duration: Duration, source: MotionSource) -> Self {
        Self {
            target,
            duration,
            source,
        }
    }

    /// Build a request from raw angles, validating the range
    pub fn from_angles(
        pan: f64,
        tilt: f64,
        duration: Duration,
        source: MotionSource,
    ) -> Result<Self, MotionError> {
        Ok(Self::new(Position::new(pan, tilt)?, duration, source))
    }

    /// Request that returns the platform to (0, 0)
    pub fn reset(duration: Duration) -> Self {
        Self::new(Position::CENTER, duration, MotionSource::Reset)
    }
}

/// Turn a (possibly fractional, possibly negative) number of seconds into a
/// duration. Negative and NaN values become zero.
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(secs.min(u32::MAX as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_targets_center() {
        let r = MotionRequest::reset(Duration::from_secs(10));
        assert_eq!(r.target, Position::CENTER);
        assert_eq!(r.source, MotionSource::Reset);
    }

    #[test]
    fn test_from_angles_validates() {
        assert!(MotionRequest::from_angles(45.0, -30.0, Duration::ZERO, MotionSource::Manual).is_ok());
        assert!(MotionRequest::from_angles(100.0, 0.0, Duration::ZERO, MotionSource::Manual).is_err());
    }

    #[test]
    fn test_duration_from_secs() {
        assert_eq!(duration_from_secs(-1.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs(2.5), Duration::from_millis(2500));
    }

    #[test]
    fn test_source_serialization() {
        assert_eq!(
            serde_json::to_string(&MotionSource::AutoSweep).unwrap(),
            "\"auto-sweep\""
        );
        assert_eq!(MotionSource::AutoTrack.to_string(), "auto-track");
    }
}

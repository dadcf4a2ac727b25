//! # Turret Core
//!
//! Platform-independent motion logic for a two-axis pan/tilt platform.
//!
//! This crate contains the data model, policies and wire formatting with
//! **no async runtime and no I/O**. The server crate supplies the clock, the
//! tasks and the I2C bus.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  turret-core (pure logic, no tokio)                         │
//! │  ├── position/   (validated angle pairs)                    │
//! │  ├── state/      (last commanded position, active session)  │
//! │  ├── session/    (hold loop state machine, fault policy)    │
//! │  ├── sweep/      (sine trajectory)                          │
//! │  ├── tracking/   (centroid mapping, detection selection)    │
//! │  ├── actuator/   (driver trait, simulator)                  │
//! │  ├── protocol/   (Pan-Tilt HAT, PCA9685, stepper coils)     │
//! │  └── mjpeg/      (frame splitting)                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                ┌─────────────┴─────────────┐
//!                │  turret-server            │
//!                │  (arbiter, HTTP/SSE, I2C) │
//!                └───────────────────────────┘
//! ```
//!
//! ## Example: Holding a Target
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use turret_core::{HoldPolicy, HoldTracker, Position, SessionState};
//!
//! let target = Position::new(45.0, -30.0).unwrap();
//! let t0 = Instant::now();
//! let mut hold = HoldTracker::new(t0, Duration::from_millis(250), HoldPolicy::default());
//!
//! // Command `target`, then wait and re-assert until the deadline
//! hold.record_success();
//! assert_eq!(hold.next_wait(t0), Some(Duration::from_millis(100)));
//! assert_eq!(hold.next_wait(t0 + Duration::from_secs(1)), None);
//! assert_eq!(hold.state(), SessionState::Expired);
//! # let _ = target;
//! ```

pub mod actuator;
pub mod error;
pub mod mjpeg;
pub mod motion;
pub mod position;
pub mod protocol;
pub mod session;
pub mod state;
pub mod sweep;
pub mod tracking;

// Re-export commonly used types
pub use actuator::{Actuator, SimulatedActuator};
pub use error::{ActuatorError, MotionError};
pub use motion::{duration_from_secs, MotionRequest, MotionSource};
pub use position::{Axis, Position, MAX_ANGLE, MIN_ANGLE};
pub use session::{FaultVerdict, HoldPolicy, HoldTracker, SessionId, SessionState};
pub use state::PositionState;
pub use sweep::{SweepConfig, SweepTrajectory};
pub use tracking::{select_detection, Centroid, Detection, TrackHistory, TrackingConfig};

/// Serde helper storing a `Duration` as whole milliseconds
pub(crate) mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

//! Error types for motion requests and actuator commands

use thiserror::Error;

use crate::position::Axis;

/// Errors that can occur when a motion request is evaluated or executed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MotionError {
    /// Requested angle is outside [-90, 90] (or not a number)
    #[error("{axis} angle {value} is out of range [-90, 90]")]
    OutOfRange { axis: Axis, value: f64 },

    /// Actuator command failed
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// Camera could not be opened or stopped delivering frames
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Vision detector could not process a frame
    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),
}

/// Errors reported by an actuator driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    /// The bus write did not complete
    #[error("Bus error on {device}: {message}")]
    Bus { device: String, message: String },

    /// Driver has not been initialised or was shut down
    #[error("Actuator '{0}' is not ready")]
    NotReady(String),

    /// Fault injected or reported by the device itself
    #[error("Device fault: {0}")]
    Device(String),
}

impl From<ActuatorError> for MotionError {
    fn from(e: ActuatorError) -> Self {
        MotionError::HardwareFault(e.to_string())
    }
}

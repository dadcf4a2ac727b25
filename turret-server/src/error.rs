use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;
use turret_core::{ActuatorError, MotionError};

#[derive(Error, Debug)]
pub enum TurretError {
    #[error("{0}")]
    Motion(#[from] MotionError),
    #[error("{0}")]
    Actuator(#[from] ActuatorError),
    #[error("I/O operation failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot read config file '{path}': {message}")]
    Config { path: PathBuf, message: String },
    #[error("{0}")]
    ModeConflict(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl TurretError {
    pub fn status(&self) -> StatusCode {
        match self {
            TurretError::Motion(MotionError::OutOfRange { .. }) | TurretError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            TurretError::ModeConflict(_) => StatusCode::CONFLICT,
            TurretError::Motion(MotionError::CameraUnavailable(_))
            | TurretError::Motion(MotionError::DetectorUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Tell axum how to convert `TurretError` into a response.
impl IntoResponse for TurretError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turret_core::Axis;

    #[test]
    fn test_status_mapping() {
        let e: TurretError = MotionError::OutOfRange {
            axis: Axis::Pan,
            value: 100.0,
        }
        .into();
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            TurretError::ModeConflict("tracking disabled".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TurretError::from(MotionError::CameraUnavailable("no device".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TurretError::from(ActuatorError::NotReady("stepper-hat".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

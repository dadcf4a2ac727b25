//! Combined health snapshot for `/api/v1/diagnostics`

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::arbiter::{ActuatorHealth, ArbiterSnapshot};
use crate::camera::CameraDiagnostics;
use crate::modes::ControlMode;
use crate::tracking::TrackingStatus;
use crate::{Turret, VERSION};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    pub mode: ControlMode,
    pub motion: ArbiterSnapshot,
    pub actuator: ActuatorHealth,
    pub camera: CameraDiagnostics,
    pub tracking: TrackingStatus,
}

pub fn collect(turret: &Turret) -> Diagnostics {
    Diagnostics {
        timestamp: Utc::now(),
        version: VERSION,
        mode: turret.modes.mode(),
        motion: turret.arbiter.snapshot(),
        actuator: turret.arbiter.health(),
        camera: turret.camera.diagnostics(),
        tracking: turret.tracking().status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use turret_core::{MotionSource, Position};

    #[tokio::test]
    async fn test_collect_reflects_actuator() {
        let (turret, sim) = Turret::new_fake();
        let handle = turret
            .arbiter
            .request_angles(10.0, -20.0, Duration::from_millis(30), MotionSource::Manual)
            .unwrap();
        handle.wait().await;

        let d = collect(&turret);
        assert_eq!(d.mode, ControlMode::Manual);
        assert_eq!(d.actuator.driver, "simulated");
        assert_eq!(d.actuator.commands, sim.command_count() as u64);
        assert_eq!(d.actuator.last_commanded, Some(Position::new(10.0, -20.0).unwrap()));
        assert!(d.motion.active_session.is_none());

        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["camera"]["status"]["state"], "disabled");
        assert_eq!(json["mode"], "manual");
    }
}

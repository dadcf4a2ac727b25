//! Configuration file.
//!
//! JSON, every section optional. The default location is
//! `<config_dir>/turret.json` as given by the platform's project dirs; a
//! missing default file means built-in defaults. Command line flags are
//! applied on top with [`TurretConfig::apply_cli`].

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use turret_core::protocol::{pantilt_hat::PanTiltHatConfig, stepper::StepperHatConfig};
use turret_core::{HoldPolicy, SweepConfig, TrackingConfig};

use crate::camera::CameraConfig;
use crate::error::TurretError;
use crate::Cli;

pub const CONFIG_FILE: &str = "turret.json";

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "fanturret", "turret")
}

/// Where the config file is looked up when `--config` is not given
pub fn default_config_path() -> Option<PathBuf> {
    get_project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HoldConfig {
    pub reassert_interval_ms: u64,
    pub fault_threshold: u32,
    /// Used by `/set` and `/reset` when no duration is given
    pub default_duration_secs: f64,
    /// Time between two progress events of a hold stream
    pub progress_interval_ms: u64,
}

impl Default for HoldConfig {
    fn default() -> Self {
        let policy = HoldPolicy::default();
        Self {
            reassert_interval_ms: policy.reassert_interval.as_millis() as u64,
            fault_threshold: policy.fault_threshold,
            default_duration_secs: 10.0,
            progress_interval_ms: 500,
        }
    }
}

impl HoldConfig {
    pub fn policy(&self) -> HoldPolicy {
        HoldPolicy {
            reassert_interval: Duration::from_millis(self.reassert_interval_ms.max(1)),
            fault_threshold: self.fault_threshold.max(1),
        }
    }

    pub fn default_duration(&self) -> Duration {
        turret_core::duration_from_secs(self.default_duration_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurretConfig {
    pub hold: HoldConfig,
    pub sweep: SweepConfig,
    pub tracking: TrackingConfig,
    pub camera: CameraConfig,
    #[serde(alias = "pantilt_hat")]
    pub pantilt_hat: PanTiltHatConfig,
    #[serde(alias = "stepper_hat")]
    pub stepper_hat: StepperHatConfig,
}

impl TurretConfig {
    /// Read the configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and defaults are used if nothing is there.
    pub fn load(path: Option<&Path>) -> Result<Self, TurretError> {
        match path {
            Some(path) => Self::read(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::read(&path),
                Some(path) => {
                    log::debug!("No config file at {}, using defaults", path.display());
                    Ok(Self::default())
                }
                None => Ok(Self::default()),
            },
        }
    }

    fn read(path: &Path) -> Result<Self, TurretError> {
        let config_error = |message: String| TurretError::Config {
            path: path.to_owned(),
            message,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        let config = serde_json::from_str(&contents).map_err(|e| config_error(e.to_string()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), TurretError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| TurretError::Config {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Command line flags override file values
    pub fn apply_cli(&mut self, args: &Cli) {
        if let Some(ms) = args.reassert_ms {
            self.hold.reassert_interval_ms = ms;
        }
        if let Some(n) = args.fault_threshold {
            self.hold.fault_threshold = n;
        }
        if let Some(index) = args.camera_index {
            self.camera.primary_index = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TurretConfig::default();
        assert_eq!(config.hold.policy(), HoldPolicy::default());
        assert_eq!(config.hold.default_duration(), Duration::from_secs(10));
        assert_eq!(config.pantilt_hat.address, 0x15);
        assert_eq!(config.stepper_hat.address, 0x40);
        assert_eq!(config.camera.backup_indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "hold": {{ "reassertIntervalMs": 50 }},
                "sweep": {{ "amplitude": 45.0, "tick": 200 }},
                "pantilt_hat": {{ "address": 22 }}
            }}"#
        )
        .unwrap();

        let config = TurretConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.hold.reassert_interval_ms, 50);
        assert_eq!(config.hold.fault_threshold, 3);
        assert_eq!(config.sweep.amplitude, 45.0);
        assert_eq!(config.sweep.tick, Duration::from_millis(200));
        assert_eq!(config.sweep.angular_frequency, 2.0);
        assert_eq!(config.pantilt_hat.address, 22);
        assert_eq!(config.tracking, TrackingConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let mut config = TurretConfig::default();
        config.tracking.invert_pan = true;
        config.camera.primary_index = 2;
        config.save(&path).unwrap();

        assert_eq!(TurretConfig::load(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            TurretConfig::load(Some(&missing)),
            Err(TurretError::Config { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let err = TurretConfig::load(Some(&bad)).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn test_cli_overrides() {
        let args = Cli::parse_from([
            "turret-server",
            "--reassert-ms",
            "20",
            "--fault-threshold",
            "5",
            "--camera-index",
            "1",
        ]);
        let mut config = TurretConfig::default();
        config.apply_cli(&args);
        assert_eq!(config.hold.policy().reassert_interval, Duration::from_millis(20));
        assert_eq!(config.hold.policy().fault_threshold, 5);
        assert_eq!(config.camera.primary_index, 1);
    }
}

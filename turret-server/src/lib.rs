//! # Turret Server
//!
//! Network control surface for a two-axis pan/tilt platform with a camera.
//!
//! This crate provides:
//! - The Motion Arbiter, holding positions against drift for a duration
//! - An automatic sine sweep and a vision auto-tracking feed
//! - MJPEG video passthrough from a V4L2 camera
//! - A REST API with SSE progress and event streams
//! - I2C drivers for the Pimoroni Pan-Tilt HAT and PCA9685 stepper boards
//!
//! ## Architecture
//!
//! The pure motion logic lives in [`turret_core`]; this crate adds the
//! runtime around it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     turret-server                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌───────────────────┐ │
//! │  │ REST API    │  │ SSE streams │  │ /video_feed       │ │
//! │  │ (axum)      │  │ set/control │  │ (multipart MJPEG) │ │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────┬─────────┘ │
//! │         │                │                   │           │
//! │         ▼                ▼                   ▼           │
//! │  ┌─────────────────────────────┐  ┌────────────────────┐ │
//! │  │ ModeController              │  │ CameraManager      │ │
//! │  │  sweep task / TrackingFeed  │  │  capture process   │ │
//! │  └──────────────┬──────────────┘  └────────────────────┘ │
//! │                 ▼                                        │
//! │  ┌─────────────────────────────────────────────────────┐ │
//! │  │ Arbiter: PositionState + one hold loop at a time    │ │
//! │  └──────────────┬──────────────────────────────────────┘ │
//! │                 ▼                                        │
//! │  ┌─────────────────────────────────────────────────────┐ │
//! │  │ Actuator: simulated | pantilt-hat | stepper-hat     │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`Turret`] - Main application state container
//! - [`arbiter::Arbiter`] - Last-writer-wins owner of the actuator
//! - [`modes::ModeController`] - Sweep and tracking, mutually exclusive
//! - [`camera::CameraManager`] - Camera open/retry policy and frame fan-out
//! - [`web::Web`] - HTTP routes
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use turret_server::{config::TurretConfig, Cli, Turret};
//! use turret_core::SimulatedActuator;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["turret-server", "-p", "8080"]);
//!     let mut config = TurretConfig::load(args.config.as_deref()).unwrap();
//!     config.apply_cli(&args);
//!
//!     let turret = Turret::new(config, Box::new(SimulatedActuator::new()), !args.no_camera);
//!     let handle = turret.arbiter.request_angles(
//!         45.0,
//!         -30.0,
//!         std::time::Duration::from_secs(5),
//!         turret_core::MotionSource::Manual,
//!     );
//!     assert!(handle.is_ok());
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-p, --port` - HTTP server port (default: 5000)
//! - `-d, --driver` - `simulated`, `pantilt-hat` or `stepper-hat`
//! - `--no-camera` - Run without opening a camera
//! - `-v` - Increase verbosity (use multiple times)

use clap::Parser;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

pub mod arbiter;
pub mod camera;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod hardware;
pub mod modes;
pub mod sweep;
pub mod tracking;
pub mod web;

use arbiter::Arbiter;
use camera::CameraManager;
use config::TurretConfig;
use modes::ModeController;
use tracking::TrackingFeed;
use turret_core::Actuator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Driver {
    /// No hardware; commands are only recorded
    #[default]
    Simulated,
    /// Pimoroni Pan-Tilt HAT (two servos)
    PantiltHat,
    /// PCA9685-based stepper motor HAT
    StepperHat,
}

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Port for webserver
    #[arg(short, long, default_value_t = 5000)]
    pub port: u16,

    /// Address to listen on
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Actuator driver
    #[arg(short, long, default_value_t, value_enum)]
    pub driver: Driver,

    /// I2C bus number, as in /dev/i2c-N
    #[arg(long, default_value_t = 1)]
    pub i2c_bus: u8,

    /// Configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Do not open a camera
    #[arg(long, default_value_t = false)]
    pub no_camera: bool,

    /// Primary camera index, overrides the config file
    #[arg(long)]
    pub camera_index: Option<u32>,

    /// Position re-assertion interval in milliseconds
    #[arg(long)]
    pub reassert_ms: Option<u64>,

    /// Consecutive hardware faults that end a session
    #[arg(long)]
    pub fault_threshold: Option<u32>,
}

/// Everything the request handlers need; cheap to clone
#[derive(Clone)]
pub struct Turret {
    pub arbiter: Arbiter,
    pub modes: ModeController,
    pub camera: CameraManager,
    pub config: Arc<TurretConfig>,
}

impl Turret {
    pub fn new(config: TurretConfig, actuator: Box<dyn Actuator>, camera_enabled: bool) -> Self {
        let arbiter = Arbiter::new(actuator, config.hold.policy());
        let tracking = Arc::new(TrackingFeed::new(arbiter.clone(), config.tracking));
        let modes = ModeController::new(arbiter.clone(), config.sweep, tracking);
        let camera = if camera_enabled {
            CameraManager::new(config.camera.clone())
        } else {
            CameraManager::disabled()
        };
        Turret {
            arbiter,
            modes,
            camera,
            config: Arc::new(config),
        }
    }

    pub fn tracking(&self) -> &Arc<TrackingFeed> {
        self.modes.tracking()
    }

    /// Simulated turret with short timings, for tests
    #[cfg(test)]
    pub(crate) fn new_fake() -> (Self, turret_core::SimulatedActuator) {
        let sim = turret_core::SimulatedActuator::new();
        let mut config = TurretConfig::default();
        config.hold.reassert_interval_ms = 10;
        config.hold.progress_interval_ms = 20;
        config.sweep.tick = std::time::Duration::from_millis(10);
        config.tracking.detection_interval = std::time::Duration::from_millis(10);
        config.tracking.guard_margin = std::time::Duration::from_millis(10);
        (Turret::new(config, Box::new(sim.clone()), false), sim)
    }
}

impl std::fmt::Debug for Turret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Turret")
            .field("arbiter", &self.arbiter)
            .field("mode", &self.modes.mode())
            .field("camera", &self.camera.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Cli::parse_from(["turret-server"]);
        assert_eq!(args.port, 5000);
        assert_eq!(args.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(args.driver, Driver::Simulated);
        assert_eq!(args.i2c_bus, 1);
        assert!(!args.no_camera);
        assert_eq!(args.reassert_ms, None);
    }

    #[test]
    fn test_cli_driver() {
        let args = Cli::parse_from(["turret-server", "-d", "stepper-hat", "--i2c-bus", "0"]);
        assert_eq!(args.driver, Driver::StepperHat);
        assert_eq!(args.i2c_bus, 0);
    }
}

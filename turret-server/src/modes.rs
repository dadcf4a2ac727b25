//! Automatic control modes.
//!
//! Sweep and tracking are mutually exclusive request sources. Manual
//! requests do not change the mode; they simply win the next arbitration.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use turret_core::SweepConfig;

use crate::arbiter::Arbiter;
use crate::sweep::{run_sweep, SweepPoint, SWEEP_CHANNEL_SIZE};
use crate::tracking::TrackingFeed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMode {
    Manual,
    AutoSweep,
    AutoTrack,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMode::Manual => write!(f, "manual"),
            ControlMode::AutoSweep => write!(f, "auto-sweep"),
            ControlMode::AutoTrack => write!(f, "auto-track"),
        }
    }
}

struct RunningSweep {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ModeState {
    sweep: Option<RunningSweep>,
    next_sweep: u64,
}

/// Receiving side of one sweep; dropping it stops the sweep
pub struct SweepSubscription {
    pub id: u64,
    pub points: mpsc::Receiver<SweepPoint>,
}

#[derive(Clone)]
pub struct ModeController {
    arbiter: Arbiter,
    sweep_config: SweepConfig,
    tracking: Arc<TrackingFeed>,
    state: Arc<Mutex<ModeState>>,
}

impl ModeController {
    pub fn new(arbiter: Arbiter, sweep_config: SweepConfig, tracking: Arc<TrackingFeed>) -> Self {
        Self {
            arbiter,
            sweep_config,
            tracking,
            state: Arc::new(Mutex::new(ModeState::default())),
        }
    }

    pub fn tracking(&self) -> &Arc<TrackingFeed> {
        &self.tracking
    }

    pub fn mode(&self) -> ControlMode {
        let state = self.lock();
        if state.sweep.is_some() {
            ControlMode::AutoSweep
        } else if self.tracking.is_enabled() {
            ControlMode::AutoTrack
        } else {
            ControlMode::Manual
        }
    }

    /// Start a new sweep, replacing any running one and disabling tracking
    pub fn start_sweep(&self) -> SweepSubscription {
        let (tx, points) = mpsc::channel(SWEEP_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let id = {
            let mut state = self.lock();
            self.tracking.set_enabled(false);
            state.next_sweep += 1;
            let id = state.next_sweep;
            if let Some(old) = state.sweep.replace(RunningSweep {
                id,
                cancel: cancel.clone(),
            }) {
                log::info!("Sweep {} replaced by sweep {}", old.id, id);
                old.cancel.cancel();
            }
            id
        };

        let controller = self.clone();
        let arbiter = self.arbiter.clone();
        let config = self.sweep_config;
        tokio::spawn(async move {
            run_sweep(arbiter, config, tx, cancel).await;
            controller.sweep_finished(id);
        });

        SweepSubscription { id, points }
    }

    /// Stop the running sweep, if any
    pub fn stop_sweep(&self) -> bool {
        Self::take_sweep(&mut self.lock())
    }

    /// Stop any sweep and enable tracking; both happen under the mode lock
    pub fn enable_tracking(&self) {
        let mut state = self.lock();
        if Self::take_sweep(&mut state) {
            log::info!("Sweep stopped for auto-tracking");
        }
        self.tracking.set_enabled(true);
    }

    pub fn disable_tracking(&self) {
        let _state = self.lock();
        self.tracking.set_enabled(false);
    }

    fn take_sweep(state: &mut ModeState) -> bool {
        match state.sweep.take() {
            Some(sweep) => {
                sweep.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn sweep_finished(&self, id: u64) {
        let mut state = self.lock();
        if state.sweep.as_ref().is_some_and(|s| s.id == id) {
            state.sweep = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

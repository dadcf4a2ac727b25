//! PCA9685 stepper HAT driver.
//!
//! A step thread owns the stepping: `move_to` only replaces the target and
//! returns, and the thread keeps heading for the newest target one step per
//! `step_delay` until it gets there. A newer target takes over between two
//! steps, so a superseded move never runs to completion.
//!
//! Bus faults hit by the step thread are reported by the next `move_to`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use turret_core::protocol::pca9685::{init_sequence, InitStep};
use turret_core::protocol::stepper::{StepperAxis, StepperHatConfig};
use turret_core::protocol::RegisterWrite;
use turret_core::{Actuator, ActuatorError, Position};

use super::i2c::RegisterBus;

struct Drive<B> {
    bus: B,
    pan: StepperAxis,
    tilt: StepperAxis,
    /// Step counts to head for; `None` when idle
    target: Option<(i64, i64)>,
    fault: Option<ActuatorError>,
    stop: bool,
}

impl<B: RegisterBus> Drive<B> {
    /// One step on each axis that is not yet there; `false` once both are
    fn step(&mut self, (pan_target, tilt_target): (i64, i64)) -> Result<bool, ActuatorError> {
        let pan = self.pan.step_toward(pan_target);
        let tilt = self.tilt.step_toward(tilt_target);
        if let Some(pattern) = pan {
            let writes = self.pan.coil_writes(pattern);
            write_channels(&mut self.bus, &writes)?;
        }
        if let Some(pattern) = tilt {
            let writes = self.tilt.coil_writes(pattern);
            write_channels(&mut self.bus, &writes)?;
        }
        Ok(pan.is_some() || tilt.is_some())
    }
}

struct Shared<B> {
    drive: Mutex<Drive<B>>,
    /// Signalled on a new target and on shutdown
    wake: Condvar,
    /// Signalled when the step thread goes idle
    idle: Condvar,
}

impl<B> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, Drive<B>> {
        self.drive.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct StepperHat<B: RegisterBus + 'static> {
    shared: Arc<Shared<B>>,
    config: StepperHatConfig,
    worker: Option<JoinHandle<()>>,
}

impl<B: RegisterBus + 'static> StepperHat<B> {
    /// Bring up the PCA9685, assume both shafts sit at 0° and start the
    /// step thread
    pub fn new(mut bus: B, config: StepperHatConfig) -> Result<Self, ActuatorError> {
        for step in init_sequence(config.pwm_frequency) {
            match step {
                InitStep::Write((reg, value)) => bus.write(&[reg, value])?,
                InitStep::Delay(d) => thread::sleep(d),
            }
        }
        log::debug!(
            "PCA9685 at {:#04x} initialised for {} Hz",
            config.address,
            config.pwm_frequency
        );

        let shared = Arc::new(Shared {
            drive: Mutex::new(Drive {
                bus,
                pan: StepperAxis::new(config.pan),
                tilt: StepperAxis::new(config.tilt),
                target: None,
                fault: None,
                stop: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });
        let delay = Duration::from_micros(config.step_delay_us);
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("stepper".into())
                .spawn(move || run_steps(&shared, delay))
                .map_err(|e| ActuatorError::NotReady(format!("stepper thread: {}", e)))?
        };

        Ok(Self {
            shared,
            config,
            worker: Some(worker),
        })
    }

    /// Current shaft angles according to the step counters
    pub fn current(&self) -> (f64, f64) {
        let drive = self.shared.lock();
        (drive.pan.current_degrees(), drive.tilt.current_degrees())
    }

    /// Block until the step thread is idle or `timeout` passes; `true` if idle
    pub fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut drive = self.shared.lock();
        while drive.target.is_some() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            drive = self
                .shared
                .idle
                .wait_timeout(drive, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

fn run_steps<B: RegisterBus>(shared: &Shared<B>, delay: Duration) {
    let mut drive = shared.lock();
    while !drive.stop {
        let Some(target) = drive.target else {
            drive = shared.wake.wait(drive).unwrap_or_else(PoisonError::into_inner);
            continue;
        };
        match drive.step(target) {
            Ok(true) => {
                drop(drive);
                thread::sleep(delay);
                drive = shared.lock();
            }
            Ok(false) => {
                drive.target = None;
                shared.idle.notify_all();
            }
            Err(e) => {
                log::warn!("Stepper move abandoned: {}", e);
                drive.fault = Some(e);
                drive.target = None;
                shared.idle.notify_all();
            }
        }
    }
}

// Each channel is four consecutive registers; with auto-increment they
// go out as one transaction.
fn write_channels<B: RegisterBus>(bus: &mut B, writes: &[RegisterWrite]) -> Result<(), ActuatorError> {
    for channel in writes.chunks(4) {
        let mut bytes = Vec::with_capacity(channel.len() + 1);
        bytes.push(channel[0].0);
        bytes.extend(channel.iter().map(|&(_, v)| v));
        bus.write(&bytes)?;
    }
    Ok(())
}

impl<B: RegisterBus + 'static> Actuator for StepperHat<B> {
    fn name(&self) -> &str {
        "stepper-hat"
    }

    fn move_to(&mut self, target: Position) -> Result<(), ActuatorError> {
        let mut drive = self.shared.lock();
        let steps = (
            drive.pan.target_step(target.pan()),
            drive.tilt.target_step(target.tilt()),
        );
        // Retarget even after a fault, so re-assertion retries the move
        drive.target = Some(steps);
        self.shared.wake.notify_one();
        match drive.fault.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        let mut drive = self.shared.lock();
        drive.target = None;
        self.shared.idle.notify_all();
        let mut writes = drive.pan.release_writes();
        writes.extend(drive.tilt.release_writes());
        write_channels(&mut drive.bus, &writes)
    }
}

impl<B: RegisterBus + 'static> Drop for StepperHat<B> {
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("Stepper thread panicked");
            }
        }
    }
}

impl<B: RegisterBus + 'static> std::fmt::Debug for StepperHat<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepperHat")
            .field("address", &self.config.address)
            .field("current", &self.current())
            .finish()
    }
}

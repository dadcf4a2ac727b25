//! Actuator abstraction for the two-axis platform.
//!
//! Drivers implement [`Actuator`]. The arbiter only ever talks to the trait,
//! so the servo HAT, the stepper HAT and the simulator are interchangeable.
//!
//! Calls are synchronous and may block for the duration of a bus transfer (or
//! of a stepper move); the server runs them on the blocking thread pool.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::ActuatorError;
use crate::position::Position;

/// A position-controlled pan/tilt mechanism
pub trait Actuator: Send {
    /// Short driver name for logs and diagnostics, e.g. `"pantilt-hat"`
    fn name(&self) -> &str;

    /// Command both axes to `target`.
    ///
    /// # Errors
    ///
    /// Returns an [`ActuatorError`] if the command could not be delivered.
    fn move_to(&mut self, target: Position) -> Result<(), ActuatorError>;

    /// Stop driving the motors (de-energise coils, disable servo outputs)
    fn release(&mut self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn move_to(&mut self, target: Position) -> Result<(), ActuatorError> {
        (**self).move_to(target)
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        (**self).release()
    }
}

/// Recent commands kept by the simulator; older ones only count
pub const SIMULATOR_HISTORY: usize = 256;

/// What the simulator has been asked to do
#[derive(Debug, Default, Clone)]
pub struct SimulatorLog {
    /// The last [`SIMULATOR_HISTORY`] successful commands, oldest first
    pub recent: VecDeque<Position>,
    /// Successful commands since start
    pub commands: u64,
    pub faults: u64,
    pub releases: u64,
    fail_next: u32,
    fail_always: bool,
}

/// In-process actuator that records commands instead of moving anything.
///
/// Clones share the same log, so a test can keep one clone for inspection
/// while the arbiter owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedActuator {
    log: Arc<Mutex<SimulatorLog>>,
    latency: Duration,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `move_to`, like a slow bus would
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `n` commands fail
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Make every command fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.lock().fail_always = failing;
    }

    /// Recent commands, oldest first
    pub fn commands(&self) -> Vec<Position> {
        self.lock().recent.iter().copied().collect()
    }

    pub fn command_count(&self) -> usize {
        self.lock().commands as usize
    }

    pub fn last_command(&self) -> Option<Position> {
        self.lock().recent.back().copied()
    }

    pub fn snapshot(&self) -> SimulatorLog {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatorLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Actuator for SimulatedActuator {
    fn name(&self) -> &str {
        "simulated"
    }

    fn move_to(&mut self, target: Position) -> Result<(), ActuatorError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let mut log = self.lock();
        if log.fail_always || log.fail_next > 0 {
            log.fail_next = log.fail_next.saturating_sub(1);
            log.faults += 1;
            return Err(ActuatorError::Device(format!(
                "simulated fault moving to {}",
                target
            )));
        }
        if log.recent.len() == SIMULATOR_HISTORY {
            log.recent.pop_front();
        }
        log.recent.push_back(target);
        log.commands += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.lock().releases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_commands() {
        let sim = SimulatedActuator::new();
        let mut driver: Box<dyn Actuator> = Box::new(sim.clone());
        let p = Position::new(45.0, -30.0).unwrap();
        driver.move_to(p).unwrap();
        driver.move_to(Position::CENTER).unwrap();
        assert_eq!(driver.name(), "simulated");
        assert_eq!(sim.commands(), vec![p, Position::CENTER]);
        assert_eq!(sim.last_command(), Some(Position::CENTER));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sim = SimulatedActuator::new();
        let total = SIMULATOR_HISTORY + 44;
        for i in 0..total {
            let pan = (i % 90) as f64;
            sim.move_to(Position::new(pan, 0.0).unwrap()).unwrap();
        }
        assert_eq!(sim.command_count(), total);
        let recent = sim.commands();
        assert_eq!(recent.len(), SIMULATOR_HISTORY);
        assert_eq!(recent[0].pan(), (44 % 90) as f64);
        assert_eq!(
            sim.last_command(),
            Some(Position::new(((total - 1) % 90) as f64, 0.0).unwrap())
        );
    }

    #[test]
    fn test_fault_injection() {
        let mut sim = SimulatedActuator::new();
        sim.fail_next(2);
        assert!(sim.move_to(Position::CENTER).is_err());
        assert!(sim.move_to(Position::CENTER).is_err());
        assert!(sim.move_to(Position::CENTER).is_ok());
        let log = sim.snapshot();
        assert_eq!(log.faults, 2);
        assert_eq!(log.commands, 1);

        sim.set_failing(true);
        assert!(matches!(
            sim.move_to(Position::CENTER),
            Err(ActuatorError::Device(_))
        ));
    }
}

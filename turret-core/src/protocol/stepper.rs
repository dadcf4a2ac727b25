//! Unipolar stepper motors driven through PCA9685 channels.
//!
//! Each axis uses four channels, one per coil. Moving one step means
//! advancing through the coil sequence and energising the next pattern. The
//! axis keeps its own step counter; there is no encoder, so the counter is
//! the only notion of where the shaft is.

use serde::{Deserialize, Serialize};

use super::pca9685::{self, set_pin};
use super::RegisterWrite;
use crate::position::clamp_angle;

pub const FULL_STEP_SEQ: [[bool; 4]; 4] = [
    [true, false, true, false],
    [false, true, true, false],
    [false, true, false, true],
    [true, false, false, true],
];

pub const HALF_STEP_SEQ: [[bool; 4]; 8] = [
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
    [true, false, false, true],
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StepperAxisConfig {
    /// PCA9685 channels driving coils A, B, C, D
    pub channels: [u8; 4],
    /// Full steps per output revolution
    pub steps_per_rev: u32,
    /// Output turns per motor turn of any external gearing
    pub gear_ratio: f64,
    /// 1 for full stepping, 2 or more for half stepping
    pub microstep: u32,
}

impl Default for StepperAxisConfig {
    fn default() -> Self {
        Self {
            channels: [0, 1, 2, 3],
            steps_per_rev: 2048,
            gear_ratio: 1.0,
            microstep: 1,
        }
    }
}

impl StepperAxisConfig {
    pub fn sequence(&self) -> &'static [[bool; 4]] {
        if self.microstep >= 2 {
            &HALF_STEP_SEQ
        } else {
            &FULL_STEP_SEQ
        }
    }

    /// Sequence steps per degree of output rotation
    pub fn steps_per_degree(&self) -> f64 {
        let gear = if self.gear_ratio > 0.0 { self.gear_ratio } else { 1.0 };
        self.sequence().len() as f64 * self.steps_per_rev as f64 * gear / 360.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StepperHatConfig {
    pub address: u16,
    pub pwm_frequency: u32,
    pub pan: StepperAxisConfig,
    pub tilt: StepperAxisConfig,
    /// Pause after each step, in microseconds
    pub step_delay_us: u64,
}

impl Default for StepperHatConfig {
    fn default() -> Self {
        Self {
            address: pca9685::DEFAULT_ADDRESS,
            pwm_frequency: 1000,
            pan: StepperAxisConfig::default(),
            tilt: StepperAxisConfig {
                channels: [4, 5, 6, 7],
                ..StepperAxisConfig::default()
            },
            step_delay_us: 1500,
        }
    }
}

/// Step bookkeeping for one axis
#[derive(Debug, Clone)]
pub struct StepperAxis {
    config: StepperAxisConfig,
    sequence: &'static [[bool; 4]],
    phase: usize,
    step: i64,
}

impl StepperAxis {
    /// New axis; the shaft is assumed to sit at 0°
    pub fn new(config: StepperAxisConfig) -> Self {
        Self {
            config,
            sequence: config.sequence(),
            phase: 0,
            step: 0,
        }
    }

    pub fn config(&self) -> &StepperAxisConfig {
        &self.config
    }

    pub fn current_step(&self) -> i64 {
        self.step
    }

    pub fn current_degrees(&self) -> f64 {
        self.step as f64 / self.config.steps_per_degree()
    }

    /// Step count for `degrees`, clamped into [-90, 90]
    pub fn target_step(&self, degrees: f64) -> i64 {
        (clamp_angle(degrees) * self.config.steps_per_degree()).round() as i64
    }

    /// Take one step toward `target` and return the coil pattern to energise.
    ///
    /// `None` once the counter equals `target`.
    pub fn step_toward(&mut self, target: i64) -> Option<[bool; 4]> {
        let len = self.sequence.len();
        match target.cmp(&self.step) {
            std::cmp::Ordering::Equal => return None,
            std::cmp::Ordering::Greater => {
                self.phase = (self.phase + 1) % len;
                self.step += 1;
            }
            std::cmp::Ordering::Less => {
                self.phase = (self.phase + len - 1) % len;
                self.step -= 1;
            }
        }
        Some(self.sequence[self.phase])
    }

    /// Register writes that put `pattern` on this axis' coils
    pub fn coil_writes(&self, pattern: [bool; 4]) -> Vec<RegisterWrite> {
        self.config
            .channels
            .iter()
            .zip(pattern)
            .flat_map(|(&ch, on)| set_pin(ch, on))
            .collect()
    }

    /// Register writes that switch all coils off
    pub fn release_writes(&self) -> Vec<RegisterWrite> {
        self.coil_writes([false; 4])
    }
}

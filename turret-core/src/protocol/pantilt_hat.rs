//! Pimoroni Pan-Tilt HAT.
//!
//! The HAT carries a small microcontroller at I2C address 0x15 that generates
//! the servo pulses. Servo one is pan, servo two is tilt. Pulse widths are
//! written as little-endian 16-bit microsecond values.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::position::{clamp_angle, Position, MAX_ANGLE, MIN_ANGLE};

pub const DEFAULT_ADDRESS: u16 = 0x15;

pub const REG_CONFIG: u8 = 0x00;
pub const REG_SERVO1: u8 = 0x01;
pub const REG_SERVO2: u8 = 0x03;

bitflags! {
    /// Contents of the config register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HatConfig: u8 {
        const SERVO1 = 1 << 0;
        const SERVO2 = 1 << 1;
        const LIGHTS = 1 << 2;
        const LIGHT_MODE = 1 << 3;
        const LIGHT_ON = 1 << 4;
    }
}

/// Pulse width range of one servo, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServoRange {
    pub min_us: u16,
    pub max_us: u16,
}

impl Default for ServoRange {
    fn default() -> Self {
        Self {
            min_us: 575,
            max_us: 2325,
        }
    }
}

impl ServoRange {
    /// Pulse width for `angle` degrees; -90 maps to `min_us`, 90 to `max_us`
    pub fn degrees_to_us(&self, angle: f64) -> u16 {
        let span = self.max_us.saturating_sub(self.min_us) as f64;
        let offset = clamp_angle(angle) - MIN_ANGLE;
        self.min_us + (span / (MAX_ANGLE - MIN_ANGLE) * offset).round() as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PanTiltHatConfig {
    pub address: u16,
    pub pan: ServoRange,
    pub tilt: ServoRange,
}

impl Default for PanTiltHatConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            pan: ServoRange::default(),
            tilt: ServoRange::default(),
        }
    }
}

/// Bytes that enable (or disable) both servo outputs
pub fn config_write(config: HatConfig) -> [u8; 2] {
    [REG_CONFIG, config.bits()]
}

/// Bytes that set one servo register to `us`
pub fn servo_write(register: u8, us: u16) -> [u8; 3] {
    let [lo, hi] = us.to_le_bytes();
    [register, lo, hi]
}

/// The two writes that move the platform to `target`
pub fn position_writes(config: &PanTiltHatConfig, target: Position) -> [[u8; 3]; 2] {
    [
        servo_write(REG_SERVO1, config.pan.degrees_to_us(target.pan())),
        servo_write(REG_SERVO2, config.tilt.degrees_to_us(target.tilt())),
    ]
}

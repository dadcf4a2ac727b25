//! PCA9685 16-channel PWM controller, as found on the Waveshare Stepper
//! Motor HAT (B). The stepper driver only uses channels fully on or fully
//! off.

use std::time::Duration;

use super::RegisterWrite;

pub const DEFAULT_ADDRESS: u16 = 0x40;

pub const MODE1: u8 = 0x00;
pub const PRESCALE: u8 = 0xFE;
pub const LED0_ON_L: u8 = 0x06;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
const MODE1_SLEEP: u8 = 0x10;
const MODE1_AUTO_INCREMENT: u8 = 0xA1;
const FULL_SCALE: u16 = 4095;

/// One step of the chip bring-up sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    Write(RegisterWrite),
    Delay(Duration),
}

/// Prescaler for the requested PWM frequency (clamped to 40..=1500 Hz)
pub fn prescale(freq_hz: u32) -> u8 {
    let freq = freq_hz.clamp(40, 1500) as f64;
    ((OSCILLATOR_HZ / (4096.0 * freq)).round() - 1.0) as u8
}

/// Sleep, program the prescaler, wake, enable auto-increment
pub fn init_sequence(freq_hz: u32) -> [InitStep; 5] {
    [
        InitStep::Write((MODE1, MODE1_SLEEP)),
        InitStep::Write((PRESCALE, prescale(freq_hz))),
        InitStep::Write((MODE1, 0x00)),
        InitStep::Delay(Duration::from_millis(5)),
        InitStep::Write((MODE1, MODE1_AUTO_INCREMENT)),
    ]
}

/// Register writes for an on/off pair on `channel`
pub fn set_pwm(channel: u8, on: u16, off: u16) -> [RegisterWrite; 4] {
    let base = LED0_ON_L + 4 * channel;
    [
        (base, (on & 0xFF) as u8),
        (base + 1, ((on >> 8) & 0x0F) as u8),
        (base + 2, (off & 0xFF) as u8),
        (base + 3, ((off >> 8) & 0x0F) as u8),
    ]
}

/// Drive `channel` fully on or fully off
pub fn set_pin(channel: u8, on: bool) -> [RegisterWrite; 4] {
    set_pwm(channel, 0, if on { FULL_SCALE } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prescale() {
        // 25 MHz / (4096 * 1000) = 6.1 -> 6 - 1
        assert_eq!(prescale(1000), 5);
        assert_eq!(prescale(50), 121);
        // Clamped
        assert_eq!(prescale(10), prescale(40));
        assert_eq!(prescale(100_000), prescale(1500));
    }

    #[test]
    fn test_set_pwm_registers() {
        assert_eq!(
            set_pwm(1, 0, 4095),
            [(0x0A, 0x00), (0x0B, 0x00), (0x0C, 0xFF), (0x0D, 0x0F)]
        );
        assert_eq!(set_pin(0, false), [(0x06, 0), (0x07, 0), (0x08, 0), (0x09, 0)]);
    }

    #[test]
    fn test_init_sequence() {
        let steps = init_sequence(1000);
        assert_eq!(steps[0], InitStep::Write((MODE1, 0x10)));
        assert_eq!(steps[1], InitStep::Write((PRESCALE, 5)));
        assert!(matches!(steps[3], InitStep::Delay(_)));
    }
}

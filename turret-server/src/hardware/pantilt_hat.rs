//! Pimoroni Pan-Tilt HAT driver

use turret_core::protocol::pantilt_hat::{
    config_write, position_writes, HatConfig, PanTiltHatConfig,
};
use turret_core::{Actuator, ActuatorError, Position};

use super::i2c::RegisterBus;

pub struct PanTiltHat<B: RegisterBus> {
    bus: B,
    config: PanTiltHatConfig,
    enabled: bool,
}

impl<B: RegisterBus> PanTiltHat<B> {
    pub fn new(bus: B, config: PanTiltHatConfig) -> Self {
        Self {
            bus,
            config,
            enabled: false,
        }
    }

    fn enable(&mut self) -> Result<(), ActuatorError> {
        if !self.enabled {
            self.bus
                .write(&config_write(HatConfig::SERVO1 | HatConfig::SERVO2))?;
            self.enabled = true;
            log::debug!("Pan-Tilt HAT servos enabled");
        }
        Ok(())
    }
}

impl<B: RegisterBus> Actuator for PanTiltHat<B> {
    fn name(&self) -> &str {
        "pantilt-hat"
    }

    fn move_to(&mut self, target: Position) -> Result<(), ActuatorError> {
        self.enable()?;
        for write in position_writes(&self.config, target) {
            if let Err(e) = self.bus.write(&write) {
                // Re-send the config register next time, the HAT may have reset
                self.enabled = false;
                return Err(e);
            }
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        self.bus.write(&config_write(HatConfig::empty()))?;
        self.enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::i2c::RecordingBus;

    #[test]
    fn test_enable_then_servo_writes() {
        let bus = RecordingBus::default();
        let mut hat = PanTiltHat::new(bus.clone(), PanTiltHatConfig::default());
        hat.move_to(Position::CENTER).unwrap();
        hat.move_to(Position::new(-90.0, 90.0).unwrap()).unwrap();

        let writes = bus.take();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0], vec![0x00, 0x03]);
        // 1450 us on both servos
        assert_eq!(writes[1], vec![0x01, 0xAA, 0x05]);
        assert_eq!(writes[2], vec![0x03, 0xAA, 0x05]);
        // 575 = 0x023F, 2325 = 0x0915
        assert_eq!(writes[3], vec![0x01, 0x3F, 0x02]);
        assert_eq!(writes[4], vec![0x03, 0x15, 0x09]);
    }

    #[test]
    fn test_release_disables_outputs() {
        let bus = RecordingBus::default();
        let mut hat = PanTiltHat::new(bus.clone(), PanTiltHatConfig::default());
        hat.move_to(Position::CENTER).unwrap();
        bus.take();
        hat.release().unwrap();
        assert_eq!(bus.take(), vec![vec![0x00, 0x00]]);
        // Enabled again on the next move
        hat.move_to(Position::CENTER).unwrap();
        assert_eq!(bus.take()[0], vec![0x00, 0x03]);
    }
}

//! Actuator drivers doing real bus I/O

pub mod i2c;
pub mod pantilt_hat;
pub mod stepper_hat;

use turret_core::protocol::{pantilt_hat::PanTiltHatConfig, stepper::StepperHatConfig};
use turret_core::{Actuator, ActuatorError, SimulatedActuator};

use crate::Driver;
use i2c::I2cDevice;
use pantilt_hat::PanTiltHat;
use stepper_hat::StepperHat;

/// Open the configured driver
pub fn open_actuator(
    driver: Driver,
    bus: u8,
    pantilt: &PanTiltHatConfig,
    stepper: &StepperHatConfig,
) -> Result<Box<dyn Actuator>, ActuatorError> {
    let actuator: Box<dyn Actuator> = match driver {
        Driver::Simulated => Box::new(SimulatedActuator::new()),
        Driver::PantiltHat => {
            let device = I2cDevice::open(bus, pantilt.address)?;
            Box::new(PanTiltHat::new(device, *pantilt))
        }
        Driver::StepperHat => {
            let device = I2cDevice::open(bus, stepper.address)?;
            Box::new(StepperHat::new(device, *stepper)?)
        }
    };
    log::info!("Using actuator driver '{}'", actuator.name());
    Ok(actuator)
}

//! Register-level formatting for the supported actuator boards.
//!
//! Nothing here touches a bus. Each function returns the bytes to write; the
//! server hands them to an I2C device.

pub mod pantilt_hat;
pub mod pca9685;
pub mod stepper;

/// A single register write: `(register, value)`
pub type RegisterWrite = (u8, u8);

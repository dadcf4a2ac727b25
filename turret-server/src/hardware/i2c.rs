//! Linux `i2c-dev` access.
//!
//! A bus is opened as `/dev/i2c-N`; the `I2C_SLAVE` ioctl binds the file
//! descriptor to one device address, after which plain writes go to that
//! device.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use turret_core::ActuatorError;

/// Something register writes can be sent to
pub trait RegisterBus: Send {
    /// One bus transaction: register address followed by data bytes
    fn write(&mut self, bytes: &[u8]) -> Result<(), ActuatorError>;
}

#[cfg(target_os = "linux")]
mod ioctl {
    const I2C_SLAVE: u16 = 0x0703;
    nix::ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);
}

pub struct I2cDevice {
    file: File,
    path: PathBuf,
    address: u16,
}

impl std::fmt::Debug for I2cDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I2cDevice({} @ {:#04x})", self.path.display(), self.address)
    }
}

impl I2cDevice {
    /// Open `/dev/i2c-{bus}` and select `address`
    #[cfg(target_os = "linux")]
    pub fn open(bus: u8, address: u16) -> Result<Self, ActuatorError> {
        use std::fs::OpenOptions;
        use std::os::fd::AsRawFd;

        let path = PathBuf::from(format!("/dev/i2c-{}", bus));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| bus_error(&path, address, e.to_string()))?;

        // SAFETY: the descriptor is valid for the lifetime of `file` and
        // I2C_SLAVE takes the address by value.
        unsafe { ioctl::i2c_set_slave(file.as_raw_fd(), address as i32) }
            .map_err(|e| bus_error(&path, address, format!("I2C_SLAVE: {}", e)))?;

        log::debug!("Opened {} for device {:#04x}", path.display(), address);
        Ok(I2cDevice {
            file,
            path,
            address,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(bus: u8, address: u16) -> Result<Self, ActuatorError> {
        Err(ActuatorError::NotReady(format!(
            "i2c-{} device {:#04x}: i2c-dev is only available on Linux",
            bus, address
        )))
    }

    pub fn address(&self) -> u16 {
        self.address
    }
}

impl RegisterBus for I2cDevice {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ActuatorError> {
        self.file
            .write_all(bytes)
            .map_err(|e| bus_error(&self.path, self.address, e.to_string()))
    }
}

fn bus_error(path: &std::path::Path, address: u16, message: String) -> ActuatorError {
    ActuatorError::Bus {
        device: format!("{}@{:#04x}", path.display(), address),
        message,
    }
}

/// Keeps every transaction; shared between clones
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    pub writes: std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
}

#[cfg(test)]
impl RecordingBus {
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

#[cfg(test)]
impl RegisterBus for RecordingBus {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ActuatorError> {
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
}

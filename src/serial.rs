use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::{config::DeviceConfig, error::Error};

/// Opening the device, with retries.
pub(crate) mod serial_port;

pub use serial_port::open_with_retry;

/// How long a single read or write on the device may take.
/// Readiness is always awaited first, so this only matters when the
/// device's output buffer is full.
pub const DEVICE_IO_TIMEOUT: Duration = Duration::from_millis(100);

/// A duplex byte stream to the physical device.
///
/// The raw file descriptor is used to wait for readiness.
pub trait Device: Read + Write + AsRawFd + Send {}

impl<T: Read + Write + AsRawFd + Send> Device for T {}

/// Something which knows how to (re)open the physical device.
pub trait DeviceOpener: Send {
    /// Human readable name of the device, for logs.
    fn name(&self) -> String;

    /// Try once to open the device.
    fn open(&mut self) -> Result<Box<dyn Device>, Error>;
}

/// Opens a real serial port.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
    baud: u32,
    flow_control: serialport::FlowControl,
}

impl SerialOpener {
    /// An opener for the given device, 8N1 without flow control.
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            path: config.path.clone(),
            baud: config.baud,
            flow_control: serialport::FlowControl::None,
        }
    }
}

impl DeviceOpener for SerialOpener {
    fn name(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud)
    }

    fn open(&mut self) -> Result<Box<dyn Device>, Error> {
        let port = serialport::new(&self.path, self.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(self.flow_control)
            .timeout(DEVICE_IO_TIMEOUT)
            .open_native()
            .map_err(|source| Error::DeviceOpen {
                path: self.path.clone(),
                source,
            })?;

        Ok(Box::new(port))
    }
}

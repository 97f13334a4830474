#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// A virtual serial port, i.e. a published pseudo-terminal.
/// Created, destroyed and rebuilt on behalf of the scheduler.
pub mod endpoint;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// The loop tying the device and the virtual ports together.
pub mod scheduler;

/// The physical serial device.
/// Opened with retries, and reopened when it fails.
pub mod serial;

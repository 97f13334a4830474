use std::{io, path::PathBuf};

use nix::errno::Errno;
use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is not usable.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// The configuration file could not be read.
    #[error("Could not read configuration file {path:?}, problem: {source}")]
    ConfigRead {
        /// The file we tried to read.
        path: PathBuf,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid RON.
    #[error("Could not parse configuration: {0}")]
    ConfigParse(#[from] ron::error::SpannedError),

    /// The physical device could not be opened.
    #[error("Could not open device at {path}, problem: {source}")]
    DeviceOpen {
        /// Path to the device.
        path: String,

        /// What the serial port driver said.
        #[source]
        source: serialport::Error,
    },

    /// Reading from or writing to the physical device failed.
    #[error("Device I/O failed: {0}")]
    DeviceIo(#[source] io::Error),

    /// The physical device signalled a hangup.
    #[error("Device disconnected")]
    DeviceDisconnected,

    /// Allocating or configuring a pseudo-terminal failed.
    #[error("Pseudo-terminal problem while trying to {action}: {source}")]
    Pty {
        /// What we were doing.
        action: &'static str,

        /// The OS error.
        #[source]
        source: Errno,
    },

    /// Something which is not an alias occupies a path we want to publish at.
    #[error("{0:?} exists and is not a symbolic link, refusing to replace it")]
    PathOccupied(PathBuf),

    /// Publishing an endpoint at its path failed.
    #[error("Could not publish endpoint at {path:?}, problem: {source}")]
    Publish {
        /// The publication path.
        path: PathBuf,

        /// The underlying problem.
        #[source]
        source: io::Error,
    },

    /// Waiting for readiness failed in a way we cannot recover from.
    #[error("Readiness wait failed: {0}")]
    Wait(#[source] Errno),

    /// Shutdown was requested while blocked.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Get the message of a bad config error, if that is what this is.
    pub fn try_into_bad_config(self) -> Option<String> {
        match self {
            Error::BadConfig(message) => Some(message),
            _ => None,
        }
    }

    /// Whether this error only means shutdown was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn pty(action: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Error::Pty { action, source }
    }
}

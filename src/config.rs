use std::{path::Path, path::PathBuf, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The physical serial device which is shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// The path to the device.
    /// Likely something under "/dev/serial/by-id/" so it survives re-plugging.
    pub path: String,

    /// The baud rate to open the device with.
    pub baud: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/serial/by-id/usb-Seeed_Studio_XIAO_nRF52840_C8A73AB0B3AB137D-if00".into(),
            baud: 115_200,
        }
    }
}

/// How long the multiplexer waits for various things.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Upper bound on a single readiness wait.
    /// Housekeeping runs at least this often.
    pub poll_timeout: Duration,

    /// Pause between attempts at opening the device.
    pub reconnect_interval: Duration,

    /// How often throughput counters are logged.
    pub stats_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(2),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// The configuration used for running the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The device to share.
    pub device: DeviceConfig,

    /// Where to publish the virtual ports.
    /// Each path becomes an alias of a pseudo-terminal.
    pub virtual_ports: Vec<PathBuf>,

    /// Timeouts and intervals.
    #[serde(default)]
    pub timing: Timing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            virtual_ports: vec![
                "/dev/ttyV0".into(),
                "/dev/ttyV1".into(),
                "/dev/ttyV2".into(),
            ],
            timing: Timing::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Ok(Self::ron().from_str::<Config>(input)?)
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            device: DeviceConfig {
                path: "/dev/ttyACM0".into(),
                baud: 115_200,
            },
            virtual_ports: vec!["/tmp/ttyV0".into(), "/tmp/ttyV1".into()],
            timing: Timing::default(),
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        // Plain data with string keys, cannot fail.
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_default()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        Self::deserialize(&s)
    }

    fn check_virtual_ports_present(&self) -> Result<(), Error> {
        if self.virtual_ports.is_empty() {
            Err(Error::BadConfig(
                "No virtual ports configured, nothing would be able to reach the device.".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn check_duplicates(&self) -> Result<(), Error> {
        let duplicates = self.virtual_ports.iter().duplicates().collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Each virtual port needs its own path. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_device_not_shadowed(&self) -> Result<(), Error> {
        let device = Path::new(&self.device.path);

        match self.virtual_ports.iter().find(|path| *path == device) {
            Some(path) => Err(Error::BadConfig(format!(
                "The virtual port {path:?} would replace the device it is supposed to share."
            ))),
            None => Ok(()),
        }
    }

    fn check_values(&self) -> Result<(), Error> {
        if self.device.baud == 0 {
            return Err(Error::BadConfig("The baud rate must be non-zero.".into()));
        }

        if self.timing.poll_timeout.is_zero() {
            return Err(Error::BadConfig(
                "The poll timeout must be non-zero, or the loop would spin.".into(),
            ));
        }

        Ok(())
    }

    /// Check that the configuration can be run.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_virtual_ports_present()?;
        self.check_duplicates()?;
        self.check_device_not_shadowed()?;
        self.check_values()?;

        Ok(())
    }
}

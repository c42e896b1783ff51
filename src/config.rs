use std::path::Path;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{error::Error, options::PortOptions};

fn default_source() -> String {
    "config".into()
}

fn default_queue_capacity() -> usize {
    256
}

/// A device configuration as persisted.
///
/// Owned by the configuration store; the core only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// The configuration's id.
    pub id: i64,

    /// Human-readable name, used in reload messages.
    pub name: String,

    /// The endpoint path.
    /// Likely "/dev/ttyUSB0" or "COMx"; `mock:<name>` and `disabled`
    /// select the non-hardware connection variants.
    pub path: String,

    /// Where the configuration came from.
    #[serde(default = "default_source")]
    pub source: String,

    /// Whether this configuration should be applied.
    pub enabled: bool,

    /// The serial line options.
    pub options: PortOptions,
}

/// The configuration used for running the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The persisted device configurations. Reload applies the first
    /// enabled entry.
    pub devices: Vec<DeviceConfig>,

    /// Capacity of each event subscriber's queue.
    #[serde(default = "default_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    /// Command lines sent to a freshly opened device by its handshake.
    #[serde(default)]
    pub init_commands: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: vec![],
            subscriber_queue_capacity: default_queue_capacity(),
            init_commands: vec![],
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
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::Store(format!("bad configuration contents: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            devices: vec![
                DeviceConfig {
                    id: 1,
                    name: "front gate radar".into(),
                    path: "/dev/ttyUSB0".into(),
                    source: default_source(),
                    enabled: true,
                    options: PortOptions {
                        baud_rate: 19200,
                        data_bits: 8,
                        stop_bits: 1,
                        parity: "none".into(),
                    },
                },
                DeviceConfig {
                    id: 2,
                    name: "bench loopback".into(),
                    path: "mock:bench".into(),
                    source: default_source(),
                    enabled: false,
                    options: PortOptions {
                        baud_rate: 115_200,
                        data_bits: 8,
                        stop_bits: 1,
                        parity: "none".into(),
                    },
                },
            ],
            subscriber_queue_capacity: 256,
            init_commands: vec!["UN KMH".into(), "TM ON".into()],
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .expect("config serialization should work")
    }

    /// Setup a configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let s = std::fs::read_to_string(&p).map_err(|e| {
            Error::Store(format!(
                "could not read configuration at {}: {e}",
                p.as_ref().display()
            ))
        })?;

        Self::deserialize(&s)
    }

    fn check_duplicate_enabled_paths(&self) -> Result<(), Error> {
        let duplicates = self
            .devices
            .iter()
            .filter(|device| device.enabled)
            .map(|device| &device.path)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "a port can only be opened once; these paths are enabled more than once: {duplicates:?}"
            )))
        }
    }

    fn check_names_nonempty(&self) -> Result<(), Error> {
        for (index, device) in self.devices.iter().enumerate() {
            if device.name.trim().is_empty() {
                return Err(Error::BadConfig(format!(
                    "the device with index {index} (zero indexed) has an empty name"
                )));
            }
        }

        Ok(())
    }

    /// Check invariants a configuration file must uphold.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_names_nonempty()?;
        self.check_duplicate_enabled_paths()?;

        Ok(())
    }
}

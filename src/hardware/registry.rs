//! Device Registry
//!
//! Resolves the opaque device connection string handed over by the configuration layer into
//! a boxed [`SampleDevice`]. Arguments use the familiar `key=value,key=value` form, with
//! `driver=` selecting the implementation:
//!
//! | Driver | Directions | Arguments |
//! |--------|------------|-----------|
//! | `mock` | rx | `waveform=tone\|ramp`, `tone_hz`, `amplitude`, `noise`, `seed`, `paced`, `samples`, `overrun_every`, `short_read_every` |
//! | `file` | rx, tx | `path` |
//! | `null` | tx | - |
//!
//! Real radio drivers plug in by implementing [`SampleDevice`]; nothing in the pipeline names
//! a concrete type.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::capabilities::{Direction, SampleDevice};
use crate::hardware::file::FileDevice;
use crate::hardware::mock::{MockSource, MockSourceConfig, NullSink, Waveform};

/// Parsed `key=value` device arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceArgs {
    values: BTreeMap<String, String>,
}

impl DeviceArgs {
    /// Parse `driver=mock,seed=3`. Whitespace around keys and values is ignored.
    pub fn parse(args: &str) -> DeviceResult<Self> {
        let mut values = BTreeMap::new();
        for part in args.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| DeviceError::InvalidConfig {
                message: format!("Device argument '{part}' is not key=value"),
            })?;
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> DeviceResult<Option<T>> {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|_| DeviceError::InvalidConfig {
                    message: format!("Invalid value '{raw}' for device argument '{key}'"),
                })
            })
            .transpose()
    }
}

/// Supported driver types.
#[derive(Debug, Clone)]
pub enum DriverSpec {
    /// Synthetic capture source
    Mock(MockSourceConfig),
    /// Raw `sc16` file
    File {
        /// File path
        path: PathBuf,
    },
    /// Discarding transmit sink
    Null,
}

impl DriverSpec {
    /// Build a driver spec from parsed arguments.
    pub fn from_args(args: &DeviceArgs, raw: &str) -> DeviceResult<Self> {
        match args.get("driver") {
            Some("mock") => {
                let defaults = MockSourceConfig::default();
                let waveform = match args.get("waveform") {
                    None | Some("tone") => Waveform::Tone,
                    Some("ramp") => Waveform::Ramp,
                    Some(other) => {
                        return Err(DeviceError::InvalidConfig {
                            message: format!("Unknown mock waveform '{other}'"),
                        })
                    }
                };
                Ok(Self::Mock(MockSourceConfig {
                    waveform,
                    tone_offset_hz: args.parsed("tone_hz")?.unwrap_or(defaults.tone_offset_hz),
                    amplitude: args.parsed("amplitude")?.unwrap_or(defaults.amplitude),
                    noise: args.parsed("noise")?.unwrap_or(defaults.noise),
                    seed: args.parsed("seed")?.unwrap_or(defaults.seed),
                    paced: args.parsed("paced")?.unwrap_or(true),
                    total_samples: args.parsed("samples")?,
                    overrun_every: args.parsed("overrun_every")?,
                    fail_after_reads: None,
                    short_read_every: args.parsed("short_read_every")?,
                }))
            }
            Some("file") => {
                let path = args.get("path").ok_or_else(|| DeviceError::InvalidConfig {
                    message: "file driver requires path=".to_string(),
                })?;
                Ok(Self::File {
                    path: PathBuf::from(path),
                })
            }
            Some("null") => Ok(Self::Null),
            _ => Err(DeviceError::NotFound {
                args: raw.to_string(),
            }),
        }
    }

    /// Driver name as used in `driver=`.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Mock(_) => "mock",
            Self::File { .. } => "file",
            Self::Null => "null",
        }
    }

    /// Directions this driver can stream in.
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            Self::Mock(_) => &[Direction::Rx],
            Self::File { .. } => &[Direction::Rx, Direction::Tx],
            Self::Null => &[Direction::Tx],
        }
    }

    /// Instantiate the device.
    pub fn open(self) -> Box<dyn SampleDevice> {
        match self {
            Self::Mock(config) => Box::new(MockSource::new(config)),
            Self::File { path } => Box::new(FileDevice::new(path)),
            Self::Null => Box::new(NullSink::new()),
        }
    }
}

/// Information about an available driver, for listing.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    /// Name used in `driver=`
    pub name: &'static str,
    /// Supported directions
    pub directions: &'static [Direction],
    /// One-line description
    pub description: &'static str,
    /// Example connection string
    pub example: &'static str,
}

/// Drivers built into this crate.
pub fn list_drivers() -> Vec<DriverInfo> {
    vec![
        DriverInfo {
            name: "mock",
            directions: &[Direction::Rx],
            description: "Synthetic tone/ramp source paced at the sample rate",
            example: "driver=mock,waveform=tone,tone_hz=100e3,seed=1",
        },
        DriverInfo {
            name: "file",
            directions: &[Direction::Rx, Direction::Tx],
            description: "Raw interleaved little-endian sc16 file",
            example: "driver=file,path=capture.cs16",
        },
        DriverInfo {
            name: "null",
            directions: &[Direction::Tx],
            description: "Discards transmitted samples",
            example: "driver=null",
        },
    ]
}

/// Open a device for `direction` from an opaque connection string.
pub fn open_device(args: &str, direction: Direction) -> DeviceResult<Box<dyn SampleDevice>> {
    let parsed = DeviceArgs::parse(args)?;
    let spec = DriverSpec::from_args(&parsed, args)?;
    if !spec.directions().contains(&direction) {
        return Err(DeviceError::NotSupported {
            message: format!(
                "driver '{}' cannot stream {:?}",
                spec.driver_name(),
                direction
            ),
        });
    }
    Ok(spec.open())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = DeviceArgs::parse(" driver=mock , seed = 42,paced=false").unwrap();
        assert_eq!(args.get("driver"), Some("mock"));
        assert_eq!(args.get("seed"), Some("42"));
        assert!(DeviceArgs::parse("driver").is_err());
        assert_eq!(DeviceArgs::parse("").unwrap(), DeviceArgs::default());
    }

    #[test]
    fn test_mock_spec_values() {
        let raw = "driver=mock,waveform=ramp,samples=1000,paced=false";
        let spec = DriverSpec::from_args(&DeviceArgs::parse(raw).unwrap(), raw).unwrap();
        match spec {
            DriverSpec::Mock(config) => {
                assert_eq!(config.waveform, Waveform::Ramp);
                assert_eq!(config.total_samples, Some(1000));
                assert!(!config.paced);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_unknown_driver_not_found() {
        assert!(matches!(
            open_device("driver=usrp,serial=1234", Direction::Rx),
            Err(DeviceError::NotFound { .. })
        ));
        assert!(matches!(
            open_device("driver=mock,seed=abc", Direction::Rx),
            Err(DeviceError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_direction_checked() {
        assert!(open_device("driver=null", Direction::Tx).is_ok());
        assert!(matches!(
            open_device("driver=null", Direction::Rx),
            Err(DeviceError::NotSupported { .. })
        ));
        assert!(open_device("driver=file,path=/tmp/x", Direction::Tx).is_ok());
    }

    #[test]
    fn test_listed_drivers_parse() {
        for info in list_drivers() {
            let parsed = DeviceArgs::parse(info.example).unwrap();
            let spec = DriverSpec::from_args(&parsed, info.example).unwrap();
            assert_eq!(spec.driver_name(), info.name);
            assert_eq!(spec.directions(), info.directions);
        }
    }
}

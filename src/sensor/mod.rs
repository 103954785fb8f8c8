use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::config::{Config, SensorConfig};

mod ds18b20;
mod hostinfo;
mod htu21d;
mod kvmd;
mod system;

pub use self::ds18b20::Ds18b20;
pub use self::hostinfo::HostInfo;
pub use self::htu21d::Htu21d;
pub use self::kvmd::Kvmd;
pub use self::system::SysInfo;

#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum MeasurementError {
    #[snafu(display("Unable to read measurement data from sensor: {cause}"))]
    Unavailable { cause: String },

    #[snafu(display("Unknown property '{property}'"))]
    UnknownProperty { property: String },
}

impl MeasurementError {
    pub fn unavailable(cause: impl fmt::Display) -> Self {
        Self::Unavailable { cause: cause.to_string() }
    }
}

/// Raw value produced by a sensor property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
        }
    }
}

pub trait Capability {
    fn read(&mut self, property: &str) -> Result<Value, MeasurementError>;
    fn serial_number(&self) -> String;
    fn model(&self) -> String;
    fn manufacturer(&self) -> String;
}

/// Static identity of a capability, captured once after construction
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub serial_number: String,
    pub model: String,
    pub manufacturer: String,
}

impl Identity {
    pub fn of(capability: &dyn Capability) -> Self {
        Self {
            serial_number: capability.serial_number(),
            model: capability.model(),
            manufacturer: capability.manufacturer(),
        }
    }
}

/// Supported sensor drivers, selected by the `device_type` key
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum SensorKind {
    #[serde(rename = "ds18b20")]
    Ds18b20,
    #[serde(rename = "sysinfo")]
    SysInfo,
    #[serde(rename = "kvmd")]
    Kvmd,
    #[serde(rename = "hostinfo")]
    HostInfo,
    #[serde(rename = "htu21d")]
    Htu21d,
}

impl SensorKind {
    pub fn properties(&self) -> &'static [&'static str] {
        match self {
            SensorKind::Ds18b20 => Ds18b20::PROPERTIES,
            SensorKind::SysInfo => SysInfo::PROPERTIES,
            SensorKind::Kvmd => Kvmd::PROPERTIES,
            SensorKind::HostInfo => HostInfo::PROPERTIES,
            SensorKind::Htu21d => Htu21d::PROPERTIES,
        }
    }

    pub fn supports(&self, property: &str) -> bool {
        self.properties().contains(&property)
    }

    pub fn build(
        &self,
        addr: Option<&str>,
        config: &Config,
    ) -> Result<Box<dyn Capability + Send>, MeasurementError> {
        let capability: Box<dyn Capability + Send> = match self {
            SensorKind::Ds18b20 => Box::new(Ds18b20::new(addr)?),
            SensorKind::SysInfo => Box::new(SysInfo::new()),
            SensorKind::Kvmd => Box::new(Kvmd::new(config)?),
            SensorKind::HostInfo => Box::new(HostInfo::new(config)?),
            SensorKind::Htu21d => Box::new(Htu21d::new(addr, config)?),
        };
        Ok(capability)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorKind::Ds18b20 => "ds18b20",
            SensorKind::SysInfo => "sysinfo",
            SensorKind::Kvmd => "kvmd",
            SensorKind::HostInfo => "hostinfo",
            SensorKind::Htu21d => "htu21d",
        };
        f.write_str(name)
    }
}

/// A configured sensor together with its initialized driver
pub struct Sensor {
    pub config: SensorConfig,
    pub identity: Identity,
    capability: Box<dyn Capability + Send>,
}

impl Sensor {
    pub fn new(config: SensorConfig, capability: Box<dyn Capability + Send>) -> Self {
        let identity = Identity::of(capability.as_ref());
        Self {
            config,
            identity,
            capability,
        }
    }

    pub fn init(config: SensorConfig, global: &Config) -> Result<Self, MeasurementError> {
        log::info!("Initialising sensor {} (type: {})", config.name, config.device_type);
        let capability = config
            .device_type
            .build(config.device_address.as_deref(), global)?;
        Ok(Self::new(config, capability))
    }

    pub fn read(&mut self) -> Result<Value, MeasurementError> {
        self.capability.read(&self.config.device_property)
    }
}

/// Shared helpers for reading single-line text files exposed by the kernel
pub(crate) mod sysfs {
    use std::fs;
    use std::path::Path;

    pub const DEVICE_TREE: &str = "/sys/firmware/devicetree/base";

    /// First line of a file with trailing NULs and whitespace removed
    pub fn read_line(path: &Path) -> Option<String> {
        let content = fs::read_to_string(path).ok()?;
        let line = content.lines().next().unwrap_or("");
        Some(line.trim_end_matches('\0').trim().to_string())
    }

    pub fn serial_number() -> String {
        read_line(&Path::new(DEVICE_TREE).join("serial-number"))
            .unwrap_or_else(|| "ERROR000000000".to_string())
    }

    pub fn board_model() -> String {
        read_line(&Path::new(DEVICE_TREE).join("model"))
            .unwrap_or_else(|| "Error (unknown model)".to_string())
    }

    /// `Hardware` and `Revision` fields of /proc/cpuinfo
    pub fn parse_cpuinfo(cpuinfo: &str) -> (Option<String>, Option<String>) {
        let mut hardware = None;
        let mut revision = None;
        for line in cpuinfo.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key.trim() {
                    "Hardware" => hardware = Some(value.trim().to_string()),
                    "Revision" => revision = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }
        (hardware, revision)
    }

    pub fn cpuinfo() -> (String, String) {
        match fs::read_to_string("/proc/cpuinfo") {
            Ok(content) => {
                let (hardware, revision) = parse_cpuinfo(&content);
                (
                    hardware.unwrap_or_else(|| "Unknown".to_string()),
                    revision.unwrap_or_else(|| "000000".to_string()),
                )
            }
            Err(_) => (
                "Error (unknown hardware)".to_string(),
                "ERROR000000".to_string(),
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::VecDeque;

    use super::{Capability, MeasurementError, Value};

    /// Capability returning scripted results, repeating the last one
    pub struct FakeCapability {
        results: VecDeque<Result<Value, MeasurementError>>,
    }

    impl FakeCapability {
        pub fn new(results: Vec<Result<Value, MeasurementError>>) -> Self {
            Self {
                results: results.into(),
            }
        }

        pub fn value(value: Value) -> Self {
            Self::new(vec![Ok(value)])
        }

        pub fn failing(cause: &str) -> Self {
            Self::new(vec![Err(MeasurementError::unavailable(cause))])
        }
    }

    impl Capability for FakeCapability {
        fn read(&mut self, _property: &str) -> Result<Value, MeasurementError> {
            if self.results.len() > 1 {
                self.results.pop_front().unwrap()
            } else {
                self.results.front().cloned().unwrap()
            }
        }

        fn serial_number(&self) -> String {
            "000123".to_string()
        }

        fn model(&self) -> String {
            "FAKE01".to_string()
        }

        fn manufacturer(&self) -> String {
            "Acme".to_string()
        }
    }
}

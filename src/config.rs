use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::prelude::*;

use crate::sensor::SensorKind;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Cannot open {}: {source}", path.display()))]
    Open { path: PathBuf, source: std::io::Error },

    #[snafu(display("Error when parsing {}: {source}", path.display()))]
    Parse { path: PathBuf, source: serde_yaml::Error },

    #[snafu(display("Invalid configuration: {message}"))]
    Invalid { message: String },
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Seconds between two polling cycles
    #[serde(default = "default_update_period")]
    pub update_period: u64,
    /// Seconds after which Home Assistant marks a sensor state as expired
    #[serde(default = "default_valid_time")]
    pub valid_time: u64,
    #[serde(default)]
    pub verbose: bool,

    pub mqtt_broker: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_transport: MqttTransport,
    #[serde(default = "default_mqtt_ws_path")]
    pub mqtt_ws_path: String,
    #[serde(default)]
    pub mqtt_use_tls: bool,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    #[serde(default = "default_mqtt_ha_prefix")]
    pub mqtt_ha_prefix: String,

    #[serde(default = "default_pikvm_username")]
    pub pikvm_username: String,
    #[serde(default)]
    pub pikvm_password: Option<String>,
    #[serde(default = "default_kvmd_url")]
    pub kvmd_url: String,
    #[serde(default)]
    pub prometheus_url: Option<String>,
    /// I²C bus device the HTU21D sensors are attached to
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: String,

    /// Interface whose MAC and IPv6 addresses are advertised to Home Assistant
    #[serde(default = "default_network_interface")]
    pub network_interface: String,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub enum MqttTransport {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "websockets")]
    Websockets,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SensorConfig {
    pub name: String,
    pub id: String,
    pub device_type: SensorKind,
    #[serde(default)]
    pub device_address: Option<String>,
    pub device_property: String,
    #[serde(default)]
    pub device_offset: Option<f64>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub output_precision: Option<i32>,
    #[serde(default)]
    pub display_precision: Option<u32>,
    #[serde(default = "default_ha_component_type")]
    pub ha_component_type: String,
    #[serde(default)]
    pub ha_device_class: Option<String>,
    #[serde(default)]
    pub ha_entity_category: Option<String>,
    #[serde(default)]
    pub ha_icon: Option<String>,
    #[serde(default)]
    pub ha_title: Option<String>,
}

impl SensorConfig {
    pub fn title(&self) -> &str {
        self.ha_title.as_deref().unwrap_or(&self.name)
    }
}

impl Config {
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.mqtt_broker, self.mqtt_port)
    }

    /// Server URI in the form expected by the MQTT client
    pub fn server_uri(&self) -> String {
        let address = self.broker_address();
        match (self.mqtt_transport, self.mqtt_use_tls) {
            (MqttTransport::Tcp, false) => format!("tcp://{address}"),
            (MqttTransport::Tcp, true) => format!("ssl://{address}"),
            (MqttTransport::Websockets, false) => format!("ws://{address}{}", self.mqtt_ws_path),
            (MqttTransport::Websockets, true) => format!("wss://{address}{}", self.mqtt_ws_path),
        }
    }

    pub fn mqtt_credentials(&self) -> Option<(&str, &str)> {
        match (&self.mqtt_username, &self.mqtt_password) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        }
    }
}

fn default_update_period() -> u64 {
    30
}

fn default_valid_time() -> u64 {
    600
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_ws_path() -> String {
    "/mqtt".to_string()
}

fn default_mqtt_ha_prefix() -> String {
    "homeassistant".to_string()
}

fn default_pikvm_username() -> String {
    "admin".to_string()
}

fn default_kvmd_url() -> String {
    "http://localhost".to_string()
}

fn default_i2c_bus() -> String {
    "/dev/i2c-1".to_string()
}

fn default_network_interface() -> String {
    "eth0".to_string()
}

fn default_ha_component_type() -> String {
    "sensor".to_string()
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let file = File::open(path).context(OpenSnafu { path })?;
    parse_yaml(BufReader::new(file), path)
}

fn parse_yaml<T: for<'de> Deserialize<'de>, R: Read>(reader: R, path: &Path) -> Result<T, ConfigError> {
    serde_yaml::from_reader(reader).context(ParseSnafu { path })
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = read_yaml(path)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_sensors(path: &Path, config: &Config) -> Result<Vec<SensorConfig>, ConfigError> {
    let sensors: Vec<SensorConfig> = read_yaml(path)?;
    validate_sensors(&sensors, config)?;
    Ok(sensors)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    ensure!(
        config.update_period > 0,
        InvalidSnafu { message: "'update_period' must be greater than zero" }
    );
    ensure!(
        !config.mqtt_broker.is_empty(),
        InvalidSnafu { message: "'mqtt_broker' must not be empty" }
    );
    Ok(())
}

fn validate_sensors(sensors: &[SensorConfig], config: &Config) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for sensor in sensors {
        if !ids.insert(sensor.id.as_str()) {
            return InvalidSnafu { message: format!("duplicate sensor id '{}'", sensor.id) }.fail();
        }
        if !sensor.device_type.supports(&sensor.device_property) {
            return InvalidSnafu {
                message: format!(
                    "sensor '{}': {} has no '{}' property",
                    sensor.id, sensor.device_type, sensor.device_property,
                ),
            }
            .fail();
        }
        if sensor.device_type == SensorKind::HostInfo && config.prometheus_url.is_none() {
            return InvalidSnafu {
                message: format!("sensor '{}' requires 'prometheus_url'", sensor.id),
            }
            .fail();
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    serde_yaml::from_str("mqtt_broker: broker.local").unwrap()
}

#[cfg(test)]
pub(crate) fn test_sensor(id: &str) -> SensorConfig {
    serde_yaml::from_str(&format!(
        "name: {id}\nid: {id}\ndevice_type: sysinfo\ndevice_property: uptime\n"
    ))
    .unwrap()
}

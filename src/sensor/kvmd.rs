use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use super::sysfs;
use super::{Capability, MeasurementError, Value};
use crate::config::Config;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Deserialize, Debug)]
struct AtxResponse {
    result: AtxState,
}

#[derive(Deserialize, Debug)]
struct AtxState {
    leds: AtxLeds,
}

#[derive(Deserialize, Debug)]
struct AtxLeds {
    power: bool,
}

/// Power state of the host attached to a PiKVM, queried through the kvmd API
pub struct Kvmd {
    client: Client,
    atx_url: String,
    user: String,
    password: String,
}

impl Kvmd {
    pub const PROPERTIES: &'static [&'static str] = &["atx_power"];

    pub fn new(config: &Config) -> Result<Self, MeasurementError> {
        // kvmd serves a self-signed certificate by default
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(MeasurementError::unavailable)?;
        Ok(Self {
            client,
            atx_url: format!("{}/api/atx", config.kvmd_url.trim_end_matches('/')),
            user: config.pikvm_username.clone(),
            password: config.pikvm_password.clone().unwrap_or_default(),
        })
    }

    fn atx_power(&self) -> Result<Value, MeasurementError> {
        let body = self
            .client
            .get(&self.atx_url)
            .header("X-KVMD-User", &self.user)
            .header("X-KVMD-Passwd", &self.password)
            .send()
            .and_then(|resp| resp.error_for_status())
            .and_then(|resp| resp.text())
            .map_err(MeasurementError::unavailable)?;
        parse_atx_power(&body)
    }
}

fn parse_atx_power(body: &str) -> Result<Value, MeasurementError> {
    let resp: AtxResponse = serde_json::from_str(body).map_err(MeasurementError::unavailable)?;
    let state = if resp.result.leds.power { "ON" } else { "OFF" };
    Ok(Value::String(state.to_string()))
}

impl Capability for Kvmd {
    fn read(&mut self, property: &str) -> Result<Value, MeasurementError> {
        match property {
            "atx_power" => self.atx_power(),
            _ => Err(MeasurementError::UnknownProperty { property: property.to_string() }),
        }
    }

    fn serial_number(&self) -> String {
        sysfs::serial_number()
    }

    fn model(&self) -> String {
        "PiKVM".to_string()
    }

    fn manufacturer(&self) -> String {
        "pikvm.org".to_string()
    }
}

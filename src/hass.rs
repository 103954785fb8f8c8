use serde::Serialize;

pub const VALUE_TEMPLATE: &str = "{{ value_json.value }}";

pub fn state_topic(sensor_id: &str) -> String {
    format!("sensors/{sensor_id}/state")
}

pub fn status_topic(sensor_id: &str) -> String {
    format!("sensors/{sensor_id}/status")
}

pub fn attributes_topic(sensor_id: &str) -> String {
    format!("sensors/{sensor_id}/attributes")
}

pub fn config_topic(prefix: &str, component: &str, node_id: &str, object_id: &str) -> String {
    format!("{prefix}/{component}/{node_id}/{object_id}/config")
}

/// Entity registration read by Home Assistant MQTT discovery
#[derive(Serialize)]
pub struct Discovery<'a> {
    pub unique_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    pub json_attributes_topic: String,
    pub device: &'a Device,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    pub name: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_display_precision: Option<u32>,
    pub value_template: &'static str,
    pub force_update: bool,
    pub expire_after: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub connections: Vec<(String, String)>,
    pub manufacturer: String,
    pub model: String,
    pub hw_version: String,
    pub sw_version: String,
    pub name: String,
    pub configuration_url: String,
}

/// Static attributes of the sensor hardware behind an entity
#[derive(Serialize)]
pub struct Attributes<'a> {
    pub serial_number: &'a str,
    #[serde(rename = "type")]
    pub model: &'a str,
    pub manufacturer: &'a str,
}

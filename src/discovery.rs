use crate::config::{Config, SensorConfig};
use crate::hass::{self, Attributes, Device};
use crate::sensor::Identity;
use crate::session::{Publish, Qos, SessionHandle};

/// Registration and attributes messages of one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub name: String,
    pub config_topic: String,
    pub config_payload: String,
    pub attributes_topic: String,
    pub attributes_payload: String,
}

/// Home Assistant discovery messages for every configured sensor.
///
/// Payloads are rendered once at startup from the immutable device and sensor
/// descriptors, so every logical session republishes identical bytes.
#[derive(Debug, Clone)]
pub struct Discovery {
    announcements: Vec<Announcement>,
}

impl Discovery {
    pub fn new<'a>(
        config: &Config,
        device: &Device,
        node_id: &str,
        sensors: impl IntoIterator<Item = (&'a SensorConfig, &'a Identity)>,
    ) -> Result<Self, serde_json::Error> {
        let announcements = sensors
            .into_iter()
            .map(|(sensor, identity)| announce(config, device, node_id, sensor, identity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { announcements })
    }

    pub fn announcements(&self) -> &[Announcement] {
        &self.announcements
    }

    /// Publish all registrations, then all attributes. Returns the number of
    /// messages handed to the transport.
    ///
    /// Sends even while the handle is still closed to the poller, so a new
    /// session is announced before any state goes out.
    pub fn publish<P: Publish + Clone>(&self, handle: &SessionHandle<P>) -> usize {
        let mut sent = 0;
        for announcement in &self.announcements {
            log::info!("Registering sensor {} with Home Assistant", announcement.name);
            if handle.send(
                &announcement.config_topic,
                &announcement.config_payload,
                Qos::AtLeastOnce,
                true,
            ) {
                sent += 1;
            }
        }
        for announcement in &self.announcements {
            log::info!("Publishing attributes for sensor {}", announcement.name);
            if handle.send(
                &announcement.attributes_topic,
                &announcement.attributes_payload,
                Qos::AtLeastOnce,
                true,
            ) {
                sent += 1;
            }
        }
        sent
    }
}

fn announce(
    config: &Config,
    device: &Device,
    node_id: &str,
    sensor: &SensorConfig,
    identity: &Identity,
) -> Result<Announcement, serde_json::Error> {
    let registration = hass::Discovery {
        unique_id: sensor.id.clone(),
        state_topic: hass::state_topic(&sensor.id),
        availability_topic: hass::status_topic(&sensor.id),
        json_attributes_topic: hass::attributes_topic(&sensor.id),
        device,
        device_class: sensor.ha_device_class.clone(),
        icon: sensor.ha_icon.clone(),
        entity_category: sensor.ha_entity_category.clone(),
        unit_of_measurement: sensor.units.clone(),
        name: sensor.title().to_string(),
        object_id: sensor.id.clone(),
        suggested_display_precision: sensor.display_precision,
        value_template: hass::VALUE_TEMPLATE,
        force_update: true,
        expire_after: config.valid_time,
    };
    let attributes = Attributes {
        serial_number: &identity.serial_number,
        model: &identity.model,
        manufacturer: &identity.manufacturer,
    };
    Ok(Announcement {
        name: sensor.name.clone(),
        config_topic: hass::config_topic(
            &config.mqtt_ha_prefix,
            &sensor.ha_component_type,
            node_id,
            &sensor.name,
        ),
        config_payload: serde_json::to_string_pretty(&registration)?,
        attributes_topic: hass::attributes_topic(&sensor.id),
        attributes_payload: serde_json::to_string_pretty(&attributes)?,
    })
}

#[cfg(test)]
pub(crate) fn test_device() -> Device {
    Device {
        identifiers: vec!["pikvm".to_string(), "pikvm_abcdef".to_string()],
        connections: vec![("mac_address".to_string(), "dc:a6:32:01:02:03".to_string())],
        manufacturer: "pikvm.org".to_string(),
        model: "PiKVM (Raspberry Pi 4 Model B Rev 1.4)".to_string(),
        hw_version: "BCM2711 (rev c03114)".to_string(),
        sw_version: "sensors2mqtt v0.1.0".to_string(),
        name: "PiKVM - open-source DIY IP-KVM".to_string(),
        configuration_url: "https://pikvm.local".to_string(),
    }
}

#[cfg(test)]
pub(crate) fn test_discovery(ids: &[&str]) -> Discovery {
    let sensors: Vec<_> = ids.iter().map(|id| crate::config::test_sensor(id)).collect();
    let identity = Identity {
        serial_number: "000123".to_string(),
        model: "FAKE01".to_string(),
        manufacturer: "Acme".to_string(),
    };
    Discovery::new(
        &crate::config::test_config(),
        &test_device(),
        "pikvm_abcdef",
        sensors.iter().map(|sensor| (sensor, &identity)),
    )
    .unwrap()
}

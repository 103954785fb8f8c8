use std::time::{Duration, Instant};

use prometheus_parse::{Sample, Scrape, Value as Metric};
use reqwest::blocking::Client;

use super::{Capability, MeasurementError, Value};
use crate::config::Config;

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CACHE_EXPIRY_SECS: u64 = 5;

const FAN_METRIC: &str = "node_hwmon_fan_rpm";
const TEMP_METRIC: &str = "node_hwmon_temp_celsius";
const DMI_METRIC: &str = "node_dmi_info";

const SUPERIO_CHIP: &str = "platform_nct6683_2592";
const CPU_CHIP: &str = "pci0000:00_0000:00:18_3";

/// Property name, metric, hwmon chip and hwmon sensor
const CHANNELS: &[(&str, &str, &str, &str)] = &[
    ("cpu_fan_speed", FAN_METRIC, SUPERIO_CHIP, "fan1"),
    ("pump_speed", FAN_METRIC, SUPERIO_CHIP, "fan2"),
    ("system_fan1_speed", FAN_METRIC, SUPERIO_CHIP, "fan3"),
    ("system_fan2_speed", FAN_METRIC, SUPERIO_CHIP, "fan4"),
    ("system_fan3_speed", FAN_METRIC, SUPERIO_CHIP, "fan5"),
    ("host_cpu_temperature", TEMP_METRIC, CPU_CHIP, "temp1"),
    ("host_system_temperature", TEMP_METRIC, SUPERIO_CHIP, "temp2"),
    ("host_vrm_temperature", TEMP_METRIC, SUPERIO_CHIP, "temp3"),
    ("host_pch_temperature", TEMP_METRIC, SUPERIO_CHIP, "temp4"),
];

struct CachedScrape {
    fetched_at: Instant,
    samples: Vec<Sample>,
}

/// Fan speeds and temperatures of a remote host, scraped from a Prometheus
/// node exporter
pub struct HostInfo {
    client: Client,
    url: String,
    cache: Option<CachedScrape>,
    expiry: Duration,
    manufacturer: String,
    model: String,
}

impl HostInfo {
    pub const PROPERTIES: &'static [&'static str] = &[
        "cpu_fan_speed",
        "pump_speed",
        "system_fan1_speed",
        "system_fan2_speed",
        "system_fan3_speed",
        "host_cpu_temperature",
        "host_system_temperature",
        "host_vrm_temperature",
        "host_pch_temperature",
    ];

    pub fn new(config: &Config) -> Result<Self, MeasurementError> {
        let url = config
            .prometheus_url
            .clone()
            .ok_or_else(|| MeasurementError::unavailable("'prometheus_url' is not configured"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(MeasurementError::unavailable)?;
        let mut host = Self {
            client,
            url,
            cache: None,
            expiry: Duration::from_secs(CACHE_EXPIRY_SECS),
            manufacturer: String::new(),
            model: String::new(),
        };
        let (manufacturer, model) = host
            .samples()?
            .iter()
            .find(|sample| sample.metric == DMI_METRIC)
            .map(|dmi| {
                let label = |name: &str| dmi.labels.get(name).unwrap_or_default().to_string();
                (label("system_vendor"), label("board_name"))
            })
            .ok_or_else(|| MeasurementError::unavailable(format!("Metric {DMI_METRIC} not found")))?;
        host.manufacturer = manufacturer;
        host.model = model;
        Ok(host)
    }

    /// Samples of the last scrape, refreshed once the cache has expired
    fn samples(&mut self) -> Result<&[Sample], MeasurementError> {
        let fresh = matches!(&self.cache, Some(cache) if cache.fetched_at.elapsed() <= self.expiry);
        if !fresh {
            log::debug!("Scraping metrics from {}", self.url);
            let body = self
                .client
                .get(&self.url)
                .send()
                .and_then(|resp| resp.error_for_status())
                .and_then(|resp| resp.text())
                .map_err(MeasurementError::unavailable)?;
            self.cache = Some(CachedScrape {
                fetched_at: Instant::now(),
                samples: parse_exposition(&body)?,
            });
        }
        Ok(self.cache.as_ref().map(|cache| cache.samples.as_slice()).unwrap_or_default())
    }

    fn channel(&mut self, property: &str) -> Result<Value, MeasurementError> {
        let &(_, metric, chip, sensor) = CHANNELS
            .iter()
            .find(|(name, ..)| *name == property)
            .ok_or_else(|| MeasurementError::UnknownProperty { property: property.to_string() })?;
        find_value(self.samples()?, metric, chip, sensor).map(Value::Float)
    }
}

fn find_value(samples: &[Sample], metric: &str, chip: &str, sensor: &str) -> Result<f64, MeasurementError> {
    let mut family = samples.iter().filter(|sample| sample.metric == metric).peekable();
    if family.peek().is_none() {
        return Err(MeasurementError::unavailable(format!("Metric {metric} not found")));
    }
    family
        .find(|sample| sample.labels.get("chip") == Some(chip) && sample.labels.get("sensor") == Some(sensor))
        .and_then(scalar)
        .ok_or_else(|| {
            MeasurementError::unavailable(format!(
                "Metric {metric} with chip={chip} sensor={sensor} not found"
            ))
        })
}

fn scalar(sample: &Sample) -> Option<f64> {
    match sample.value {
        Metric::Counter(v) | Metric::Gauge(v) | Metric::Untyped(v) => Some(v),
        _ => None,
    }
}

/// Samples of a text exposition, malformed lines are skipped
fn parse_exposition(text: &str) -> Result<Vec<Sample>, MeasurementError> {
    let lines = text.lines().map(|line| Ok(line.to_string()));
    Scrape::parse(lines)
        .map(|scrape| scrape.samples)
        .map_err(MeasurementError::unavailable)
}

impl Capability for HostInfo {
    fn read(&mut self, property: &str) -> Result<Value, MeasurementError> {
        self.channel(property)
    }

    fn serial_number(&self) -> String {
        "0000000000000000".to_string()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn manufacturer(&self) -> String {
        self.manufacturer.clone()
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use super::{Capability, MeasurementError, Value};

const W1_DEVICES: &str = "/sys/bus/w1/devices";
const FAMILY_PREFIX: &str = "28-";
// Power-on value of the scratchpad, reported before the first conversion
const RESET_VALUE: i64 = 85000;

/// Maxim DS18B20 1-Wire temperature probe exposed by the w1_therm kernel driver
pub struct Ds18b20 {
    id: String,
    dir: PathBuf,
}

impl Ds18b20 {
    pub const PROPERTIES: &'static [&'static str] = &["temperature"];

    pub fn new(addr: Option<&str>) -> Result<Self, MeasurementError> {
        Self::with_base(Path::new(W1_DEVICES), addr)
    }

    fn with_base(base: &Path, addr: Option<&str>) -> Result<Self, MeasurementError> {
        let id = match addr {
            Some(addr) => addr.trim_start_matches(FAMILY_PREFIX).to_lowercase(),
            None => first_device(base)?,
        };
        let dir = base.join(format!("{FAMILY_PREFIX}{id}"));
        if !dir.is_dir() {
            return Err(MeasurementError::unavailable(format!(
                "No DS18B20 sensor with id '{id}' found"
            )));
        }
        Ok(Self { id, dir })
    }

    fn temperature(&self) -> Result<Value, MeasurementError> {
        let data = fs::read_to_string(self.dir.join("w1_slave"))
            .map_err(|e| MeasurementError::unavailable(format!("sensor {} not found: {e}", self.id)))?;
        parse_w1_slave(&data).map(|millis| Value::Float(millis as f64 / 1000.0))
    }
}

fn first_device(base: &Path) -> Result<String, MeasurementError> {
    let entries = fs::read_dir(base).map_err(MeasurementError::unavailable)?;
    let mut ids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(FAMILY_PREFIX))
                .map(str::to_string)
        })
        .collect();
    ids.sort();
    ids.into_iter()
        .next()
        .ok_or_else(|| MeasurementError::unavailable("No DS18B20 sensor found"))
}

/// Temperature in millidegrees from the two-line w1_slave report
fn parse_w1_slave(data: &str) -> Result<i64, MeasurementError> {
    let mut lines = data.lines();
    let crc_line = lines.next().unwrap_or("");
    if !crc_line.trim_end().ends_with("YES") {
        return Err(MeasurementError::unavailable("Sensor is not yet ready to read temperature"));
    }
    let millis = lines
        .next()
        .and_then(|line| line.rsplit_once("t="))
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
        .ok_or_else(|| MeasurementError::unavailable("Malformed w1_slave data"))?;
    if millis == RESET_VALUE {
        return Err(MeasurementError::unavailable("Sensor returned its power-on reset value"));
    }
    Ok(millis)
}

impl Capability for Ds18b20 {
    fn read(&mut self, property: &str) -> Result<Value, MeasurementError> {
        match property {
            "temperature" => self.temperature(),
            _ => Err(MeasurementError::UnknownProperty { property: property.to_string() }),
        }
    }

    fn serial_number(&self) -> String {
        match u64::from_str_radix(&self.id, 16) {
            Ok(serial) => format!("{serial:012x}"),
            Err(_) => self.id.clone(),
        }
    }

    fn model(&self) -> String {
        "DS18B20".to_string()
    }

    fn manufacturer(&self) -> String {
        "MAXIM".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{parse_w1_slave, Ds18b20};
    use crate::sensor::{Capability, MeasurementError, Value};

    const READY: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    fn add_device(base: &Path, id: &str, w1_slave: &str) {
        let dir = base.join(format!("28-{id}"));
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("w1_slave"), w1_slave).unwrap();
    }

    #[test]
    fn test_parse_w1_slave() {
        assert_eq!(parse_w1_slave(READY), Ok(23125));
    }

    #[test]
    fn test_parse_w1_slave_not_ready() {
        let data = "72 01 4b 46 7f ff 0e 10 57 : crc=58 NO\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";
        assert!(matches!(parse_w1_slave(data), Err(MeasurementError::Unavailable { .. })));
    }

    #[test]
    fn test_parse_w1_slave_reset_value() {
        let data = "50 05 4b 46 7f ff 0c 10 1c : crc=1c YES\n50 05 4b 46 7f ff 0c 10 1c t=85000\n";
        assert!(parse_w1_slave(data).is_err());
    }

    #[test]
    fn test_read_temperature() {
        let base = tempfile::tempdir().unwrap();
        add_device(base.path(), "0316a2795eff", READY);
        let mut sensor = Ds18b20::with_base(base.path(), Some("0316a2795eff")).unwrap();
        assert_eq!(sensor.read("temperature"), Ok(Value::Float(23.125)));
        assert_eq!(sensor.serial_number(), "0316a2795eff");
        assert_eq!(sensor.model(), "DS18B20");
    }

    #[test]
    fn test_first_device_is_used_without_address() {
        let base = tempfile::tempdir().unwrap();
        add_device(base.path(), "0000000000b2", READY);
        add_device(base.path(), "0000000000a1", READY);
        let sensor = Ds18b20::with_base(base.path(), None).unwrap();
        assert_eq!(sensor.serial_number(), "0000000000a1");
    }

    #[test]
    fn test_missing_device() {
        let base = tempfile::tempdir().unwrap();
        assert!(Ds18b20::with_base(base.path(), Some("0316a2795eff")).is_err());
        assert!(Ds18b20::with_base(base.path(), None).is_err());
    }

    #[test]
    fn test_device_removed_after_init() {
        let base = tempfile::tempdir().unwrap();
        add_device(base.path(), "0316a2795eff", READY);
        let mut sensor = Ds18b20::with_base(base.path(), Some("28-0316a2795eff")).unwrap();
        fs::remove_file(base.path().join("28-0316a2795eff/w1_slave")).unwrap();
        assert!(sensor.read("temperature").is_err());
    }
}

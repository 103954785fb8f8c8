use std::fs;
use std::path::{Path, PathBuf};
use std::thread::available_parallelism;

use chrono::{Local, SecondsFormat, TimeZone};
use sysinfo::System;

use super::sysfs;
use super::{Capability, MeasurementError, Value};

const HWMON: &str = "/sys/class/hwmon";
const CPU_THERMAL: &str = "cpu_thermal";

/// Metrics of the host running the bridge
pub struct SysInfo {
    hwmon: PathBuf,
    model: String,
}

impl SysInfo {
    pub const PROPERTIES: &'static [&'static str] =
        &["cpu_temperature", "uptime", "boot_time", "loadavg_1min"];

    pub fn new() -> Self {
        let (hardware, _) = sysfs::cpuinfo();
        Self {
            hwmon: PathBuf::from(HWMON),
            model: format!("{hardware} ({})", sysfs::board_model()),
        }
    }

    fn cpu_temperature(&self) -> Result<Value, MeasurementError> {
        let millis = read_hwmon_temperature(&self.hwmon, CPU_THERMAL)?;
        Ok(Value::Float(millis as f64 / 1000.0))
    }

    fn uptime(&self) -> Result<Value, MeasurementError> {
        let uptime = i64::try_from(System::uptime()).map_err(MeasurementError::unavailable)?;
        Ok(Value::Integer(uptime))
    }

    fn boot_time(&self) -> Result<Value, MeasurementError> {
        let secs = i64::try_from(System::boot_time()).map_err(MeasurementError::unavailable)?;
        let boot_time = Local
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| MeasurementError::unavailable(format!("invalid boot time: {secs}")))?;
        Ok(Value::String(boot_time.to_rfc3339_opts(SecondsFormat::Secs, false)))
    }

    fn loadavg_1min(&self) -> Result<Value, MeasurementError> {
        let cpus = available_parallelism().map_err(MeasurementError::unavailable)?;
        let load = System::load_average();
        Ok(Value::Float(load.one / cpus.get() as f64 * 100.0))
    }
}

/// Millidegrees reported by `temp1_input` of the hwmon chip called `chip`
fn read_hwmon_temperature(base: &Path, chip: &str) -> Result<i64, MeasurementError> {
    let entries = fs::read_dir(base).map_err(MeasurementError::unavailable)?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let dir = entry.path();
        if sysfs::read_line(&dir.join("name")).as_deref() != Some(chip) {
            continue;
        }
        let value = sysfs::read_line(&dir.join("temp1_input"))
            .ok_or_else(|| MeasurementError::unavailable(format!("no temperature input for {chip}")))?;
        return value.parse::<i64>().map_err(MeasurementError::unavailable);
    }
    Err(MeasurementError::unavailable(format!("'{chip}' not found")))
}

impl Capability for SysInfo {
    fn read(&mut self, property: &str) -> Result<Value, MeasurementError> {
        match property {
            "cpu_temperature" => self.cpu_temperature(),
            "uptime" => self.uptime(),
            "boot_time" => self.boot_time(),
            "loadavg_1min" => self.loadavg_1min(),
            _ => Err(MeasurementError::UnknownProperty { property: property.to_string() }),
        }
    }

    fn serial_number(&self) -> String {
        sysfs::serial_number()
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn manufacturer(&self) -> String {
        "Raspberry Pi".to_string()
    }
}

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::config::SensorConfig;
use crate::sensor::{MeasurementError, Value};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
// No f64 has a non-zero digit this far past the decimal point
const MAX_DECIMALS: u32 = 323;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Offline,
    Online(Reading),
}

impl Sample {
    pub fn status(&self) -> &'static str {
        match self {
            Sample::Offline => "offline",
            Sample::Online(_) => "online",
        }
    }
}

/// Turn the outcome of a sensor read into what gets published for it
pub fn sample(
    raw: Result<Value, MeasurementError>,
    sensor: &SensorConfig,
    now: NaiveDateTime,
) -> Sample {
    match raw {
        Err(_) => Sample::Offline,
        Ok(value) => Sample::Online(Reading {
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            value: normalize(value, sensor.device_offset, sensor.output_precision),
        }),
    }
}

/// Apply the offset correction and output rounding to numeric values.
///
/// Booleans and strings are states, not quantities, and pass through untouched.
/// Without a precision floats are rounded to a whole number, as are integers
/// that had an offset applied.
pub fn normalize(value: Value, offset: Option<f64>, precision: Option<i32>) -> Value {
    match (value, offset) {
        (Value::Float(v), offset) => round(v + offset.unwrap_or(0.0), precision),
        (Value::Integer(v), Some(offset)) => round(v as f64 + offset, precision),
        (Value::Integer(v), None) => match precision {
            Some(digits) if digits < 0 => round(v as f64, precision),
            _ => Value::Integer(v),
        },
        (value, _) => value,
    }
}

/// Rounds on the exact decimal expansion of `value`, ties to even
fn round(value: f64, precision: Option<i32>) -> Value {
    match precision {
        None => Value::Integer(value.round_ties_even() as i64),
        Some(digits) if digits < 0 => {
            let exponent = digits.unsigned_abs().min(f64::MAX_10_EXP as u32);
            let factor = 10f64.powi(exponent as i32);
            Value::Integer(((value / factor).round_ties_even() * factor) as i64)
        }
        Some(digits) if digits as u32 > MAX_DECIMALS => Value::Float(value),
        Some(digits) => {
            let digits = digits as usize;
            Value::Float(format!("{value:.digits$}").parse().unwrap_or(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{normalize, sample, Reading, Sample};
    use crate::config::test_sensor;
    use crate::sensor::{MeasurementError, Value};

    fn noon() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(12, 0, 5, 750)
            .unwrap()
    }

    #[test]
    fn test_offset_and_precision() {
        let mut sensor = test_sensor("temp01");
        sensor.device_offset = Some(-2.0);
        sensor.output_precision = Some(1);
        assert_eq!(
            sample(Ok(Value::Float(24.37)), &sensor, noon()),
            Sample::Online(Reading {
                timestamp: "2024-03-09T12:00:05".to_string(),
                value: Value::Float(22.4),
            })
        );
    }

    #[test]
    fn test_failure_is_offline() {
        let sensor = test_sensor("fan1");
        let res = sample(Err(MeasurementError::unavailable("no route to host")), &sensor, noon());
        assert_eq!(res, Sample::Offline);
        assert_eq!(res.status(), "offline");
    }

    #[test]
    fn test_states_bypass_offset_and_rounding() {
        assert_eq!(normalize(Value::Bool(true), Some(1.5), Some(0)), Value::Bool(true));
        assert_eq!(
            normalize(Value::String("ON".to_string()), Some(1.5), Some(0)),
            Value::String("ON".to_string())
        );
    }

    #[test]
    fn test_integers() {
        assert_eq!(normalize(Value::Integer(3600), None, None), Value::Integer(3600));
        assert_eq!(normalize(Value::Integer(3600), None, Some(2)), Value::Integer(3600));
        assert_eq!(normalize(Value::Integer(3649), None, Some(-2)), Value::Integer(3600));
        assert_eq!(normalize(Value::Integer(20), Some(0.25), Some(1)), Value::Float(20.2));
        assert_eq!(normalize(Value::Integer(3650), None, Some(-2)), Value::Integer(3600));
        assert_eq!(normalize(Value::Integer(3750), None, Some(-2)), Value::Integer(3800));
    }

    #[test]
    fn test_float_without_precision_is_whole() {
        assert_eq!(normalize(Value::Float(1083.6), None, None), Value::Integer(1084));
        assert_eq!(normalize(Value::Float(41.375), None, Some(2)), Value::Float(41.38));
    }

    #[test]
    fn test_ties_round_to_even() {
        // 22.45 is stored just below the tie
        assert_eq!(normalize(Value::Float(22.45), None, Some(1)), Value::Float(22.4));
        assert_eq!(normalize(Value::Float(2.5), None, Some(0)), Value::Float(2.0));
        assert_eq!(normalize(Value::Float(3.5), None, Some(0)), Value::Float(4.0));
        assert_eq!(normalize(Value::Float(0.125), None, Some(2)), Value::Float(0.12));
        assert_eq!(normalize(Value::Float(0.5), None, None), Value::Integer(0));
        assert_eq!(normalize(Value::Float(1.5), None, None), Value::Integer(2));
        assert_eq!(normalize(Value::Float(-2.5), None, None), Value::Integer(-2));
    }

    #[test]
    fn test_extreme_precision() {
        assert_eq!(normalize(Value::Float(22.37), None, Some(400)), Value::Float(22.37));
        assert_eq!(normalize(Value::Float(22.37), None, Some(30)), Value::Float(22.37));
        assert_eq!(normalize(Value::Float(1e-20), None, Some(30)), Value::Float(1e-20));
        assert_eq!(normalize(Value::Float(3649.0), None, Some(-400)), Value::Integer(0));
        assert_eq!(normalize(Value::Integer(3649), None, Some(i32::MIN)), Value::Integer(0));
    }

    #[test]
    fn test_reading_payload() {
        let reading = Reading {
            timestamp: "2024-03-09T12:00:05".to_string(),
            value: Value::Float(22.4),
        };
        assert_eq!(
            serde_json::to_string(&reading).unwrap(),
            r#"{"timestamp":"2024-03-09T12:00:05","value":22.4}"#
        );
    }
}

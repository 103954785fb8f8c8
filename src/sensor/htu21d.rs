use std::thread::sleep;
use std::time::Duration;

use crc::{Algorithm, Crc};
use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;

use super::{Capability, MeasurementError, Value};
use crate::config::Config;

const DEFAULT_ADDRESS: u16 = 0x40;

const TEMPERATURE_CMD: u8 = 0xF3;
const HUMIDITY_CMD: u8 = 0xF5;
const SOFT_RESET_CMD: u8 = 0xFE;
const SERIAL_ID1_CMD: [u8; 2] = [0xFA, 0x0F];
const SERIAL_ID2_CMD: [u8; 2] = [0xFC, 0xC9];

const RESET_TIME: Duration = Duration::from_millis(15);
const CONVERSION_TIME: Duration = Duration::from_millis(50);

// x^8 + x^5 + x^4 + 1
const CRC_8_HTU21D: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xa2,
    residue: 0x00,
};

/// Raw command/response exchange with the sensor
pub trait Bus {
    fn write(&mut self, data: &[u8]) -> Result<(), MeasurementError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<(), MeasurementError>;
}

impl Bus for LinuxI2CDevice {
    fn write(&mut self, data: &[u8]) -> Result<(), MeasurementError> {
        I2CDevice::write(self, data).map_err(MeasurementError::unavailable)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), MeasurementError> {
        I2CDevice::read(self, buf).map_err(MeasurementError::unavailable)
    }
}

/// Measurement Specialities HTU21D humidity and temperature sensor on I²C
pub struct Htu21d<B: Bus> {
    bus: B,
    serial: String,
}

impl Htu21d<LinuxI2CDevice> {
    pub const PROPERTIES: &'static [&'static str] = &["temperature", "relative_humidity"];

    pub fn new(addr: Option<&str>, config: &Config) -> Result<Self, MeasurementError> {
        let address = match addr {
            Some(addr) => parse_address(addr)?,
            None => DEFAULT_ADDRESS,
        };
        let bus = LinuxI2CDevice::new(&config.i2c_bus, address).map_err(|e| {
            MeasurementError::unavailable(format!("Cannot open {} at 0x{address:02x}: {e}", config.i2c_bus))
        })?;
        Self::with_bus(bus)
    }
}

impl<B: Bus> Htu21d<B> {
    fn with_bus(mut bus: B) -> Result<Self, MeasurementError> {
        bus.write(&[SOFT_RESET_CMD])?;
        sleep(RESET_TIME);
        let serial = match read_serial(&mut bus) {
            Ok(serial) => serial.to_string(),
            Err(e) => {
                log::warn!("Cannot read HTU21D serial number: {e}");
                "Unknown".to_string()
            }
        };
        Ok(Self { bus, serial })
    }

    /// 14 bit (temperature) or 12 bit (humidity) reading with status bits cleared
    fn measure(&mut self, cmd: u8) -> Result<u16, MeasurementError> {
        self.bus.write(&[cmd])?;
        sleep(CONVERSION_TIME);
        let mut buf = [0u8; 3];
        self.bus.read(&mut buf)?;
        check_crc(&buf[..2], buf[2])?;
        Ok(u16::from_be_bytes([buf[0], buf[1]]) & 0xFFFC)
    }

    fn temperature(&mut self) -> Result<Value, MeasurementError> {
        let raw = self.measure(TEMPERATURE_CMD)?;
        Ok(Value::Float(-46.85 + 175.72 * f64::from(raw) / 65536.0))
    }

    fn relative_humidity(&mut self) -> Result<Value, MeasurementError> {
        let raw = self.measure(HUMIDITY_CMD)?;
        Ok(Value::Float((-6.0 + 125.0 * f64::from(raw) / 65536.0).clamp(0.0, 100.0)))
    }
}

fn parse_address(addr: &str) -> Result<u16, MeasurementError> {
    let addr = addr.trim();
    let parsed = match addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => addr.parse(),
    };
    parsed.map_err(|_| MeasurementError::unavailable(format!("Invalid I2C address '{addr}'")))
}

fn check_crc(data: &[u8], expected: u8) -> Result<(), MeasurementError> {
    let actual = Crc::<u8>::new(&CRC_8_HTU21D).checksum(data);
    if actual != expected {
        return Err(MeasurementError::unavailable(format!(
            "Invalid crc, expected {expected:#04x} but was {actual:#04x}"
        )));
    }
    Ok(())
}

/// Unique part of the electronic serial number, shared with the Si7021 layout
fn read_serial<B: Bus>(bus: &mut B) -> Result<u32, MeasurementError> {
    let mut id1 = [0u8; 8];
    bus.write(&SERIAL_ID1_CMD)?;
    bus.read(&mut id1)?;
    let mut id2 = [0u8; 6];
    bus.write(&SERIAL_ID2_CMD)?;
    bus.read(&mut id2)?;
    if id1[0] != 0x00 || id2[0] != 0x32 || id2[3] != 0x48 || id2[4] != 0x54 {
        return Err(MeasurementError::unavailable("Invalid serial number"));
    }
    Ok(u32::from_be_bytes([id1[2], id1[4], id1[6], id2[1]]))
}

impl<B: Bus> Capability for Htu21d<B> {
    fn read(&mut self, property: &str) -> Result<Value, MeasurementError> {
        match property {
            "temperature" => self.temperature(),
            "relative_humidity" => self.relative_humidity(),
            _ => Err(MeasurementError::UnknownProperty { property: property.to_string() }),
        }
    }

    fn serial_number(&self) -> String {
        self.serial.clone()
    }

    fn model(&self) -> String {
        "HTU21D".to_string()
    }

    fn manufacturer(&self) -> String {
        "Measurement Specialities".to_string()
    }
}

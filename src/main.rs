use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;

use snafu::{ResultExt, Whatever};

mod config;
mod device;
mod discovery;
mod hass;
mod mqtt;
mod reading;
mod scheduler;
mod sensor;
mod session;

use crate::discovery::Discovery;
use crate::mqtt::MqttTransport;
use crate::scheduler::Scheduler;
use crate::sensor::Sensor;
use crate::session::{SessionManager, TcpProbe, Timings};

#[derive(Parser, Debug)]
#[command(about = "Publish sensor readings to MQTT with Home Assistant discovery")]
struct Args {
    /// Bridge settings
    #[arg(default_value = "config.yaml")]
    config: PathBuf,
    /// Sensor definitions
    #[arg(default_value = "sensors.yaml")]
    sensors: PathBuf,
}

fn main() -> Result<(), Whatever> {
    let args = Args::parse();

    let config = config::load(&args.config)
        .with_whatever_context(|e| format!("{e}"))?;
    let sensor_configs = config::load_sensors(&args.sensors, &config)
        .with_whatever_context(|e| format!("{e}"))?;

    let default_level = if config.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let descriptor = device::describe(&config);

    let mut sensors = Vec::with_capacity(sensor_configs.len());
    for sensor_config in sensor_configs {
        let id = sensor_config.id.clone();
        let sensor = Sensor::init(sensor_config, &config)
            .with_whatever_context(|e| format!("Cannot initialise sensor {id}: {e}"))?;
        sensors.push(sensor);
    }

    let discovery = Discovery::new(
        &config,
        &descriptor.device,
        &descriptor.unique_id,
        sensors.iter().map(|sensor| (&sensor.config, &sensor.identity)),
    )
    .with_whatever_context(|e| format!("Error when serializing discovery message: {e}"))?;
    log::info!("Prepared discovery messages for {} sensors", discovery.announcements().len());

    let transport = MqttTransport::new(&config, &descriptor.unique_id)
        .with_whatever_context(|e| format!("Error creating mqtt client: {e}"))?;
    let mut session = SessionManager::new(
        transport,
        TcpProbe::new(&config.mqtt_broker, config.mqtt_port),
        discovery,
        config.broker_address(),
        Timings::default(),
    );

    let scheduler = Scheduler::new(
        sensors,
        session.handle(),
        Duration::from_secs(config.update_period),
    );
    thread::Builder::new()
        .name("poller".to_string())
        .spawn(move || scheduler.run())
        .with_whatever_context(|e| format!("Cannot start polling thread: {e}"))?;

    session.run().with_whatever_context(|e| format!("{e}"))
}

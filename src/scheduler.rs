use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::Local;

use crate::hass;
use crate::reading::{self, Sample};
use crate::sensor::Sensor;
use crate::session::{Publish, Qos, SessionHandle};

/// Polls every sensor on a fixed period and publishes the results
pub struct Scheduler<P> {
    sensors: Vec<Sensor>,
    session: SessionHandle<P>,
    period: Duration,
}

impl<P: Publish + Clone> Scheduler<P> {
    pub fn new(sensors: Vec<Sensor>, session: SessionHandle<P>, period: Duration) -> Self {
        Self {
            sensors,
            session,
            period,
        }
    }

    pub fn run(mut self) {
        log::info!(
            "Polling {} sensors every {}s",
            self.sensors.len(),
            self.period.as_secs()
        );
        let mut deadline = Instant::now();
        loop {
            self.poll_once();
            deadline += self.period;
            let now = Instant::now();
            if deadline > now {
                sleep(deadline - now);
            } else {
                log::warn!("Polling took longer than {}s", self.period.as_secs());
                deadline = now;
            }
        }
    }

    /// Read and publish every sensor once, in registration order
    pub fn poll_once(&mut self) {
        for sensor in self.sensors.iter_mut() {
            let raw = sensor.read();
            let id = &sensor.config.id;
            if let Err(e) = &raw {
                log::warn!(
                    "Failed to update measurements for sensor {id} ({e}). Sensor status will be set to offline."
                );
            }
            let sample = reading::sample(raw, &sensor.config, Local::now().naive_local());
            self.session.publish(
                &hass::status_topic(id),
                sample.status(),
                Qos::AtMostOnce,
                false,
            );
            if let Sample::Online(reading) = sample {
                let payload = match serde_json::to_string(&reading) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Error when serializing reading for sensor {id}: {e}");
                        continue;
                    }
                };
                log::info!(
                    "Publishing reading for sensor {id}: timestamp={}, value={}",
                    reading.timestamp,
                    reading.value
                );
                self.session.publish(&hass::state_topic(id), &payload, Qos::AtMostOnce, false);
            }
        }
    }
}

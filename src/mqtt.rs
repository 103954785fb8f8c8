use std::time::Duration;

use paho_mqtt as mqtt;

use crate::config::Config;
use crate::session::{Disconnect, Outgoing, Publish, Transport, TransportError};

const MQTT_KEEP_ALIVE_SECS: u64 = 30;
const MQTT_CONNECT_TIMEOUT_SECS: u64 = 30;

type Events = Box<dyn Iterator<Item = Option<mqtt::Message>>>;

/// Paho MQTT client driven by the session manager
pub struct MqttTransport {
    client: mqtt::Client,
    conn_opts: mqtt::ConnectOptions,
    events: Events,
}

impl MqttTransport {
    pub fn new(cfg: &Config, client_id: &str) -> Result<Self, TransportError> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(cfg.server_uri())
            .client_id(client_id)
            .finalize();
        let mut client = mqtt::Client::new(create_opts).map_err(TransportError::new)?;
        let events = consume(&mut client);
        Ok(Self {
            client,
            conn_opts: connect_options(cfg),
            events,
        })
    }
}

/// Connection-lost notifications arrive as `None` on the consumer channel
fn consume(client: &mut mqtt::Client) -> Events {
    Box::new(client.start_consuming().into_iter())
}

fn connect_options(cfg: &Config) -> mqtt::ConnectOptions {
    let mut conn_opts_builder = mqtt::ConnectOptionsBuilder::new();
    conn_opts_builder
        .keep_alive_interval(Duration::from_secs(MQTT_KEEP_ALIVE_SECS))
        .connect_timeout(Duration::from_secs(MQTT_CONNECT_TIMEOUT_SECS))
        .clean_session(true);
    if let Some((user, password)) = cfg.mqtt_credentials() {
        conn_opts_builder.user_name(user).password(password);
    }
    if cfg.mqtt_use_tls {
        conn_opts_builder.ssl_options(mqtt::SslOptionsBuilder::new().finalize());
    }
    conn_opts_builder.finalize()
}

impl Transport for MqttTransport {
    type Publisher = MqttPublisher;

    fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        self.client
            .connect(self.conn_opts.clone())
            .map(|_| ())
            .map_err(TransportError::new)
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.client.reconnect().map(|_| ()).map_err(TransportError::new)
    }

    fn wait_for_disconnect(&mut self) -> Disconnect {
        loop {
            match self.events.next() {
                Some(Some(msg)) => log::debug!("Ignoring message on {}", msg.topic()),
                Some(None) => return Disconnect::Unclean,
                None => {
                    // MQTT 3.1.1 has no server DISCONNECT, so a live client never
                    // ends the stream; this only follows a local stop_consuming
                    self.events = consume(&mut self.client);
                    return Disconnect::Clean;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct MqttPublisher {
    client: mqtt::Client,
}

impl Publish for MqttPublisher {
    fn send(&self, msg: &Outgoing) -> Result<(), TransportError> {
        let message = if msg.retain {
            mqtt::Message::new_retained(msg.topic.as_str(), msg.payload.as_str(), msg.qos.level())
        } else {
            mqtt::Message::new(msg.topic.as_str(), msg.payload.as_str(), msg.qos.level())
        };
        self.client.publish(message).map_err(TransportError::new)
    }
}

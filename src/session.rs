use std::fmt::Display;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use snafu::prelude::*;

use crate::discovery::Discovery;

const PROBE_TIMEOUT_SECS: u64 = 5;
const RECONNECT_DELAY_SECS: u64 = 5;
const REACHABILITY_RETRY_SECS: u64 = 10;
const CONNECT_RETRY_SECS: u64 = 10;

#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("Unable to reach MQTT broker at {address}"))]
    Unreachable { address: String },
}

#[derive(Debug, Snafu)]
#[snafu(display("MQTT transport error: {message}"))]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Display) -> Self {
        Self { message: message.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    pub fn level(self) -> i32 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retain: bool,
}

/// Sending half of a transport, usable from any thread
pub trait Publish: Send + 'static {
    fn send(&self, msg: &Outgoing) -> Result<(), TransportError>;
}

/// How a logical session ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disconnect {
    Clean,
    Unclean,
}

/// Protocol-level connection driven by the session manager
pub trait Transport {
    type Publisher: Publish + Clone;

    fn publisher(&self) -> Self::Publisher;
    fn connect(&mut self) -> Result<(), TransportError>;
    /// Re-establish a lost connection with the options of the last `connect`
    fn reconnect(&mut self) -> Result<(), TransportError>;
    /// Block until the current connection goes away
    fn wait_for_disconnect(&mut self) -> Disconnect;
}

pub trait Probe {
    fn reachable(&self) -> bool;
}

/// Raw TCP connect to the broker, without any protocol exchange
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
        }
    }
}

impl Probe for TcpProbe {
    fn reachable(&self) -> bool {
        let addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("Cannot resolve {}: {e}", self.host);
                return false;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(e) => log::debug!("Broker probe to {addr} failed: {e}"),
            }
        }
        false
    }
}

/// Publishing side of the session shared with the poller.
///
/// Messages published while the session is down are dropped, never queued.
pub struct SessionHandle<P> {
    publisher: P,
    connected: Arc<AtomicBool>,
}

impl<P: Clone> Clone for SessionHandle<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            connected: Arc::clone(&self.connected),
        }
    }
}

impl<P: Publish + Clone> SessionHandle<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            publisher,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns whether the message was handed to the transport
    pub fn publish(&self, topic: &str, payload: &str, qos: Qos, retain: bool) -> bool {
        if !self.is_connected() {
            log::info!("Message publishing is unavailable when the MQTT broker is not connected ({topic})");
            return false;
        }
        self.send(topic, payload, qos, retain)
    }

    /// Hand a message to the transport without checking the connected flag.
    ///
    /// Only the session manager uses this, to announce a new session before
    /// the poller is let through.
    pub(crate) fn send(&self, topic: &str, payload: &str, qos: Qos, retain: bool) -> bool {
        log::trace!("Sending message to {topic}: {payload}");
        let msg = Outgoing {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
            retain,
        };
        match self.publisher.send(&msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cannot publish to {topic}: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    WaitingForReachability,
}

#[derive(Debug, Clone)]
pub struct Timings {
    pub reconnect_delay: Duration,
    pub reachability_retry: Duration,
    pub connect_retry: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            reachability_retry: Duration::from_secs(REACHABILITY_RETRY_SECS),
            connect_retry: Duration::from_secs(CONNECT_RETRY_SECS),
        }
    }
}

/// Owns the broker connection and keeps it alive.
///
/// Every successful handshake starts a new logical session, and each logical
/// session publishes the discovery messages exactly once before anything else
/// goes out through the discovery path.
pub struct SessionManager<T: Transport, R: Probe> {
    transport: T,
    probe: R,
    handle: SessionHandle<T::Publisher>,
    discovery: Discovery,
    timings: Timings,
    address: String,
    phase: Phase,
    discovery_done: bool,
    reached_broker: bool,
}

impl<T: Transport, R: Probe> SessionManager<T, R> {
    pub fn new(transport: T, probe: R, discovery: Discovery, address: String, timings: Timings) -> Self {
        let handle = SessionHandle::new(transport.publisher());
        Self {
            transport,
            probe,
            handle,
            discovery,
            timings,
            address,
            phase: Phase::Disconnected,
            discovery_done: false,
            reached_broker: false,
        }
    }

    pub fn handle(&self) -> SessionHandle<T::Publisher> {
        self.handle.clone()
    }

    /// Drive the session forever. Only returns when the broker could not be
    /// reached at all on the first attempt.
    pub fn run(&mut self) -> Result<(), SessionError> {
        loop {
            self.step()?;
        }
    }

    pub fn step(&mut self) -> Result<(), SessionError> {
        match self.phase {
            Phase::Disconnected => self.phase = Phase::Connecting,
            Phase::Connecting => self.connect()?,
            Phase::Connected => self.await_disconnect(),
            Phase::WaitingForReachability => self.await_reachability(),
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<(), SessionError> {
        if !self.probe.reachable() {
            ensure!(self.reached_broker, UnreachableSnafu { address: self.address.clone() });
            log::warn!("MQTT broker at {} is not reachable", self.address);
            self.phase = Phase::WaitingForReachability;
            return Ok(());
        }
        self.reached_broker = true;

        log::info!("Connecting to MQTT broker at {} ...", self.address);
        match self.transport.connect() {
            Ok(()) => self.on_connected(),
            Err(e) => {
                log::warn!("Unable to connect to MQTT broker. Waiting:\n\t{e}");
                sleep(self.timings.connect_retry);
            }
        }
        Ok(())
    }

    fn on_connected(&mut self) {
        log::info!("MQTT broker connected!");
        self.phase = Phase::Connected;
        if !self.discovery_done {
            self.discovery.publish(&self.handle);
            self.discovery_done = true;
        }
        // The poller stays gated until every sensor is registered
        self.handle.set_connected(true);
    }

    fn await_disconnect(&mut self) {
        let disconnect = self.transport.wait_for_disconnect();
        self.handle.set_connected(false);
        self.discovery_done = false;
        match disconnect {
            Disconnect::Clean => {
                log::info!("MQTT broker disconnected! Will reconnect ...");
                self.phase = Phase::Connecting;
            }
            Disconnect::Unclean => {
                log::warn!("Lost connection to MQTT broker! Will reconnect ...");
                sleep(self.timings.reconnect_delay);
                self.phase = Phase::WaitingForReachability;
            }
        }
    }

    fn await_reachability(&mut self) {
        while !self.probe.reachable() {
            log::debug!("MQTT broker at {} is still unreachable", self.address);
            sleep(self.timings.reachability_retry);
        }
        log::info!("Reconnecting to MQTT broker at {} ...", self.address);
        match self.transport.reconnect() {
            Ok(()) => self.on_connected(),
            Err(e) => {
                log::warn!("Unable to reconnect to MQTT broker. Waiting:\n\t{e}");
                sleep(self.timings.connect_retry);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::fake::{FakeProbe, FakePublisher, FakeTransport};
    use super::{
        Disconnect, Phase, Probe, Qos, SessionError, SessionHandle, SessionManager, TcpProbe, Timings,
        TransportError,
    };
    use crate::discovery::test_discovery;

    fn no_delays() -> Timings {
        Timings {
            reconnect_delay: Duration::ZERO,
            reachability_retry: Duration::ZERO,
            connect_retry: Duration::ZERO,
        }
    }

    fn manager(transport: FakeTransport, probe: FakeProbe) -> SessionManager<FakeTransport, FakeProbe> {
        SessionManager::new(
            transport,
            probe,
            test_discovery(&["a", "b", "c"]),
            "broker.local:1883".to_string(),
            no_delays(),
        )
    }

    fn discovery_count(publisher: &FakePublisher) -> (usize, usize) {
        let sent = publisher.sent();
        let configs = sent.iter().filter(|msg| msg.topic.ends_with("/config")).count();
        let attributes = sent.iter().filter(|msg| msg.topic.ends_with("/attributes")).count();
        (configs, attributes)
    }

    #[test]
    fn test_unreachable_at_startup_is_fatal() {
        let mut session = manager(FakeTransport::default(), FakeProbe::new(&[false]));
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connecting);
        let err = session.run().unwrap_err();
        assert!(matches!(err, SessionError::Unreachable { .. }));
        assert_eq!(err.to_string(), "Unable to reach MQTT broker at broker.local:1883");
        assert!(session.transport.calls.is_empty());
    }

    #[test]
    fn test_connect_runs_discovery_once() {
        let transport = FakeTransport::default();
        let publisher = transport.publisher.clone();
        let mut session = manager(transport, FakeProbe::default());
        let handle = session.handle();
        assert!(!handle.is_connected());

        session.step().unwrap();
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connected);
        assert!(handle.is_connected());
        assert_eq!(discovery_count(&publisher), (3, 3));
    }

    #[test]
    fn test_poller_waits_for_registrations() {
        let transport = FakeTransport::default();
        let publisher = transport.publisher.clone();
        let mut session = manager(transport, FakeProbe::default());
        let poller = session.handle();

        let accepted = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&accepted);
        publisher.on_next_send(move |_| {
            let ok = poller.publish("sensors/c/state", "{}", Qos::AtMostOnce, false);
            flag.store(ok, Ordering::SeqCst);
        });

        session.step().unwrap();
        session.step().unwrap();
        assert!(!accepted.load(Ordering::SeqCst));
        let topics: Vec<String> = publisher.sent().into_iter().map(|msg| msg.topic).collect();
        assert_eq!(topics.len(), 6);
        assert!(topics.iter().all(|topic| !topic.ends_with("/state")));

        assert!(session.handle().publish("sensors/c/state", "{}", Qos::AtMostOnce, false));
        let sent = publisher.sent();
        let registration = sent
            .iter()
            .position(|msg| msg.topic == "homeassistant/sensor/pikvm_abcdef/c/config")
            .unwrap();
        let state = sent.iter().position(|msg| msg.topic == "sensors/c/state").unwrap();
        assert!(registration < state);
    }

    #[test]
    fn test_reconnect_registers_before_state() {
        let mut transport = FakeTransport::default();
        transport.disconnects.push_back(Disconnect::Unclean);
        let publisher = transport.publisher.clone();
        let mut session = manager(transport, FakeProbe::default());
        let poller = session.handle();

        session.step().unwrap();
        session.step().unwrap();
        session.step().unwrap();
        publisher.clear();

        let accepted = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&accepted);
        publisher.on_next_send(move |_| {
            let ok = poller.publish("sensors/a/state", "{}", Qos::AtMostOnce, false);
            flag.store(ok, Ordering::SeqCst);
        });
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connected);
        assert!(!accepted.load(Ordering::SeqCst));
        assert_eq!(discovery_count(&publisher), (3, 3));
        assert!(publisher.sent().iter().all(|msg| !msg.topic.ends_with("/state")));
    }

    #[test]
    fn test_unclean_disconnect_rearms_discovery() {
        let mut transport = FakeTransport::default();
        transport.disconnects.push_back(Disconnect::Unclean);
        let publisher = transport.publisher.clone();
        // reachable for the first connect, then down twice while waiting
        let mut session = manager(transport, FakeProbe::new(&[true, false, false, true]));
        let handle = session.handle();

        session.step().unwrap();
        session.step().unwrap();
        publisher.clear();

        session.step().unwrap();
        assert_eq!(session.phase, Phase::WaitingForReachability);
        assert!(!handle.is_connected());
        assert!(!handle.publish("sensors/a/state", "{}", Qos::AtMostOnce, false));
        assert!(publisher.sent().is_empty());

        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connected);
        assert_eq!(session.transport.calls, ["connect", "wait", "reconnect"]);
        assert_eq!(discovery_count(&publisher), (3, 3));
    }

    #[test]
    fn test_clean_disconnect_reconnects_immediately() {
        let mut transport = FakeTransport::default();
        transport.disconnects.push_back(Disconnect::Clean);
        let publisher = transport.publisher.clone();
        let mut session = manager(transport, FakeProbe::default());

        session.step().unwrap();
        session.step().unwrap();
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connecting);
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connected);
        assert_eq!(session.transport.calls, ["connect", "wait", "connect"]);
        assert_eq!(discovery_count(&publisher), (6, 6));
    }

    #[test]
    fn test_connect_failure_is_retried() {
        let mut transport = FakeTransport::default();
        transport
            .connect_results
            .push_back(Err(TransportError::new("Bad user name or password")));
        let publisher = transport.publisher.clone();
        let mut session = manager(transport, FakeProbe::default());

        session.step().unwrap();
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connecting);
        assert!(publisher.sent().is_empty());
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connected);
        assert_eq!(discovery_count(&publisher), (3, 3));
    }

    #[test]
    fn test_broker_lost_after_first_contact_is_not_fatal() {
        let mut transport = FakeTransport::default();
        transport.disconnects.push_back(Disconnect::Clean);
        let mut session = manager(transport, FakeProbe::new(&[true, false, false, true]));

        session.step().unwrap();
        session.step().unwrap();
        session.step().unwrap();
        session.step().unwrap();
        assert_eq!(session.phase, Phase::WaitingForReachability);
        session.step().unwrap();
        assert_eq!(session.phase, Phase::Connected);
    }

    #[test]
    fn test_handle_publish_when_connected() {
        let publisher = FakePublisher::default();
        let handle = SessionHandle::new(publisher.clone());
        handle.set_connected(true);
        assert!(handle.clone().publish("sensors/a/status", "online", Qos::AtMostOnce, false));
        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, "online");
        assert_eq!(sent[0].qos.level(), 0);
        assert!(!sent[0].retain);
    }

    #[test]
    fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpProbe::new("127.0.0.1", port).reachable());
        drop(listener);
        assert!(!TcpProbe::new("127.0.0.1", port).reachable());
    }
}

use std::fs;
use std::net::{IpAddr, Ipv6Addr, UdpSocket};
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::config::Config;
use crate::hass::Device;
use crate::sensor::sysfs;

const DEVICE_NAME: &str = "PiKVM - open-source DIY IP-KVM";
const DEVICE_MANUFACTURER: &str = "pikvm.org";
const KVMD_META: &str = "/etc/kvmd/meta.yaml";
const IF_INET6: &str = "/proc/net/if_inet6";

#[derive(Deserialize)]
struct KvmdMeta {
    server: KvmdServer,
}

#[derive(Deserialize)]
struct KvmdServer {
    host: String,
}

/// Identity of the host the bridge runs on, fixed for the process lifetime
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub unique_id: String,
    pub device: Device,
}

/// Collect the host identity. Missing pieces degrade to placeholders.
pub fn describe(cfg: &Config) -> Descriptor {
    let serial = sysfs::serial_number();
    let unique_id = unique_id(&serial);
    let hostname = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let server_host = fs::read_to_string(KVMD_META)
        .ok()
        .and_then(|meta| parse_server_host(&meta))
        .unwrap_or_else(|| format!("{hostname}.local"));
    let (hardware, revision) = sysfs::cpuinfo();

    let mut connections = Vec::new();
    let iface = &cfg.network_interface;
    match sysfs::read_line(&Path::new("/sys/class/net").join(iface).join("address")) {
        Some(mac) => connections.push(("mac_address".to_string(), mac.to_lowercase())),
        None => log::warn!("Cannot read MAC address of {iface}"),
    }
    match local_ipv4(&cfg.mqtt_broker, cfg.mqtt_port) {
        Some(addr) => connections.push(("ipv4_address".to_string(), addr)),
        None => log::warn!("Cannot determine IPv4 address"),
    }
    match fs::read_to_string(IF_INET6).ok().and_then(|table| parse_if_inet6(&table, iface)) {
        Some(addr) => connections.push(("ipv6_address".to_string(), addr.to_string())),
        None => log::warn!("Cannot determine IPv6 address of {iface}"),
    }
    connections.push(("fqdn".to_string(), fqdn().unwrap_or_else(|| hostname.clone())));
    connections.push(("server_host".to_string(), server_host.clone()));

    let device = Device {
        identifiers: vec![hostname, unique_id.clone(), serial],
        connections,
        manufacturer: DEVICE_MANUFACTURER.to_string(),
        model: format!("PiKVM ({})", sysfs::board_model()),
        hw_version: format!("{hardware} (rev {revision})"),
        sw_version: format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        name: DEVICE_NAME.to_string(),
        configuration_url: format!("https://{server_host}"),
    };
    log::info!("Device {unique_id}: {} {}", device.model, device.hw_version);
    Descriptor { unique_id, device }
}

/// Device id made of the last six characters of the hardware serial
pub fn unique_id(serial: &str) -> String {
    let start = serial
        .char_indices()
        .rev()
        .nth(5)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("pikvm_{}", &serial[start..])
}

fn parse_server_host(meta: &str) -> Option<String> {
    match serde_yaml::from_str::<KvmdMeta>(meta) {
        Ok(meta) => Some(meta.server.host),
        Err(e) => {
            log::warn!("Cannot read server host from {KVMD_META}: {e}");
            None
        }
    }
}

/// First address of `iface` in the /proc/net/if_inet6 table
fn parse_if_inet6(table: &str, iface: &str) -> Option<Ipv6Addr> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [addr, .., name] if *name == iface => u128::from_str_radix(addr, 16).ok().map(Ipv6Addr::from),
            _ => None,
        }
    })
}

/// Local address the kernel routes traffic to the broker from. Connecting a
/// UDP socket sends nothing on the wire.
fn local_ipv4(broker: &str, port: u16) -> Option<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((broker, port)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(addr) if !addr.is_unspecified() => Some(addr.to_string()),
        _ => None,
    }
}

fn fqdn() -> Option<String> {
    let output = Command::new("hostname").arg("--fqdn").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let fqdn = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!fqdn.is_empty()).then_some(fqdn)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::{local_ipv4, parse_if_inet6, parse_server_host, unique_id};

    #[test]
    fn test_unique_id() {
        assert_eq!(unique_id("10000000abcdef01"), "pikvm_cdef01");
        assert_eq!(unique_id("abc"), "pikvm_abc");
    }

    #[test]
    fn test_parse_server_host() {
        let meta = "server:\n    host: kvm.example.org\nkvm: {}\n";
        assert_eq!(parse_server_host(meta), Some("kvm.example.org".to_string()));
        assert_eq!(parse_server_host("server: [unterminated"), None);
    }

    #[test]
    fn test_parse_if_inet6() {
        let table = "\
00000000000000000000000000000001 01 80 10 80       lo
fe80000000000000dea632fffe010203 02 40 20 80     eth0
20010db8000000000000000000000042 03 40 00 00    wlan0
";
        assert_eq!(
            parse_if_inet6(table, "eth0"),
            Some("fe80::dea6:32ff:fe01:203".parse::<Ipv6Addr>().unwrap())
        );
        assert_eq!(parse_if_inet6(table, "wlan0"), Some("2001:db8::42".parse().unwrap()));
        assert_eq!(parse_if_inet6(table, "eth1"), None);
    }

    #[test]
    fn test_local_ipv4_to_loopback() {
        assert_eq!(local_ipv4("127.0.0.1", 1883), Some("127.0.0.1".to_string()));
    }
}

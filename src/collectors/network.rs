use super::{format_bytes, format_speed, Source, SourceKind, SourceUnavailable};
use crate::snapshot::{
    ConnectionSummary, InterfaceAddress, InterfaceInfo, NetIoCounters, NetSpeed, NetworkReading,
};
use if_addrs::IfAddr;
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::net::IpAddr;
use std::time::Instant;
use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

/// Interfaces, cumulative counters, instantaneous throughput and connection
/// states.
///
/// Throughput is differenced against this adapter's own previous sample, so
/// each sampling loop must own its adapter.
pub struct NetworkAdapter {
    system: System,
    meter: ThroughputMeter,
}

impl NetworkAdapter {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_networks_list();
        Self {
            system,
            meter: ThroughputMeter::default(),
        }
    }

    fn interfaces(&self) -> BTreeMap<String, InterfaceInfo> {
        let mut out = BTreeMap::new();
        let mut ip = read_ip_addresses();
        for (name, _) in self.system.networks().iter() {
            let mut addresses = Vec::new();
            if let Some(mac) = read_mac_address(name) {
                addresses.push(InterfaceAddress {
                    family: "link".to_string(),
                    address: mac,
                    netmask: None,
                });
            }
            addresses.extend(ip.remove(name).unwrap_or_default());
            let (is_up, speed) = read_link_state(name);
            out.insert(
                name.clone(),
                InterfaceInfo {
                    is_up,
                    speed,
                    addresses,
                },
            );
        }
        out
    }

    fn io_counters(&self) -> NetIoCounters {
        let mut io = NetIoCounters::default();
        for (name, data) in self.system.networks().iter() {
            io.bytes_sent += data.total_transmitted();
            io.bytes_recv += data.total_received();
            io.packets_sent += data.total_packets_transmitted();
            io.packets_recv += data.total_packets_received();
            io.errin += data.total_errors_on_received();
            io.errout += data.total_errors_on_transmitted();
            let (dropin, dropout) = read_drop_counters(name);
            io.dropin += dropin;
            io.dropout += dropout;
        }
        io.bytes_sent_formatted = format_bytes(io.bytes_sent as f64);
        io.bytes_recv_formatted = format_bytes(io.bytes_recv as f64);
        io
    }
}

impl Default for NetworkAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for NetworkAdapter {
    type Reading = NetworkReading;

    fn kind(&self) -> SourceKind {
        SourceKind::Network
    }

    fn sample(&mut self) -> NetworkReading {
        self.system.refresh_networks_list();
        self.system.refresh_networks();
        let io_counters = self.io_counters();
        let speed = self.meter.update(
            IoTotals {
                sent: io_counters.bytes_sent,
                recv: io_counters.bytes_recv,
            },
            Instant::now(),
        );

        let connections = match read_socket_tables() {
            Ok(sockets) => summarize_connections(&sockets),
            Err(err) => {
                debug!(error = %err, "connection table degraded");
                ConnectionSummary::default()
            }
        };

        NetworkReading {
            interfaces: self.interfaces(),
            io_counters,
            speed,
            connections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTotals {
    pub sent: u64,
    pub recv: u64,
}

/// Turns cumulative byte counters into bytes/second.
///
/// The first update has no baseline and reports zero.
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    last: Option<(IoTotals, Instant)>,
}

impl ThroughputMeter {
    pub fn update(&mut self, totals: IoTotals, now: Instant) -> NetSpeed {
        let previous = self.last.replace((totals, now));
        let Some((prev, prev_at)) = previous else {
            return speed(0.0, 0.0);
        };

        let mut elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            elapsed = 1.0;
        }
        let upload = totals.sent.saturating_sub(prev.sent) as f64 / elapsed;
        let download = totals.recv.saturating_sub(prev.recv) as f64 / elapsed;
        speed(upload, download)
    }
}

fn speed(upload: f64, download: f64) -> NetSpeed {
    NetSpeed {
        upload_speed: upload,
        download_speed: download,
        upload_speed_formatted: format_speed(upload),
        download_speed_formatted: format_speed(download),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub inode: u64,
    pub status: &'static str,
}

/// Parses one of `/proc/net/{tcp,tcp6,udp,udp6}`.
pub fn parse_socket_table(text: &str, tcp: bool) -> Vec<SocketEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let inode = fields[9].parse::<u64>().ok()?;
            let status = if tcp {
                tcp_state_name(fields[3])
            } else {
                "NONE"
            };
            Some(SocketEntry { inode, status })
        })
        .collect()
}

fn tcp_state_name(hex: &str) -> &'static str {
    match u8::from_str_radix(hex, 16).unwrap_or(0) {
        0x01 => "ESTABLISHED",
        0x02 => "SYN_SENT",
        0x03 => "SYN_RECV",
        0x04 => "FIN_WAIT1",
        0x05 => "FIN_WAIT2",
        0x06 => "TIME_WAIT",
        0x07 => "CLOSE",
        0x08 => "CLOSE_WAIT",
        0x09 => "LAST_ACK",
        0x0A => "LISTEN",
        0x0B => "CLOSING",
        _ => "NONE",
    }
}

pub fn summarize_connections(sockets: &[SocketEntry]) -> ConnectionSummary {
    let mut by_status = BTreeMap::new();
    for socket in sockets {
        *by_status.entry(socket.status.to_string()).or_insert(0) += 1;
    }
    ConnectionSummary {
        available: true,
        total: sockets.len(),
        by_status,
    }
}

#[cfg(target_os = "linux")]
pub fn read_socket_tables() -> Result<Vec<SocketEntry>, SourceUnavailable> {
    let mut out = Vec::new();
    let mut readable = 0;
    for (file, tcp) in [("tcp", true), ("tcp6", true), ("udp", false), ("udp6", false)] {
        match fs::read_to_string(format!("/proc/net/{file}")) {
            Ok(text) => {
                readable += 1;
                out.extend(parse_socket_table(&text, tcp));
            }
            Err(err) => debug!(table = file, error = %err, "socket table unreadable"),
        }
    }
    if readable == 0 {
        return Err(SourceUnavailable::new(
            SourceKind::NetworkConnections,
            "no socket table readable",
        ));
    }
    Ok(out)
}

#[cfg(not(target_os = "linux"))]
pub fn read_socket_tables() -> Result<Vec<SocketEntry>, SourceUnavailable> {
    Err(SourceUnavailable::new(
        SourceKind::NetworkConnections,
        "socket tables not exposed on this platform",
    ))
}

/// Groups `(interface, ip, netmask)` rows per interface, IPv4 before IPv6.
pub fn group_ip_addresses(
    rows: impl IntoIterator<Item = (String, IpAddr, IpAddr)>,
) -> BTreeMap<String, Vec<InterfaceAddress>> {
    let mut out: BTreeMap<String, Vec<InterfaceAddress>> = BTreeMap::new();
    for (name, ip, netmask) in rows {
        let family = if ip.is_ipv4() { "inet" } else { "inet6" };
        out.entry(name).or_default().push(InterfaceAddress {
            family: family.to_string(),
            address: ip.to_string(),
            netmask: Some(netmask.to_string()),
        });
    }
    for addresses in out.values_mut() {
        addresses.sort_by_key(|a| a.family != "inet");
    }
    out
}

fn read_ip_addresses() -> BTreeMap<String, Vec<InterfaceAddress>> {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => group_ip_addresses(ifaces.into_iter().map(|iface| {
            let (ip, netmask) = match iface.addr {
                IfAddr::V4(v4) => (IpAddr::V4(v4.ip), IpAddr::V4(v4.netmask)),
                IfAddr::V6(v6) => (IpAddr::V6(v6.ip), IpAddr::V6(v6.netmask)),
            };
            (iface.name, ip, netmask)
        })),
        Err(err) => {
            debug!(error = %err, "interface addresses unreadable");
            BTreeMap::new()
        }
    }
}

#[cfg(target_os = "linux")]
fn read_sys_net(iface: &str, attr: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/class/net/{iface}/{attr}"))
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(target_os = "linux")]
fn read_mac_address(iface: &str) -> Option<String> {
    read_sys_net(iface, "address").filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
}

#[cfg(not(target_os = "linux"))]
fn read_mac_address(_iface: &str) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn read_link_state(iface: &str) -> (bool, u64) {
    let operstate = read_sys_net(iface, "operstate").unwrap_or_default();
    // Loopback reports "unknown" while fully usable.
    let is_up = operstate == "up" || (operstate == "unknown" && iface == "lo");
    let speed = read_sys_net(iface, "speed")
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(0) as u64;
    (is_up, speed)
}

#[cfg(not(target_os = "linux"))]
fn read_link_state(_iface: &str) -> (bool, u64) {
    (true, 0)
}

#[cfg(target_os = "linux")]
fn read_drop_counters(iface: &str) -> (u64, u64) {
    let read = |attr: &str| {
        read_sys_net(iface, attr)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    };
    (
        read("statistics/rx_dropped"),
        read("statistics/tx_dropped"),
    )
}

#[cfg(not(target_os = "linux"))]
fn read_drop_counters(_iface: &str) -> (u64, u64) {
    (0, 0)
}

pub mod command;
pub mod cpu;
pub mod disk;
pub mod gpu;
pub mod inventory;
pub mod memory;
pub mod network;
pub mod process;

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A single OS/hardware subsystem polled once per tick.
///
/// `sample` never fails: probe errors are absorbed at this boundary and
/// surface as availability flags on the returned reading.
pub trait Source {
    type Reading;

    fn kind(&self) -> SourceKind;
    fn sample(&mut self) -> Self::Reading;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Cpu,
    CpuTemperature,
    Memory,
    Gpu,
    Disk,
    DiskIo,
    Network,
    NetworkConnections,
    Process,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Cpu => "cpu",
            SourceKind::CpuTemperature => "cpu_temperature",
            SourceKind::Memory => "memory",
            SourceKind::Gpu => "gpu",
            SourceKind::Disk => "disk",
            SourceKind::DiskIo => "disk_io",
            SourceKind::Network => "network",
            SourceKind::NetworkConnections => "network_connections",
            SourceKind::Process => "process",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source (or one field of it) could not be read this tick.
#[derive(Debug, Error)]
#[error("{kind} unavailable: {reason}")]
pub struct SourceUnavailable {
    pub kind: SourceKind,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    round_to(bytes as f64 / GIB, 2)
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    round_to(bytes as f64 / MIB, 2)
}

pub fn bytes_to_kb(bytes: f64) -> f64 {
    bytes / KIB
}

pub fn percent(used: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    round_to(used / total * 100.0, 1)
}

pub fn format_bytes(bytes: f64) -> String {
    scale_units(bytes, &["B", "KB", "MB", "GB", "TB"], "PB")
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    scale_units(bytes_per_sec, &["B/s", "KB/s", "MB/s", "GB/s"], "TB/s")
}

fn scale_units(mut value: f64, units: &[&str], last: &str) -> String {
    for unit in units {
        if value < KIB {
            return format!("{value:.2} {unit}");
        }
        value /= KIB;
    }
    format!("{value:.2} {last}")
}

pub fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+' | 'e' | 'E'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gb_conversion_is_binary_and_rounded() {
        assert_eq!(bytes_to_gb(3 * 1024 * 1024 * 1024), 3.00);
        assert_eq!(bytes_to_gb(1_610_612_736), 1.5);
        assert_eq!(bytes_to_gb(1_000_000_000), 0.93);
    }

    #[test]
    fn mb_conversion() {
        assert_eq!(bytes_to_mb(5 * 1024 * 1024), 5.0);
        assert_eq!(bytes_to_mb(1_500_000), 1.43);
    }

    #[test]
    fn percent_guards_zero_total() {
        assert_eq!(percent(10.0, 0.0), 0.0);
        assert_eq!(percent(1.0, 3.0), 33.3);
    }

    #[test]
    fn human_readable_units() {
        assert_eq!(format_bytes(512.0), "512.00 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_speed(1_048_576.0), "1.00 MB/s");
        assert_eq!(format_speed(0.0), "0.00 B/s");
    }

    #[test]
    fn parses_loose_numbers() {
        assert_eq!(parse_f64_loose(" 42 "), Some(42.0));
        assert_eq!(parse_f64_loose("3,5"), Some(3.5));
        assert_eq!(parse_f64_loose("61 C"), Some(61.0));
        assert_eq!(parse_f64_loose("[N/A]"), None);
    }

    #[test]
    fn source_unavailable_message_names_source() {
        let err = SourceUnavailable::new(SourceKind::Gpu, "nvidia-smi not found");
        assert_eq!(err.to_string(), "gpu unavailable: nvidia-smi not found");
    }
}

use super::{bytes_to_gb, bytes_to_mb, percent, Source, SourceKind, SourceUnavailable};
use crate::snapshot::{DiskIo, DiskReading, Partition};
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use sysinfo::{DiskExt, System, SystemExt};
use tracing::debug;

const SECTOR_BYTES: u64 = 512;

/// Mounted partitions with usage, plus aggregate block-device counters.
pub struct DiskAdapter {
    system: System,
}

impl DiskAdapter {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Enumerates partitions only; used on its own when a session finalizes.
    pub fn partitions(&mut self) -> Vec<Partition> {
        self.system.refresh_disks_list();
        let entries = self.system.disks().iter().map(|d| {
            let total = d.total_space();
            let usage = if total == 0 {
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "filesystem reports zero capacity",
                ))
            } else {
                Ok(Usage {
                    total,
                    free: d.available_space(),
                })
            };
            MountEntry {
                device: d.name().to_string_lossy().to_string(),
                mountpoint: d.mount_point().to_string_lossy().to_string(),
                fstype: String::from_utf8_lossy(d.file_system()).to_string(),
                usage,
            }
        });
        collect_partitions(entries)
    }
}

impl Default for DiskAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for DiskAdapter {
    type Reading = DiskReading;

    fn kind(&self) -> SourceKind {
        SourceKind::Disk
    }

    fn sample(&mut self) -> DiskReading {
        let partitions = self.partitions();
        let io = read_disk_io().unwrap_or_else(|err| {
            debug!(error = %err, "disk io counters degraded");
            DiskIo::default()
        });
        DiskReading { partitions, io }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub total: u64,
    pub free: u64,
}

#[derive(Debug)]
pub struct MountEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub usage: io::Result<Usage>,
}

/// Best-effort: a mount whose usage lookup failed is dropped and the rest
/// are still reported.
pub fn collect_partitions(entries: impl IntoIterator<Item = MountEntry>) -> Vec<Partition> {
    entries
        .into_iter()
        .filter_map(|entry| match entry.usage {
            Ok(usage) => {
                let used = usage.total.saturating_sub(usage.free);
                Some(Partition {
                    device: entry.device,
                    mountpoint: entry.mountpoint,
                    fstype: entry.fstype,
                    total_gb: bytes_to_gb(usage.total),
                    used_gb: bytes_to_gb(used),
                    free_gb: bytes_to_gb(usage.free),
                    percent: percent(used as f64, usage.total as f64),
                })
            }
            Err(err) => {
                debug!(mount = %entry.mountpoint, error = %err, "skipping partition");
                None
            }
        })
        .collect()
}

/// Sums `/proc/diskstats` rows for which `include` returns true.
pub fn parse_diskstats(text: &str, include: impl Fn(&str) -> bool) -> DiskIo {
    let mut io = DiskIo {
        available: true,
        ..DiskIo::default()
    };
    let mut read_sectors = 0_u64;
    let mut write_sectors = 0_u64;

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 11 || !include(fields[2]) {
            continue;
        }
        let num = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
        io.read_count += num(3);
        read_sectors += num(5);
        io.read_time += num(6);
        io.write_count += num(7);
        write_sectors += num(9);
        io.write_time += num(10);
    }

    io.read_bytes = bytes_to_mb(read_sectors.saturating_mul(SECTOR_BYTES));
    io.write_bytes = bytes_to_mb(write_sectors.saturating_mul(SECTOR_BYTES));
    io
}

#[cfg(target_os = "linux")]
fn read_disk_io() -> Result<DiskIo, SourceUnavailable> {
    let text = fs::read_to_string("/proc/diskstats")
        .map_err(|err| SourceUnavailable::new(SourceKind::DiskIo, err.to_string()))?;
    Ok(parse_diskstats(&text, is_whole_block_device))
}

#[cfg(target_os = "linux")]
fn is_whole_block_device(name: &str) -> bool {
    const VIRTUAL_PREFIXES: [&str; 4] = ["loop", "ram", "zram", "dm-"];
    if VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    std::path::Path::new("/sys/block").join(name).exists()
}

#[cfg(not(target_os = "linux"))]
fn read_disk_io() -> Result<DiskIo, SourceUnavailable> {
    Err(SourceUnavailable::new(
        SourceKind::DiskIo,
        "block device counters not exposed on this platform",
    ))
}

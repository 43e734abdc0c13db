use crate::collectors::cpu::CpuAdapter;
use crate::collectors::disk::DiskAdapter;
use crate::collectors::gpu::GpuAdapter;
use crate::collectors::memory::MemoryAdapter;
use crate::collectors::network::NetworkAdapter;
use crate::collectors::process::ProcessAdapter;
use crate::collectors::{Source, SourceKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// One point-in-time reading across every source. Built once per tick and
/// never mutated afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuReading,
    pub memory: MemoryReading,
    pub gpu: GpuReading,
    pub disk: DiskReading,
    pub network: NetworkReading,
    pub processes: ProcessRankings,
    /// Sources that degraded during this tick.
    pub unavailable: Vec<SourceKind>,
}

/// Optional hardware temperature. `value` is meaningless unless `available`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Temperature {
    pub available: bool,
    pub value: f64,
    pub unit: &'static str,
}

impl Temperature {
    pub fn celsius(value: f64) -> Self {
        Self {
            available: true,
            value,
            unit: "°C",
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            value: 0.0,
            unit: "°C",
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.available.then_some(self.value)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuReading {
    pub usage: CpuUsage,
    pub temperature: Temperature,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuUsage {
    pub percent: f64,
    pub per_core: Vec<f64>,
    pub frequency: CpuFrequency,
    pub cores: CoreCounts,
}

/// MHz; zero when the platform does not expose the bound.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CpuFrequency {
    pub current: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoreCounts {
    pub logical: usize,
    pub physical: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryReading {
    #[serde(rename = "virtual")]
    pub virtual_memory: VirtualMemory,
    pub swap: SwapMemory,
}

/// Sizes in GB (1024-based, 2 decimals) plus raw byte counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VirtualMemory {
    pub total: f64,
    pub available: f64,
    pub used: f64,
    pub free: f64,
    pub percent: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapMemory {
    pub total: f64,
    pub used: f64,
    pub free: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuSource {
    /// Discrete accelerator driver; load and temperature are real.
    Driver,
    /// Generic display adapter listing; load and temperature are reported as zero.
    DisplayAdapter,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuReading {
    pub available: bool,
    pub source: GpuSource,
    pub count: usize,
    pub gpus: Vec<GpuDevice>,
}

impl GpuReading {
    /// The device session series track.
    pub fn primary(&self) -> Option<&GpuDevice> {
        if self.available {
            self.gpus.first()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuDevice {
    pub id: u32,
    pub name: String,
    pub load_percent: f64,
    /// MB
    pub memory_total: f64,
    /// MB
    pub memory_used: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskReading {
    pub partitions: Vec<Partition>,
    pub io: DiskIo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Partition {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

/// Aggregate block device counters since boot; byte totals in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskIo {
    pub available: bool,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: f64,
    pub write_bytes: f64,
    pub read_time: u64,
    pub write_time: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkReading {
    pub interfaces: BTreeMap<String, InterfaceInfo>,
    pub io_counters: NetIoCounters,
    pub speed: NetSpeed,
    pub connections: ConnectionSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceInfo {
    pub is_up: bool,
    /// Mbit/s as reported by the link; zero when unknown.
    pub speed: u64,
    pub addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAddress {
    /// `link`, `inet` or `inet6`.
    pub family: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetIoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
    pub bytes_sent_formatted: String,
    pub bytes_recv_formatted: String,
}

/// Bytes per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetSpeed {
    pub upload_speed: f64,
    pub download_speed: f64,
    pub upload_speed_formatted: String,
    pub download_speed_formatted: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionSummary {
    pub available: bool,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessRankings {
    pub cpu_top: Vec<ProcessEntry>,
    pub mem_top: Vec<ProcessEntry>,
    pub disk_top: Vec<ProcessEntry>,
    pub net_top: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub value: f64,
}

/// Anything that can produce a full snapshot per tick.
pub trait SnapshotSource: Send + 'static {
    fn assemble(&mut self) -> Snapshot;
}

/// Owns one instance of every adapter and merges their readings.
pub struct SnapshotAssembler {
    cpu: CpuAdapter,
    memory: MemoryAdapter,
    gpu: GpuAdapter,
    disk: DiskAdapter,
    network: NetworkAdapter,
    processes: ProcessAdapter,
}

impl SnapshotAssembler {
    pub fn new(top_processes: usize, command_timeout: Duration) -> Self {
        Self {
            cpu: CpuAdapter::new(),
            memory: MemoryAdapter::new(),
            gpu: GpuAdapter::new(command_timeout),
            disk: DiskAdapter::new(),
            network: NetworkAdapter::new(),
            processes: ProcessAdapter::new(top_processes),
        }
    }
}

impl SnapshotSource for SnapshotAssembler {
    fn assemble(&mut self) -> Snapshot {
        let cpu = self.cpu.sample();
        let memory = self.memory.sample();
        let gpu = self.gpu.sample();
        let disk = self.disk.sample();
        let network = self.network.sample();
        let processes = self.processes.sample();

        let mut unavailable = Vec::new();
        if !cpu.temperature.available {
            unavailable.push(SourceKind::CpuTemperature);
        }
        if !gpu.available {
            unavailable.push(self.gpu.kind());
        }
        if !disk.io.available {
            unavailable.push(SourceKind::DiskIo);
        }
        if !network.connections.available {
            unavailable.push(SourceKind::NetworkConnections);
        }

        Snapshot {
            timestamp: Utc::now(),
            cpu,
            memory,
            gpu,
            disk,
            network,
            processes,
            unavailable,
        }
    }
}

use super::bytes_to_gb;
use super::disk::DiskAdapter;
use crate::snapshot::Partition;
use serde::Serialize;
use sysinfo::{CpuExt, System, SystemExt};

/// Static description of the host, captured when a session finalizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemInfo {
    pub platform: String,
    pub platform_version: String,
    pub kernel_version: String,
    pub architecture: String,
    pub processor: String,
    pub physical_cores: Option<usize>,
    pub logical_cores: usize,
    pub total_ram_gb: f64,
    pub host_name: String,
    pub agent_version: String,
}

impl SystemInfo {
    /// Label/value rows in display order.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Platform", self.platform.clone()),
            ("Platform Version", self.platform_version.clone()),
            ("Kernel", self.kernel_version.clone()),
            ("Architecture", self.architecture.clone()),
            ("Processor", self.processor.clone()),
            (
                "CPU Cores (Physical)",
                self.physical_cores
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            ("CPU Cores (Logical)", self.logical_cores.to_string()),
            ("Total RAM", format!("{:.2} GB", self.total_ram_gb)),
            ("Host Name", self.host_name.clone()),
            ("Agent Version", self.agent_version.clone()),
        ]
    }
}

/// What a session needs from the host at finalization time.
pub trait HostInventory: Send {
    fn disk_partitions(&mut self) -> Vec<Partition>;
    fn system_info(&mut self) -> SystemInfo;
}

pub struct SystemInventory {
    disk: DiskAdapter,
}

impl SystemInventory {
    pub fn new() -> Self {
        Self {
            disk: DiskAdapter::new(),
        }
    }
}

impl Default for SystemInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostInventory for SystemInventory {
    fn disk_partitions(&mut self) -> Vec<Partition> {
        self.disk.partitions()
    }

    fn system_info(&mut self) -> SystemInfo {
        collect_system_info()
    }
}

pub fn collect_system_info() -> SystemInfo {
    let mut system = System::new();
    system.refresh_cpu();
    system.refresh_memory();
    let unknown = || "unknown".to_string();

    SystemInfo {
        platform: system.name().unwrap_or_else(unknown),
        platform_version: system
            .long_os_version()
            .or_else(|| system.os_version())
            .unwrap_or_else(unknown),
        kernel_version: system.kernel_version().unwrap_or_else(unknown),
        architecture: std::env::consts::ARCH.to_string(),
        processor: system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(unknown),
        physical_cores: system.physical_core_count(),
        logical_cores: system.cpus().len(),
        total_ram_gb: bytes_to_gb(system.total_memory()),
        host_name: system.host_name().unwrap_or_else(unknown),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

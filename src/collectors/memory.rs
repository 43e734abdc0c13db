use super::{bytes_to_gb, percent, Source, SourceKind};
use crate::snapshot::{MemoryReading, SwapMemory, VirtualMemory};
use sysinfo::{System, SystemExt};

pub struct MemoryAdapter {
    system: System,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for MemoryAdapter {
    type Reading = MemoryReading;

    fn kind(&self) -> SourceKind {
        SourceKind::Memory
    }

    fn sample(&mut self) -> MemoryReading {
        self.system.refresh_memory();
        memory_reading(
            RawMemory {
                total: self.system.total_memory(),
                available: self.system.available_memory(),
                used: self.system.used_memory(),
                free: self.system.free_memory(),
            },
            RawSwap {
                total: self.system.total_swap(),
                used: self.system.used_swap(),
                free: self.system.free_swap(),
            },
        )
    }
}

/// Byte counts as returned by the OS.
#[derive(Debug, Clone, Copy)]
pub struct RawMemory {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RawSwap {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

pub fn memory_reading(mem: RawMemory, swap: RawSwap) -> MemoryReading {
    MemoryReading {
        virtual_memory: VirtualMemory {
            total: bytes_to_gb(mem.total),
            available: bytes_to_gb(mem.available),
            used: bytes_to_gb(mem.used),
            free: bytes_to_gb(mem.free),
            percent: percent(
                mem.total.saturating_sub(mem.available) as f64,
                mem.total as f64,
            ),
            total_bytes: mem.total,
            used_bytes: mem.used,
        },
        swap: SwapMemory {
            total: bytes_to_gb(swap.total),
            used: bytes_to_gb(swap.used),
            free: bytes_to_gb(swap.free),
            percent: percent(swap.used as f64, swap.total as f64),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn converts_and_computes_percentages() {
        let reading = memory_reading(
            RawMemory {
                total: 16 * GIB,
                available: 4 * GIB,
                used: 10 * GIB,
                free: 2 * GIB,
            },
            RawSwap {
                total: 2 * GIB,
                used: GIB / 2,
                free: GIB + GIB / 2,
            },
        );
        assert_eq!(reading.virtual_memory.total, 16.0);
        assert_eq!(reading.virtual_memory.available, 4.0);
        assert_eq!(reading.virtual_memory.percent, 75.0);
        assert_eq!(reading.virtual_memory.total_bytes, 16 * GIB);
        assert_eq!(reading.swap.used, 0.5);
        assert_eq!(reading.swap.percent, 25.0);
    }

    #[test]
    fn no_swap_is_zero_percent() {
        let reading = memory_reading(
            RawMemory {
                total: GIB,
                available: GIB,
                used: 0,
                free: GIB,
            },
            RawSwap {
                total: 0,
                used: 0,
                free: 0,
            },
        );
        assert_eq!(reading.swap.percent, 0.0);
        assert_eq!(reading.virtual_memory.percent, 0.0);
    }

    #[test]
    fn live_sample_has_total() {
        let mut adapter = MemoryAdapter::new();
        let reading = adapter.sample();
        assert!(reading.virtual_memory.total_bytes > 0);
        assert!((0.0..=100.0).contains(&reading.virtual_memory.percent));
    }
}

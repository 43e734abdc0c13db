use super::command::run_bounded;
use super::{parse_f64_loose, Source, SourceKind, SourceUnavailable};
use crate::snapshot::{GpuDevice, GpuReading, GpuSource};
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::debug;

type GpuProbe = Box<dyn FnMut() -> Result<Vec<GpuDevice>, SourceUnavailable> + Send>;

/// Discrete accelerator driver first, generic display adapters second.
///
/// The fallback knows names and memory sizes only; its load and temperature
/// are zero and the reading says so through `source`.
pub struct GpuAdapter {
    driver: GpuProbe,
    display: GpuProbe,
}

impl GpuAdapter {
    pub fn new(command_timeout: Duration) -> Self {
        Self::with_probes(
            Box::new(move || query_nvidia_smi(command_timeout)),
            Box::new(move || enumerate_display_adapters(command_timeout)),
        )
    }

    pub fn with_probes(driver: GpuProbe, display: GpuProbe) -> Self {
        Self { driver, display }
    }
}

impl Source for GpuAdapter {
    type Reading = GpuReading;

    fn kind(&self) -> SourceKind {
        SourceKind::Gpu
    }

    fn sample(&mut self) -> GpuReading {
        match (self.driver)() {
            Ok(gpus) if !gpus.is_empty() => return reading(GpuSource::Driver, gpus),
            Ok(_) => debug!("gpu driver query returned no devices"),
            Err(err) => debug!(error = %err, "gpu driver query degraded"),
        }

        match (self.display)() {
            Ok(gpus) if !gpus.is_empty() => reading(GpuSource::DisplayAdapter, gpus),
            Ok(_) => GpuReading::default(),
            Err(err) => {
                debug!(error = %err, "display adapter enumeration degraded");
                GpuReading::default()
            }
        }
    }
}

fn reading(source: GpuSource, gpus: Vec<GpuDevice>) -> GpuReading {
    GpuReading {
        available: true,
        source,
        count: gpus.len(),
        gpus,
    }
}

fn query_nvidia_smi(timeout: Duration) -> Result<Vec<GpuDevice>, SourceUnavailable> {
    let text = run_bounded(
        SourceKind::Gpu,
        "nvidia-smi",
        &[
            "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu",
            "--format=csv,noheader,nounits",
        ],
        timeout,
    )?;
    Ok(parse_nvidia_smi(&text))
}

/// `index, name, utilization.gpu, memory.used, memory.total, temperature.gpu`
pub fn parse_nvidia_smi(text: &str) -> Vec<GpuDevice> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
            if parts.len() < 6 {
                return None;
            }
            Some(GpuDevice {
                id: parts[0].parse().ok()?,
                name: parts[1].to_string(),
                load_percent: parse_f64_loose(parts[2]).unwrap_or(0.0),
                memory_used: parse_f64_loose(parts[3]).unwrap_or(0.0),
                memory_total: parse_f64_loose(parts[4]).unwrap_or(0.0),
                temperature: parse_f64_loose(parts[5]).unwrap_or(0.0),
            })
        })
        .collect()
}

fn is_virtual_adapter(name: &str) -> bool {
    name.contains("Remote") || name.contains("Virtual")
}

/// `wmic ... /format:csv` output: `Node,AdapterRAM,Name`.
pub fn parse_video_controllers_csv(text: &str) -> Vec<GpuDevice> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Node,"))
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',');
            let _node = parts.next()?;
            let ram = parts.next()?.trim();
            let name = parts.next()?.trim();
            if name.is_empty() || is_virtual_adapter(name) {
                return None;
            }
            let ram_mb = ram
                .parse::<u64>()
                .map(|b| b as f64 / (1024.0 * 1024.0))
                .unwrap_or(0.0);
            Some((name.to_string(), ram_mb))
        })
        .enumerate()
        .map(|(i, (name, memory_total))| GpuDevice {
            id: i as u32,
            name,
            memory_total,
            ..GpuDevice::default()
        })
        .collect()
}

pub fn pci_vendor_name(vendor_id: &str) -> &'static str {
    match vendor_id.trim().to_ascii_lowercase().as_str() {
        "0x10de" => "NVIDIA",
        "0x1002" => "AMD",
        "0x8086" => "Intel",
        "0x1af4" => "Virtio",
        "0x15ad" => "VMware",
        _ => "Unknown",
    }
}

#[cfg(target_os = "linux")]
fn enumerate_display_adapters(_timeout: Duration) -> Result<Vec<GpuDevice>, SourceUnavailable> {
    let entries = fs::read_dir("/sys/class/drm")
        .map_err(|err| SourceUnavailable::new(SourceKind::Gpu, format!("/sys/class/drm: {err}")))?;

    let mut cards: Vec<(u32, std::path::PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let index = name.strip_prefix("card")?.parse::<u32>().ok()?;
            Some((index, entry.path().join("device")))
        })
        .collect();
    cards.sort_by_key(|(index, _)| *index);

    let mut out = Vec::new();
    for (index, device) in cards {
        let read = |attr: &str| fs::read_to_string(device.join(attr)).ok();
        let Some(vendor) = read("vendor") else {
            continue;
        };
        let vendor_name = pci_vendor_name(&vendor);
        if vendor_name == "Virtio" {
            continue;
        }
        let device_id = read("device").map(|d| d.trim().to_string()).unwrap_or_default();
        let memory_total = read("mem_info_vram_total")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|b| b as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        out.push(GpuDevice {
            id: index,
            name: format!("{vendor_name} display adapter {device_id}").trim().to_string(),
            memory_total,
            ..GpuDevice::default()
        });
    }
    Ok(out)
}

#[cfg(target_os = "windows")]
fn enumerate_display_adapters(timeout: Duration) -> Result<Vec<GpuDevice>, SourceUnavailable> {
    let text = run_bounded(
        SourceKind::Gpu,
        "wmic",
        &["path", "Win32_VideoController", "get", "AdapterRAM,Name", "/format:csv"],
        timeout,
    )?;
    Ok(parse_video_controllers_csv(&text))
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn enumerate_display_adapters(_timeout: Duration) -> Result<Vec<GpuDevice>, SourceUnavailable> {
    Err(SourceUnavailable::new(
        SourceKind::Gpu,
        "display adapter enumeration not supported on this platform",
    ))
}

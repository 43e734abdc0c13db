use super::{round_to, Source, SourceKind, SourceUnavailable};
use crate::snapshot::{CoreCounts, CpuFrequency, CpuReading, CpuUsage, Temperature};
#[cfg(target_os = "linux")]
use std::fs;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};
use tracing::debug;

const CPU_SENSOR_MARKERS: [&str; 7] = [
    "coretemp", "k10temp", "package", "tctl", "tdie", "cpu", "core",
];
const GPU_SENSOR_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

/// Aggregate and per-core load, frequency bounds, core counts and package
/// temperature.
///
/// Usage is computed by sysinfo against the previous refresh, so the first
/// refresh happens at construction and every later `sample` is non-blocking.
pub struct CpuAdapter {
    system: System,
    frequency_bounds: (f64, f64),
    physical_cores: Option<usize>,
}

impl CpuAdapter {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_components_list();
        let physical_cores = system.physical_core_count();
        let frequency_bounds = read_frequency_bounds().unwrap_or_else(|err| {
            debug!(error = %err, "cpu frequency bounds not exposed");
            (0.0, 0.0)
        });

        Self {
            system,
            frequency_bounds,
            physical_cores,
        }
    }

    fn temperature(&mut self) -> Result<f64, SourceUnavailable> {
        self.system.refresh_components();
        let sensors: Vec<(String, f64)> = self
            .system
            .components()
            .iter()
            .map(|c| (c.label().to_string(), c.temperature() as f64))
            .collect();
        pick_cpu_temperature(&sensors).ok_or_else(|| {
            SourceUnavailable::new(
                SourceKind::CpuTemperature,
                format!("no usable sensor among {} components", sensors.len()),
            )
        })
    }
}

impl Default for CpuAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for CpuAdapter {
    type Reading = CpuReading;

    fn kind(&self) -> SourceKind {
        SourceKind::Cpu
    }

    fn sample(&mut self) -> CpuReading {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        let per_core: Vec<f64> = cpus
            .iter()
            .map(|c| round_to(c.cpu_usage() as f64, 1))
            .collect();
        let percent = round_to(self.system.global_cpu_info().cpu_usage() as f64, 1);
        let current = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.frequency() as f64).sum::<f64>() / cpus.len() as f64
        };
        let logical = cpus.len();

        let temperature = match self.temperature() {
            Ok(value) => Temperature::celsius(round_to(value, 1)),
            Err(err) => {
                debug!(error = %err, "cpu temperature degraded");
                Temperature::unavailable()
            }
        };

        CpuReading {
            usage: CpuUsage {
                percent,
                per_core,
                frequency: CpuFrequency {
                    current: round_to(current, 0),
                    min: self.frequency_bounds.0,
                    max: self.frequency_bounds.1,
                },
                cores: CoreCounts {
                    logical,
                    physical: self.physical_cores,
                },
            },
            temperature,
        }
    }
}

/// Prefers package/core sensors, then any non-GPU sensor. Readings outside
/// a plausible silicon range are ignored.
pub fn pick_cpu_temperature(sensors: &[(String, f64)]) -> Option<f64> {
    let plausible = |t: &&(String, f64)| t.1 > 0.0 && t.1 <= 130.0;
    let is_gpu = |label: &str| GPU_SENSOR_MARKERS.iter().any(|m| label.contains(m));

    let primary = sensors
        .iter()
        .filter(plausible)
        .find(|(label, _)| {
            let l = label.to_lowercase();
            !is_gpu(&l) && CPU_SENSOR_MARKERS.iter().any(|m| l.contains(m))
        })
        .map(|(_, v)| *v);
    if primary.is_some() {
        return primary;
    }

    sensors
        .iter()
        .filter(plausible)
        .find(|(label, _)| !is_gpu(&label.to_lowercase()))
        .map(|(_, v)| *v)
}

#[cfg(target_os = "linux")]
fn read_frequency_bounds() -> Result<(f64, f64), SourceUnavailable> {
    let base = "/sys/devices/system/cpu/cpu0/cpufreq";
    let read_khz = |name: &str| -> Result<f64, SourceUnavailable> {
        let raw = fs::read_to_string(format!("{base}/{name}"))
            .map_err(|err| SourceUnavailable::new(SourceKind::Cpu, format!("{name}: {err}")))?;
        raw.trim()
            .parse::<f64>()
            .map(|khz| khz / 1000.0)
            .map_err(|err| SourceUnavailable::new(SourceKind::Cpu, format!("{name}: {err}")))
    };
    Ok((read_khz("cpuinfo_min_freq")?, read_khz("cpuinfo_max_freq")?))
}

#[cfg(not(target_os = "linux"))]
fn read_frequency_bounds() -> Result<(f64, f64), SourceUnavailable> {
    Err(SourceUnavailable::new(
        SourceKind::Cpu,
        "frequency bounds not exposed on this platform",
    ))
}

use crate::collectors::SourceKind;
use crate::session::{FinalizeReason, SessionStatus};
use crate::snapshot::{GpuSource, Snapshot};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub sysreport_ticks_total: Counter,
    pub sysreport_tick_duration_seconds: Gauge,
    pub sysreport_last_tick_timestamp_seconds: Gauge,
    pub sysreport_source_unavailable_total: CounterVec,
    pub sysreport_live_subscribers: Gauge,
    pub sysreport_session_active: Gauge,
    pub sysreport_session_data_points: Gauge,
    pub sysreport_sessions_started_total: Counter,
    pub sysreport_sessions_finalized_total: CounterVec,
    pub sysreport_report_failures_total: Counter,
    pub sysreport_cpu_usage_percent: Gauge,
    pub sysreport_memory_usage_percent: Gauge,
    pub sysreport_net_upload_bytes_per_sec: Gauge,
    pub sysreport_net_download_bytes_per_sec: Gauge,
    pub sysreport_gpu_utilization_percent: GaugeVec,
    pub sysreport_uptime_seconds: Gauge,
    pub sysreport_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let sysreport_ticks_total = Counter::with_opts(opts!(
            "sysreport_ticks_total",
            "Sampling ticks completed by the scheduler"
        ))?;
        let sysreport_tick_duration_seconds = Gauge::with_opts(opts!(
            "sysreport_tick_duration_seconds",
            "Wall time spent assembling the last snapshot"
        ))?;
        let sysreport_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "sysreport_last_tick_timestamp_seconds",
            "Unix time of the last snapshot"
        ))?;
        let sysreport_source_unavailable_total = CounterVec::new(
            opts!(
                "sysreport_source_unavailable_total",
                "Ticks on which a source reported itself unavailable"
            ),
            &["source"],
        )?;
        let sysreport_live_subscribers = Gauge::with_opts(opts!(
            "sysreport_live_subscribers",
            "Connected live-stream clients"
        ))?;
        let sysreport_session_active = Gauge::with_opts(opts!(
            "sysreport_session_active",
            "1 while a monitoring session is recording"
        ))?;
        let sysreport_session_data_points = Gauge::with_opts(opts!(
            "sysreport_session_data_points",
            "Data points in the active session"
        ))?;
        let sysreport_sessions_started_total = Counter::with_opts(opts!(
            "sysreport_sessions_started_total",
            "Monitoring sessions started"
        ))?;
        let sysreport_sessions_finalized_total = CounterVec::new(
            opts!(
                "sysreport_sessions_finalized_total",
                "Monitoring sessions finalized by reason"
            ),
            &["reason"],
        )?;
        let sysreport_report_failures_total = Counter::with_opts(opts!(
            "sysreport_report_failures_total",
            "Finalized sessions whose report could not be written"
        ))?;
        let sysreport_cpu_usage_percent = Gauge::with_opts(opts!(
            "sysreport_cpu_usage_percent",
            "Aggregate CPU usage in percent (0..100)"
        ))?;
        let sysreport_memory_usage_percent = Gauge::with_opts(opts!(
            "sysreport_memory_usage_percent",
            "Virtual memory usage in percent"
        ))?;
        let sysreport_net_upload_bytes_per_sec = Gauge::with_opts(opts!(
            "sysreport_net_upload_bytes_per_sec",
            "Upload speed across all interfaces"
        ))?;
        let sysreport_net_download_bytes_per_sec = Gauge::with_opts(opts!(
            "sysreport_net_download_bytes_per_sec",
            "Download speed across all interfaces"
        ))?;
        let sysreport_gpu_utilization_percent = GaugeVec::new(
            opts!(
                "sysreport_gpu_utilization_percent",
                "GPU utilization in percent (zero when read from display adapters)"
            ),
            &["id", "name", "source"],
        )?;
        let sysreport_uptime_seconds = Gauge::with_opts(opts!(
            "sysreport_uptime_seconds",
            "Seconds since the daemon started"
        ))?;
        let sysreport_scrape_count_total = Counter::with_opts(opts!(
            "sysreport_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &sysreport_ticks_total)?;
        register(&registry, &sysreport_tick_duration_seconds)?;
        register(&registry, &sysreport_last_tick_timestamp_seconds)?;
        register(&registry, &sysreport_source_unavailable_total)?;
        register(&registry, &sysreport_live_subscribers)?;
        register(&registry, &sysreport_session_active)?;
        register(&registry, &sysreport_session_data_points)?;
        register(&registry, &sysreport_sessions_started_total)?;
        register(&registry, &sysreport_sessions_finalized_total)?;
        register(&registry, &sysreport_report_failures_total)?;
        register(&registry, &sysreport_cpu_usage_percent)?;
        register(&registry, &sysreport_memory_usage_percent)?;
        register(&registry, &sysreport_net_upload_bytes_per_sec)?;
        register(&registry, &sysreport_net_download_bytes_per_sec)?;
        register(&registry, &sysreport_gpu_utilization_percent)?;
        register(&registry, &sysreport_uptime_seconds)?;
        register(&registry, &sysreport_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            sysreport_ticks_total,
            sysreport_tick_duration_seconds,
            sysreport_last_tick_timestamp_seconds,
            sysreport_source_unavailable_total,
            sysreport_live_subscribers,
            sysreport_session_active,
            sysreport_session_data_points,
            sysreport_sessions_started_total,
            sysreport_sessions_finalized_total,
            sysreport_report_failures_total,
            sysreport_cpu_usage_percent,
            sysreport_memory_usage_percent,
            sysreport_net_upload_bytes_per_sec,
            sysreport_net_download_bytes_per_sec,
            sysreport_gpu_utilization_percent,
            sysreport_uptime_seconds,
            sysreport_scrape_count_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot, took: Duration) {
        self.sysreport_ticks_total.inc();
        self.sysreport_tick_duration_seconds.set(took.as_secs_f64());
        self.sysreport_last_tick_timestamp_seconds
            .set(snapshot.timestamp.timestamp_millis() as f64 / 1000.0);

        self.sysreport_cpu_usage_percent
            .set(snapshot.cpu.usage.percent);
        self.sysreport_memory_usage_percent
            .set(snapshot.memory.virtual_memory.percent);
        self.sysreport_net_upload_bytes_per_sec
            .set(snapshot.network.speed.upload_speed);
        self.sysreport_net_download_bytes_per_sec
            .set(snapshot.network.speed.download_speed);

        self.sysreport_gpu_utilization_percent.reset();
        let source = match snapshot.gpu.source {
            GpuSource::Driver => "driver",
            GpuSource::DisplayAdapter => "display_adapter",
            GpuSource::None => "none",
        };
        for gpu in &snapshot.gpu.gpus {
            self.sysreport_gpu_utilization_percent
                .with_label_values(&[&gpu.id.to_string(), &gpu.name, source])
                .set(gpu.load_percent);
        }

        for kind in &snapshot.unavailable {
            self.inc_source_unavailable(*kind);
        }
        self.sysreport_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
    }

    pub fn update_session(&self, status: &SessionStatus) {
        self.sysreport_session_active
            .set(if status.active { 1.0 } else { 0.0 });
        self.sysreport_session_data_points
            .set(status.data_points as f64);
    }

    pub fn inc_source_unavailable(&self, kind: SourceKind) {
        self.sysreport_source_unavailable_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_session_started(&self) {
        self.sysreport_sessions_started_total.inc();
    }

    pub fn inc_session_finalized(&self, reason: FinalizeReason, report_ok: bool) {
        self.sysreport_sessions_finalized_total
            .with_label_values(&[reason.as_str()])
            .inc();
        if !report_ok {
            self.sysreport_report_failures_total.inc();
        }
    }

    pub fn set_live_subscribers(&self, count: usize) {
        self.sysreport_live_subscribers.set(count as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.sysreport_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.sysreport_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

use crate::collectors::bytes_to_kb;
use crate::collectors::inventory::{HostInventory, SystemInfo};
use crate::report::{ReportArtifact, ReportError, ReportRenderer};
use crate::snapshot::{GpuSource, Partition, Snapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Series pre-allocation stops here; longer sessions grow on demand.
const MAX_PRESIZED_POINTS: u64 = 3600;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("monitoring already in progress")]
    AlreadyActive,
    #[error("no monitoring in progress")]
    NotActive,
    #[error("failed to generate report: {0}")]
    RendererFailure(#[from] ReportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Stopped,
    DurationElapsed,
}

impl FinalizeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeReason::Stopped => "stopped",
            FinalizeReason::DurationElapsed => "duration_elapsed",
        }
    }
}

/// Time series for one session. Index `i` of every per-tick series is the
/// `i`-th tick after start; temperature and GPU series skip ticks where the
/// source was unavailable.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub started_at: DateTime<Utc>,
    pub cpu_percent: Vec<f64>,
    pub memory_percent: Vec<f64>,
    pub gpu_load: Vec<f64>,
    pub cpu_temp: Vec<f64>,
    pub gpu_temp: Vec<f64>,
    pub network_upload_kbps: Vec<f64>,
    pub network_download_kbps: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub gpu_source: GpuSource,
    pub disk_snapshot: Vec<Partition>,
    pub system_info: Option<SystemInfo>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub finalize_reason: Option<FinalizeReason>,
}

impl SessionRecord {
    fn new(started_at: DateTime<Utc>, expected_points: usize) -> Self {
        Self {
            started_at,
            cpu_percent: Vec::with_capacity(expected_points),
            memory_percent: Vec::with_capacity(expected_points),
            gpu_load: Vec::new(),
            cpu_temp: Vec::new(),
            gpu_temp: Vec::new(),
            network_upload_kbps: Vec::with_capacity(expected_points),
            network_download_kbps: Vec::with_capacity(expected_points),
            timestamps: Vec::with_capacity(expected_points),
            gpu_source: GpuSource::None,
            disk_snapshot: Vec::new(),
            system_info: None,
            finalized_at: None,
            finalize_reason: None,
        }
    }

    pub fn data_points(&self) -> usize {
        self.cpu_percent.len()
    }

    fn append(&mut self, snapshot: &Snapshot) {
        self.cpu_percent.push(snapshot.cpu.usage.percent);
        self.memory_percent
            .push(snapshot.memory.virtual_memory.percent);
        self.timestamps.push(snapshot.timestamp);

        if let Some(temp) = snapshot.cpu.temperature.value() {
            self.cpu_temp.push(temp);
        }
        if let Some(gpu) = snapshot.gpu.primary() {
            self.gpu_load.push(gpu.load_percent);
            self.gpu_temp.push(gpu.temperature);
            self.gpu_source = snapshot.gpu.source;
        }

        self.network_upload_kbps
            .push(bytes_to_kb(snapshot.network.speed.upload_speed));
        self.network_download_kbps
            .push(bytes_to_kb(snapshot.network.speed.download_speed));
    }

    fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Read-only view for clients; all zero while idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub elapsed_seconds: f64,
    pub remaining_seconds: f64,
    pub data_points: usize,
}

/// A session that has left `Active`. The record is frozen; the report may
/// still have failed.
#[derive(Debug)]
pub struct Finalization {
    pub record: Arc<SessionRecord>,
    pub reason: FinalizeReason,
    pub report: Result<ReportArtifact, ReportError>,
}

#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    Recorded { data_points: usize },
    Finalized(Finalization),
}

enum SessionState {
    Idle,
    Active(SessionRecord),
}

/// The one active-session state machine of the process.
///
/// Callers serialize `start`, `tick` and `stop` through a single lock, so a
/// session leaves `Active` exactly once whichever path gets there first.
pub struct SessionRecorder {
    state: SessionState,
    duration: Duration,
    inventory: Box<dyn HostInventory>,
    renderer: Arc<dyn ReportRenderer>,
}

impl SessionRecorder {
    pub fn new(
        duration: Duration,
        inventory: Box<dyn HostInventory>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            duration,
            inventory,
            renderer,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        let expected_points = self.duration.as_secs().min(MAX_PRESIZED_POINTS) as usize + 1;
        self.state = SessionState::Active(SessionRecord::new(now, expected_points));
        info!(started_at = %now, duration_secs = self.duration.as_secs(), "monitoring session started");
        Ok(now)
    }

    pub fn tick(&mut self, snapshot: &Snapshot) -> TickOutcome {
        let SessionState::Active(record) = &mut self.state else {
            return TickOutcome::Idle;
        };

        record.append(snapshot);
        if record.elapsed_at(snapshot.timestamp) < self.duration {
            return TickOutcome::Recorded {
                data_points: record.data_points(),
            };
        }

        match self.take_active() {
            Some(record) => TickOutcome::Finalized(self.finalize(
                record,
                snapshot.timestamp,
                FinalizeReason::DurationElapsed,
            )),
            None => TickOutcome::Idle,
        }
    }

    pub fn stop(&mut self, now: DateTime<Utc>) -> Result<Finalization, SessionError> {
        let record = self.take_active().ok_or(SessionError::NotActive)?;
        Ok(self.finalize(record, now, FinalizeReason::Stopped))
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        match &self.state {
            SessionState::Idle => SessionStatus::default(),
            SessionState::Active(record) => {
                let elapsed = record.elapsed_at(now);
                SessionStatus {
                    active: true,
                    elapsed_seconds: elapsed.as_secs_f64(),
                    remaining_seconds: self.duration.saturating_sub(elapsed).as_secs_f64(),
                    data_points: record.data_points(),
                }
            }
        }
    }

    fn take_active(&mut self) -> Option<SessionRecord> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Active(record) => Some(record),
            SessionState::Idle => None,
        }
    }

    fn finalize(
        &mut self,
        mut record: SessionRecord,
        at: DateTime<Utc>,
        reason: FinalizeReason,
    ) -> Finalization {
        record.disk_snapshot = self.inventory.disk_partitions();
        record.system_info = Some(self.inventory.system_info());
        record.finalized_at = Some(at);
        record.finalize_reason = Some(reason);
        let record = Arc::new(record);

        let minutes = self.duration.as_secs().div_ceil(60);
        let report = self.renderer.render(&record, minutes);
        match &report {
            Ok(artifact) => info!(
                reason = reason.as_str(),
                data_points = record.data_points(),
                report = %artifact.path.display(),
                "monitoring session finalized"
            ),
            Err(err) => error!(
                reason = reason.as_str(),
                data_points = record.data_points(),
                error = %err,
                "monitoring session finalized without report"
            ),
        }

        Finalization {
            record,
            reason,
            report,
        }
    }
}

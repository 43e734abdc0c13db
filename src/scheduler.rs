use crate::metrics::Metrics;
use crate::session::{SessionStatus, TickOutcome};
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::state::{LiveFrame, LiveHub, SharedRecorder};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The one sampling loop of the process.
///
/// Each tick assembles a snapshot off the async runtime, feeds it to the
/// session recorder and publishes one frame to every live subscriber. The
/// next tick starts `period` after the previous one finished.
pub struct Scheduler<S: SnapshotSource> {
    source: Arc<Mutex<S>>,
    period: Duration,
    hub: Arc<LiveHub>,
    recorder: SharedRecorder,
    metrics: Arc<Metrics>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<S: SnapshotSource> Scheduler<S> {
    pub fn new(
        source: S,
        period: Duration,
        hub: Arc<LiveHub>,
        recorder: SharedRecorder,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            period,
            hub,
            recorder,
            metrics,
            last_timestamp: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(period_ms = self.period.as_millis() as u64, "sampling loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping sampling loop");
                    break;
                }
                _ = tokio::time::sleep(self.period) => {}
            }
        }
    }

    /// Runs one tick. Returns false when the snapshot could not be produced.
    pub async fn tick(&mut self) -> bool {
        let started = Instant::now();
        let source = self.source.clone();
        let snapshot = match tokio::task::spawn_blocking(move || {
            source
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .assemble()
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(error = %err, "snapshot assembly aborted, skipping tick");
                return false;
            }
        };
        let snapshot = self.clamp_timestamp(snapshot);
        self.metrics.update_from_snapshot(&snapshot, started.elapsed());
        if !snapshot.unavailable.is_empty() {
            debug!(unavailable = ?snapshot.unavailable, "degraded snapshot");
        }

        // Finalization may write a report, so the recorder is driven from
        // the blocking pool.
        let recorder = self.recorder.clone();
        let recorded = tokio::task::spawn_blocking(move || {
            let mut recorder = recorder.blocking_lock();
            let outcome = recorder.tick(&snapshot);
            let status = recorder.status(snapshot.timestamp);
            (snapshot, outcome, status)
        })
        .await;
        let (snapshot, outcome, status) = match recorded {
            Ok(recorded) => recorded,
            Err(err) => {
                error!(error = %err, "session recorder tick aborted");
                return false;
            }
        };

        self.metrics.update_session(&status);
        self.hub.publish(frame(snapshot, status, outcome, &self.metrics)).await;
        self.metrics.set_live_subscribers(self.hub.subscriber_count());
        true
    }

    fn clamp_timestamp(&mut self, mut snapshot: Snapshot) -> Snapshot {
        if let Some(last) = self.last_timestamp {
            if snapshot.timestamp < last {
                warn!(
                    timestamp = %snapshot.timestamp,
                    previous = %last,
                    "wall clock stepped backwards, holding previous timestamp"
                );
                snapshot.timestamp = last;
            }
        }
        self.last_timestamp = Some(snapshot.timestamp);
        snapshot
    }
}

fn frame(
    snapshot: Snapshot,
    status: SessionStatus,
    outcome: TickOutcome,
    metrics: &Metrics,
) -> LiveFrame {
    let mut frame = LiveFrame::new(snapshot, status);
    if let TickOutcome::Finalized(fin) = outcome {
        metrics.inc_session_finalized(fin.reason, fin.report.is_ok());
        frame.monitoring_complete = true;
        match fin.report {
            Ok(artifact) => frame.report_path = Some(artifact.path.display().to_string()),
            Err(err) => frame.report_error = Some(err.to_string()),
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::inventory::{HostInventory, SystemInfo};
    use crate::http::build_router;
    use crate::report::{
        HtmlReportRenderer, ReportArtifact, ReportError, ReportRenderer, ReportStore,
    };
    use crate::session::{SessionRecord, SessionRecorder};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;
    use crate::snapshot::Partition;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct ScriptedSource {
        offsets: Vec<i64>,
        next: usize,
    }

    impl SnapshotSource for ScriptedSource {
        fn assemble(&mut self) -> Snapshot {
            let offset = self.offsets[self.next.min(self.offsets.len() - 1)];
            self.next += 1;
            let mut snapshot = Snapshot {
                timestamp: base() + chrono::Duration::seconds(offset),
                ..Snapshot::default()
            };
            snapshot.cpu.usage.percent = 25.0;
            snapshot
        }
    }

    struct NoInventory;

    impl HostInventory for NoInventory {
        fn disk_partitions(&mut self) -> Vec<Partition> {
            Vec::new()
        }

        fn system_info(&mut self) -> SystemInfo {
            SystemInfo::default()
        }
    }

    #[derive(Default)]
    struct CountingRenderer {
        calls: AtomicUsize,
    }

    impl ReportRenderer for CountingRenderer {
        fn render(
            &self,
            _record: &SessionRecord,
            _duration_minutes: u64,
        ) -> Result<ReportArtifact, ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReportArtifact {
                filename: "system_report_20240101_120002.html".to_string(),
                path: PathBuf::from("/tmp/system_report_20240101_120002.html"),
                size_bytes: 1,
            })
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn scheduler(offsets: Vec<i64>, reports: &TempDir) -> Scheduler<ScriptedSource> {
        let renderer = Arc::new(HtmlReportRenderer::new(ReportStore::new(reports.path())));
        let recorder = SessionRecorder::new(Duration::from_secs(2), Box::new(NoInventory), renderer);
        Scheduler::new(
            ScriptedSource { offsets, next: 0 },
            Duration::from_millis(5),
            Arc::new(LiveHub::new(8)),
            Arc::new(tokio::sync::Mutex::new(recorder)),
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let reports = TempDir::new().unwrap();
        let mut sched = scheduler(vec![10, 5, 12], &reports);
        let mut rx = sched.hub.subscribe();

        let mut seen = Vec::new();
        for _ in 0..3 {
            assert!(sched.tick().await);
            seen.push(rx.recv().await.unwrap().snapshot.timestamp);
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen[1], seen[0]);
    }

    #[tokio::test]
    async fn auto_finalization_is_announced_once() {
        let reports = TempDir::new().unwrap();
        let mut sched = scheduler(vec![1, 2, 3], &reports);
        sched.recorder.lock().await.start(base()).unwrap();
        let mut rx = sched.hub.subscribe();

        sched.tick().await;
        let first = rx.recv().await.unwrap();
        assert!(first.monitoring.active);
        assert_eq!(first.monitoring.data_points, 1);
        assert!(!first.monitoring_complete);

        sched.tick().await;
        let second = rx.recv().await.unwrap();
        assert!(second.monitoring_complete);
        assert!(!second.monitoring.active);
        let path = second.report_path.clone().unwrap();
        assert!(path.ends_with("system_report_20240101_120002.html"));
        assert!(std::path::Path::new(&path).is_file());

        sched.tick().await;
        let third = rx.recv().await.unwrap();
        assert!(!third.monitoring_complete);
        assert_eq!(third.monitoring, SessionStatus::default());
        assert_eq!(
            sched
                .metrics
                .sysreport_sessions_finalized_total
                .with_label_values(&["duration_elapsed"])
                .get(),
            1.0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_racing_boundary_tick_finalizes_once() {
        for _ in 0..25 {
            let reports = TempDir::new().unwrap();
            let renderer = Arc::new(CountingRenderer::default());
            let recorder = Arc::new(tokio::sync::Mutex::new(SessionRecorder::new(
                Duration::from_secs(2),
                Box::new(NoInventory),
                renderer.clone(),
            )));
            let hub = Arc::new(LiveHub::new(8));
            let metrics = Metrics::new().unwrap();
            let mut sched = Scheduler::new(
                ScriptedSource {
                    offsets: vec![2],
                    next: 0,
                },
                Duration::from_millis(5),
                hub.clone(),
                recorder.clone(),
                metrics.clone(),
            );
            let app = build_router(AppState {
                hub: hub.clone(),
                recorder: recorder.clone(),
                reports: ReportStore::new(reports.path()),
                metrics,
            });
            recorder.lock().await.start(base()).unwrap();
            let mut rx = hub.subscribe();

            let stop = app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stop-monitoring")
                    .body(Body::empty())
                    .unwrap(),
            );
            let (ticked, stopped) = tokio::join!(sched.tick(), stop);
            assert!(ticked);
            let stopped = stopped.unwrap().status();
            let frame = rx.recv().await.unwrap();

            assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
            assert!(!recorder.lock().await.is_active());
            if stopped == StatusCode::OK {
                assert!(!frame.monitoring_complete);
            } else {
                assert_eq!(stopped, StatusCode::BAD_REQUEST);
                assert!(frame.monitoring_complete);
            }
        }
    }

    #[tokio::test]
    async fn subscriber_disconnect_does_not_stop_the_loop() {
        let reports = TempDir::new().unwrap();
        let mut sched = scheduler(vec![1, 2, 3, 4], &reports);
        let dropped = sched.hub.subscribe();
        let mut kept = sched.hub.subscribe();
        drop(dropped);

        assert!(sched.tick().await);
        assert!(sched.tick().await);
        assert!(kept.recv().await.is_ok());
        assert!(kept.recv().await.is_ok());
        assert_eq!(sched.metrics.sysreport_live_subscribers.get(), 1.0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let reports = TempDir::new().unwrap();
        let sched = scheduler(vec![1, 2, 3], &reports);
        let hub = sched.hub.clone();
        let metrics = sched.metrics.clone();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(sched.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(metrics.sysreport_ticks_total.get() >= 1.0);
        assert!(hub.latest().await.is_some());
    }
}

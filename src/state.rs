use crate::metrics::Metrics;
use crate::report::ReportStore;
use crate::session::{SessionRecorder, SessionStatus};
use crate::snapshot::Snapshot;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

pub type SharedRecorder = Arc<Mutex<SessionRecorder>>;

/// What every live client receives once per tick.
#[derive(Debug, Clone, Serialize)]
pub struct LiveFrame {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub monitoring: SessionStatus,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub monitoring_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_error: Option<String>,
}

impl LiveFrame {
    pub fn new(snapshot: Snapshot, monitoring: SessionStatus) -> Self {
        Self {
            snapshot,
            monitoring,
            monitoring_complete: false,
            report_path: None,
            report_error: None,
        }
    }
}

/// Fan-out point between the scheduler and its subscribers. The newest
/// frame is also kept for request/response readers.
pub struct LiveHub {
    sender: broadcast::Sender<Arc<LiveFrame>>,
    latest: RwLock<Option<Arc<LiveFrame>>>,
}

impl LiveHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            latest: RwLock::new(None),
        }
    }

    pub async fn publish(&self, frame: LiveFrame) {
        let frame = Arc::new(frame);
        *self.latest.write().await = Some(frame.clone());
        // No subscribers is fine.
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LiveFrame>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub async fn latest(&self) -> Option<Arc<LiveFrame>> {
        self.latest.read().await.clone()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<LiveHub>,
    pub recorder: SharedRecorder,
    pub reports: ReportStore,
    pub metrics: Arc<Metrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers_and_latest() {
        let hub = LiveHub::new(4);
        assert!(hub.latest().await.is_none());

        let mut rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        hub.publish(LiveFrame::new(Snapshot::default(), SessionStatus::default()))
            .await;

        let frame = rx.recv().await.unwrap();
        assert!(!frame.monitoring.active);
        assert!(hub.latest().await.is_some());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let hub = LiveHub::new(1);
        hub.publish(LiveFrame::new(Snapshot::default(), SessionStatus::default()))
            .await;
        assert!(hub.latest().await.is_some());
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let hub = LiveHub::new(2);
        let mut rx = hub.subscribe();
        for _ in 0..5 {
            hub.publish(LiveFrame::new(Snapshot::default(), SessionStatus::default()))
                .await;
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn frame_flattens_snapshot_and_omits_completion_fields() {
        let frame = LiveFrame::new(Snapshot::default(), SessionStatus::default());
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("cpu").is_some());
        assert!(value.get("timestamp").is_some());
        assert_eq!(value["monitoring"]["active"], false);
        assert!(value.get("monitoring_complete").is_none());
        assert!(value.get("report_path").is_none());
    }
}

use crate::collectors::inventory::{collect_system_info, SystemInfo};
use crate::error::{ApiError, ApiResult};
use crate::report::{REPORT_CONTENT_TYPE, REPORT_FORMAT};
use crate::session::{SessionError, SessionStatus};
use crate::snapshot::Snapshot;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/system-info", get(system_info_handler))
        .route("/api/start-monitoring", post(start_monitoring))
        .route("/api/stop-monitoring", post(stop_monitoring))
        .route("/api/monitoring-status", get(monitoring_status))
        .route("/api/reports", get(list_reports))
        .route("/api/download-report/:filename", get(download_report))
        .route("/ws", get(live_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn status_handler(State(state): State<AppState>) -> ApiResult<Json<Snapshot>> {
    match state.hub.latest().await {
        Some(frame) => Ok(Json(frame.snapshot.clone())),
        None => Err(ApiError::service_unavailable("no snapshot collected yet")),
    }
}

async fn system_info_handler() -> ApiResult<Json<SystemInfo>> {
    tokio::task::spawn_blocking(collect_system_info)
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(format!("system info collection aborted: {err}")))
}

async fn start_monitoring(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let started_at = {
        let mut recorder = state.recorder.lock().await;
        let started_at = recorder.start(Utc::now())?;
        state.metrics.update_session(&recorder.status(started_at));
        started_at
    };
    state.metrics.inc_session_started();
    Ok(Json(json!({
        "status": "monitoring_started",
        "start_time": started_at,
    })))
}

async fn stop_monitoring(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let recorder = state.recorder.clone();
    let finalization = tokio::task::spawn_blocking(move || recorder.blocking_lock().stop(Utc::now()))
        .await
        .map_err(|err| ApiError::internal(format!("session stop aborted: {err}")))??;

    state
        .metrics
        .inc_session_finalized(finalization.reason, finalization.report.is_ok());
    state.metrics.update_session(&SessionStatus::default());

    let data_points = finalization.record.data_points();
    let artifact = finalization.report.map_err(SessionError::RendererFailure)?;
    Ok(Json(json!({
        "status": "monitoring_stopped",
        "report_path": artifact.path.display().to_string(),
        "filename": artifact.filename,
        "format": REPORT_FORMAT,
        "data_points": data_points,
    })))
}

async fn monitoring_status(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.recorder.lock().await.status(Utc::now()))
}

async fn list_reports(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let store = state.reports.clone();
    let reports = tokio::task::spawn_blocking(move || store.list())
        .await
        .map_err(|err| ApiError::internal(format!("report listing aborted: {err}")))??;
    Ok(Json(json!({ "reports": reports })))
}

async fn download_report(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    let path = state.reports.resolve(&filename)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| ApiError::internal(format!("{}: {err}", path.display())))?;

    let mut response = Response::new(Body::from(bytes));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(REPORT_CONTENT_TYPE),
    );
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        response.headers_mut().insert(CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}

async fn live_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| live_socket(socket, state))
}

async fn live_socket(mut socket: WebSocket, state: AppState) {
    let mut frames = state.hub.subscribe();
    state.metrics.set_live_subscribers(state.hub.subscriber_count());
    debug!("live client connected");

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    let text = match serde_json::to_string(&*frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode live frame");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "live client lagging, frames skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    drop(frames);
    state.metrics.set_live_subscribers(state.hub.subscriber_count());
    debug!("live client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::inventory::SystemInventory;
    use crate::metrics::Metrics;
    use crate::report::{HtmlReportRenderer, ReportStore};
    use crate::session::SessionRecorder;
    use crate::state::{LiveFrame, LiveHub};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app_state(dir: &TempDir) -> AppState {
        let reports = ReportStore::new(dir.path());
        let renderer = Arc::new(HtmlReportRenderer::new(reports.clone()));
        let recorder = SessionRecorder::new(
            Duration::from_secs(300),
            Box::new(SystemInventory::new()),
            renderer,
        );
        AppState {
            hub: Arc::new(LiveHub::new(4)),
            recorder: Arc::new(tokio::sync::Mutex::new(recorder)),
            reports,
            metrics: Metrics::new().unwrap(),
        }
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(build_router(app_state(&dir)), "GET", "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(build_router(app_state(&dir)), "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("sysreport_uptime_seconds"));
        assert!(body.contains("sysreport_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn idle_monitoring_status_is_zero() {
        let dir = TempDir::new().unwrap();
        let (status, body) =
            call(build_router(app_state(&dir)), "GET", "/api/monitoring-status").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["active"], false);
        assert_eq!(value["elapsed_seconds"], 0.0);
        assert_eq!(value["remaining_seconds"], 0.0);
        assert_eq!(value["data_points"], 0);
    }

    #[tokio::test]
    async fn second_start_conflicts() {
        let dir = TempDir::new().unwrap();
        let app = build_router(app_state(&dir));

        let (status, body) = call(app.clone(), "POST", "/api/start-monitoring").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("monitoring_started"));

        let (status, body) = call(app.clone(), "POST", "/api/start-monitoring").await;
        assert_eq!(status, StatusCode::CONFLICT);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"], "conflict");
        assert_eq!(value["message"], "monitoring already in progress");

        let (_, body) = call(app, "GET", "/api/monitoring-status").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["active"], true);
    }

    #[tokio::test]
    async fn stop_when_idle_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let (status, body) =
            call(build_router(app_state(&dir)), "POST", "/api/stop-monitoring").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("no monitoring in progress"));
    }

    #[tokio::test]
    async fn stop_writes_a_downloadable_report() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        let app = build_router(state.clone());

        call(app.clone(), "POST", "/api/start-monitoring").await;
        let (status, body) = call(app.clone(), "POST", "/api/stop-monitoring").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "monitoring_stopped");
        assert_eq!(value["data_points"], 0);
        assert_eq!(value["format"], "html");
        let filename = value["filename"].as_str().unwrap().to_string();
        assert!(filename.starts_with("system_report_"));

        let (status, body) = call(app.clone(), "GET", "/api/reports").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(&filename));

        let (status, body) = call(
            app.clone(),
            "GET",
            &format!("/api/download-report/{filename}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.contains("HTML report"));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/download-report/{filename}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );

        assert_eq!(
            state
                .metrics
                .sysreport_sessions_finalized_total
                .with_label_values(&["stopped"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn download_rejects_traversal_and_unknown_names() {
        let dir = TempDir::new().unwrap();
        let app = build_router(app_state(&dir));

        let (status, _) = call(app.clone(), "GET", "/api/download-report/..secret").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app.clone(), "GET", "/api/download-report/..%2F..%2Fetc%2Fpasswd").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(
            app,
            "GET",
            "/api/download-report/system_report_20240101_000000.html",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_status_serves_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        let app = build_router(state.clone());

        let (status, _) = call(app.clone(), "GET", "/api/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state
            .hub
            .publish(LiveFrame::new(Snapshot::default(), SessionStatus::default()))
            .await;
        let (status, body) = call(app, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert!(value.get("cpu").is_some());
        assert!(value.get("monitoring").is_none());
    }

    #[tokio::test]
    async fn system_info_reports_cores() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(build_router(app_state(&dir)), "GET", "/api/system-info").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert!(value["logical_cores"].as_u64().unwrap() > 0);
    }
}

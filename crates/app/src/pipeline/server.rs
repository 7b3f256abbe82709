//! Actix Web API server exposing the command surface and the push streams.
//!
//! The server runs on a dedicated thread so the camera workers never share a
//! runtime with request handling. The four logical push channels (live-feed,
//! alerts, analysis, system) are served as SSE streams; commands and
//! acknowledgements travel over the REST surface.

use std::sync::Arc;
use std::time::Duration;

use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use async_stream::stream;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::error;
use uuid::Uuid;

use crate::pipeline::data::{AlertSeverity, CameraScope, DirectiveKind, DirectiveStatus};
use crate::pipeline::directives::{
    directive_from_command, parse_command_text, ParsedCommand, SharedRegistry,
};
use crate::pipeline::dispatch::{AlertDispatcher, StreamHub, Subscription};
use crate::pipeline::supervisor::Supervisor;

/// Poll cadence for draining subscriber queues into SSE responses.
const STREAM_POLL_MS: u64 = 250;

/// Page cap for the alert query endpoint.
const MAX_ALERT_PAGE: usize = 200;

#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    pub registry: SharedRegistry,
    pub alerts: Arc<AlertDispatcher>,
    pub live: Arc<StreamHub>,
    pub analysis: Arc<StreamHub>,
    pub system: Arc<StreamHub>,
    pub metrics: PrometheusHandle,
    pub started_at: DateTime<Utc>,
}

/// Handle for the API server thread.
pub struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the API server thread and return a handle that can stop it.
pub fn spawn_api_server(state: ApiState, host: String, port: u16) -> Result<ApiServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("argus-api-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(state.clone()))
                        .route("/", web::get().to(root))
                        .route("/directives", web::post().to(create_directive))
                        .route("/directives", web::get().to(list_directives))
                        .route("/directives/{id}", web::delete().to(delete_directive))
                        .route("/cameras", web::get().to(list_cameras))
                        .route("/cameras/{id}/start", web::post().to(start_camera))
                        .route("/cameras/{id}/stop", web::post().to(stop_camera))
                        .route("/alerts", web::get().to(query_alerts))
                        .route(
                            "/alerts/{id}/acknowledge",
                            web::post().to(acknowledge_alert),
                        )
                        .route("/system/health", web::get().to(health))
                        .route("/stats/summary", web::get().to(stats_summary))
                        .route("/metrics", web::get().to(metrics_endpoint))
                        .route("/stream/live-feed", web::get().to(stream_live_feed))
                        .route("/stream/alerts", web::get().to(stream_alerts))
                        .route("/stream/analysis", web::get().to(stream_analysis))
                        .route("/stream/system", web::get().to(stream_system))
                })
                .bind((host.as_str(), port))?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("API server error: {err}");
            }
        })
        .context("Failed to spawn API server thread")?;
    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn json_error(status: actix_web::http::StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "error": message }))
}

// ── Command surface ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DirectiveRequest {
    text: Option<String>,
    /// Pre-parsed form supplied by an external command parser.
    kind: Option<DirectiveKind>,
    target: Option<String>,
    requires_baseline: Option<bool>,
    camera_scope: Option<CameraScope>,
}

async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "name": "argus surveillance pipeline",
        "status": "running",
    }))
}

async fn create_directive(
    state: web::Data<ApiState>,
    body: web::Json<DirectiveRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let scope = request.camera_scope.unwrap_or(CameraScope::All);

    let parsed = match (request.kind, request.target, request.text) {
        (Some(kind), Some(target), _) => ParsedCommand { kind, target },
        (_, _, Some(text)) if !text.trim().is_empty() => parse_command_text(&text),
        _ => {
            return json_error(
                actix_web::http::StatusCode::BAD_REQUEST,
                "either text or kind+target is required",
            )
        }
    };

    let mut directive = directive_from_command(parsed, scope);
    if let Some(requires_baseline) = request.requires_baseline {
        directive.requires_baseline = requires_baseline;
    }

    let kind = directive.kind;
    let target = directive.target.clone();
    let requires_baseline = directive.requires_baseline;
    let outcome = state.supervisor.process_directive(directive);

    HttpResponse::Ok().json(json!({
        "directive_id": outcome.directive_id,
        "kind": kind,
        "target": target,
        "requires_baseline": requires_baseline,
        "action": outcome.action,
        "started_cameras": outcome.started_cameras,
    }))
}

async fn list_directives(state: web::Data<ApiState>) -> HttpResponse {
    let directives: Vec<_> = state
        .registry
        .list_all()
        .into_iter()
        .filter(|d| d.status == DirectiveStatus::Active)
        .collect();
    HttpResponse::Ok().json(directives)
}

async fn delete_directive(state: web::Data<ApiState>, path: web::Path<Uuid>) -> HttpResponse {
    if state.supervisor.remove_directive(path.into_inner()) {
        HttpResponse::NoContent().finish()
    } else {
        json_error(actix_web::http::StatusCode::NOT_FOUND, "unknown directive")
    }
}

// ── Cameras ──────────────────────────────────────────────────────────────────

async fn list_cameras(state: web::Data<ApiState>) -> HttpResponse {
    HttpResponse::Ok().json(state.supervisor.camera_states())
}

async fn start_camera(state: web::Data<ApiState>, path: web::Path<u32>) -> HttpResponse {
    let camera_id = path.into_inner();
    match state.supervisor.start_camera(camera_id, false) {
        Ok(camera_state) => {
            HttpResponse::Ok().json(json!({ "camera_id": camera_id, "state": camera_state }))
        }
        Err(_) => json_error(actix_web::http::StatusCode::NOT_FOUND, "unknown camera"),
    }
}

async fn stop_camera(state: web::Data<ApiState>, path: web::Path<u32>) -> HttpResponse {
    let camera_id = path.into_inner();
    match state.supervisor.stop_camera(camera_id) {
        Ok(camera_state) => {
            HttpResponse::Ok().json(json!({ "camera_id": camera_id, "state": camera_state }))
        }
        Err(_) => json_error(actix_web::http::StatusCode::NOT_FOUND, "unknown camera"),
    }
}

// ── Alerts ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AlertQuery {
    since: Option<String>,
    severity: Option<String>,
    limit: Option<usize>,
}

async fn query_alerts(state: web::Data<ApiState>, query: web::Query<AlertQuery>) -> HttpResponse {
    let since = match &query.since {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(_) => {
                return json_error(
                    actix_web::http::StatusCode::BAD_REQUEST,
                    "since must be an RFC 3339 timestamp",
                )
            }
        },
        None => None,
    };

    let severity = match &query.severity {
        Some(raw) => match parse_severity(raw) {
            Some(severity) => Some(severity),
            None => {
                return json_error(
                    actix_web::http::StatusCode::BAD_REQUEST,
                    "severity must be one of CRITICAL, WARNING, INFO, SYSTEM",
                )
            }
        },
        None => None,
    };

    let limit = query.limit.unwrap_or(50).clamp(1, MAX_ALERT_PAGE);
    HttpResponse::Ok().json(state.alerts.query(since, severity, limit))
}

fn parse_severity(raw: &str) -> Option<AlertSeverity> {
    match raw.trim().to_uppercase().as_str() {
        "CRITICAL" => Some(AlertSeverity::Critical),
        "WARNING" => Some(AlertSeverity::Warning),
        "INFO" => Some(AlertSeverity::Info),
        "SYSTEM" => Some(AlertSeverity::System),
        _ => None,
    }
}

async fn acknowledge_alert(state: web::Data<ApiState>, path: web::Path<Uuid>) -> HttpResponse {
    let alert_id = path.into_inner();
    if state.alerts.acknowledge(alert_id) {
        HttpResponse::Ok().json(json!({ "alert_id": alert_id, "acknowledged": true }))
    } else {
        json_error(actix_web::http::StatusCode::NOT_FOUND, "unknown alert")
    }
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

async fn health(state: web::Data<ApiState>) -> HttpResponse {
    let cameras = state.supervisor.camera_states();
    let active = cameras
        .iter()
        .filter(|c| matches!(c.state, crate::pipeline::worker::CameraState::Running))
        .count();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "active_cameras": active,
        "cameras": cameras,
        "streams": {
            "live-feed": stream_stats(&state.live),
            "alerts": {
                "subscribers": state.alerts.subscriber_count(),
                "dropped": state.alerts.total_dropped(),
            },
            "analysis": stream_stats(&state.analysis),
            "system": stream_stats(&state.system),
        },
    }))
}

fn stream_stats(hub: &StreamHub) -> serde_json::Value {
    json!({
        "subscribers": hub.subscriber_count(),
        "dropped": hub.total_dropped(),
    })
}

#[derive(Deserialize)]
struct StatsQuery {
    hours: Option<i64>,
}

async fn stats_summary(state: web::Data<ApiState>, query: web::Query<StatsQuery>) -> HttpResponse {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 7);
    let since = Utc::now() - chrono::Duration::hours(hours);
    let counts = state.alerts.severity_counts_since(since);

    let mut by_severity = serde_json::Map::new();
    for (severity, count) in counts {
        by_severity.insert(severity.label().to_lowercase(), json!(count));
    }

    HttpResponse::Ok().json(json!({
        "period_hours": hours,
        "alerts": by_severity,
        "active_directives": state.registry.list_all().len(),
    }))
}

async fn metrics_endpoint(state: web::Data<ApiState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.metrics.render())
}

// ── Push streams ─────────────────────────────────────────────────────────────

async fn stream_live_feed(state: web::Data<ApiState>) -> HttpResponse {
    sse_response(state.live.subscribe())
}

async fn stream_alerts(state: web::Data<ApiState>) -> HttpResponse {
    sse_response(state.alerts.subscribe())
}

async fn stream_analysis(state: web::Data<ApiState>) -> HttpResponse {
    sse_response(state.analysis.subscribe())
}

async fn stream_system(state: web::Data<ApiState>) -> HttpResponse {
    sse_response(state.system.subscribe())
}

/// Serve one subscription as a Server-Sent Events stream. The handler polls
/// the subscriber queue; drop-oldest backpressure happens upstream in the
/// hub, so a stalled client only ever loses its own backlog.
fn sse_response(subscription: Subscription) -> HttpResponse {
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 1000\n\n"));
        let mut interval =
            actix_web::rt::time::interval(Duration::from_millis(STREAM_POLL_MS));
        loop {
            interval.tick().await;
            let items = subscription.drain();
            if items.is_empty() {
                yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                continue;
            }
            for item in items {
                match serde_json::to_string(&item) {
                    Ok(payload) => {
                        let mut chunk = String::with_capacity(payload.len() + 16);
                        chunk.push_str("data: ");
                        chunk.push_str(&payload);
                        chunk.push_str("\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                    Err(err) => {
                        let chunk = format!("event: error\ndata: {err}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

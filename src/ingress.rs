use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::PipelineError;
use crate::health::Metrics;
use crate::models::{Event, Platform};
use crate::queue::{MessageQueue, STREAM_EVENTS};
use crate::registry::SessionRegistry;
use crate::store::Store;

/// Compress, wire-encode and append one event to the message queue.
///
/// This is the single enqueue path shared by the HTTP endpoint, the hook
/// relay, the Cursor monitor and the Claude tailer. Failures count as drops
/// for fire-and-forget callers; monitors propagate them instead so their
/// watermarks do not advance past unpublished events.
pub async fn publish_event(
    queue: &Arc<dyn MessageQueue>,
    metrics: &Metrics,
    event: &Event,
) -> Result<(), PipelineError> {
    let fields = codec::encode_wire(event)
        .map_err(|e| PipelineError::Validation(format!("encoding event: {e}")))?;
    match queue.append(STREAM_EVENTS, fields).await {
        Ok(_) => {
            Metrics::incr(&metrics.events_in);
            Ok(())
        }
        Err(e) => {
            Metrics::incr(&metrics.events_dropped);
            Err(e)
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn MessageQueue>,
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
}

#[derive(Deserialize)]
pub struct SubmitBody {
    pub event: SubmitEvent,
    pub platform: String,
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct SubmitEvent {
    pub event_type: String,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(submit_event))
        .route("/health", get(health))
        .layer(middleware::from_fn(require_loopback))
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    info!(port, "event ingress listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

/// The listener binds to 127.0.0.1, but a browser on the same machine could
/// still be lured into posting here cross-origin. Refusing foreign `Host`
/// headers closes that hole.
async fn require_loopback(req: Request<axum::body::Body>, next: Next) -> Response {
    let allowed = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(is_loopback_host)
        .unwrap_or(true);
    if allowed {
        next.run(req).await
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

/// Whether a `Host` header value (possibly carrying a port) names this
/// machine's loopback interface.
fn is_loopback_host(host: &str) -> bool {
    let name = match host.strip_prefix('[') {
        // bracketed IPv6 literal, e.g. [::1]:7845
        Some(rest) => rest.split(']').next().unwrap_or(""),
        None => host.rsplit_once(':').map(|(name, _)| name).unwrap_or(host),
    };
    if name.is_empty() || name == "localhost" || name == "::1" {
        return true;
    }
    name.parse::<std::net::Ipv4Addr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active().len(),
        "counters": snapshot,
    }))
}

/// `POST /events`: 202 on enqueue, 400 on validation failure, 503 when the
/// queue is unreachable. Never blocks past the enqueue timeout; the caller
/// must not retry.
async fn submit_event(
    State(state): State<AppState>,
    body: Result<Json<SubmitBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return (StatusCode::BAD_REQUEST, "malformed body").into_response();
    };
    let Some(platform) = Platform::parse(&body.platform) else {
        return (StatusCode::BAD_REQUEST, "unknown platform").into_response();
    };
    if body.event.event_type.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "empty event_type").into_response();
    }
    if body.session_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "empty session_id").into_response();
    }

    // Session lifecycle notifications drive the registry before (or instead
    // of) being persisted as events.
    match (platform, body.event.event_type.as_str()) {
        (Platform::Cursor, "session_start") => {
            let payload = &body.event.payload;
            let Some(workspace_path) = payload["workspace_path"].as_str() else {
                return (StatusCode::BAD_REQUEST, "session_start requires workspace_path")
                    .into_response();
            };
            let result = state.registry.session_start(
                &body.session_id,
                workspace_path,
                payload["workspace_hash"].as_str(),
                payload["pid"].as_i64(),
                body.event.metadata.clone(),
            );
            if let Err(e) = result {
                warn!(error = %e, "session_start failed");
                return (StatusCode::SERVICE_UNAVAILABLE, "registry unavailable")
                    .into_response();
            }
        }
        (Platform::Cursor, "session_end") => {
            if let Err(e) = state.registry.session_end(&body.session_id) {
                warn!(error = %e, "session_end failed");
            }
        }
        (Platform::Cursor, "heartbeat") => {
            state.registry.heartbeat(&body.session_id);
            return StatusCode::ACCEPTED.into_response();
        }
        (Platform::ClaudeCode, "session_end") => {
            // the transcript is done; stale offset rows can go
            if let Err(e) = state.store.delete_offsets_for_session(&body.session_id) {
                warn!(error = %e, "offset cleanup failed");
            }
        }
        _ => {}
    }

    let mut event = Event::new(
        platform,
        body.event.event_type,
        body.session_id,
        body.event.payload,
    );
    if let Some(id) = body.event.event_id {
        event.event_id = id;
    }
    if let Some(ts) = body.event.timestamp {
        event.timestamp = ts;
    }
    if let Some(metadata) = body.event.metadata {
        event.metadata = metadata;
    }
    event.enqueued_at = Some(Utc::now());
    if platform == Platform::Cursor {
        event.workspace_hash = state
            .registry
            .active()
            .into_iter()
            .find(|s| s.external_session_id == event.external_session_id)
            .map(|s| s.workspace_hash);
    }

    match publish_event(&state.queue, &state.metrics, &event).await {
        Ok(()) => {
            debug!(event_id = %event.event_id, "event accepted");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({"event_id": event.event_id})),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "enqueue failed, dropping event");
            (StatusCode::SERVICE_UNAVAILABLE, "queue unavailable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_state() -> (AppState, Arc<MemoryQueue>, Arc<Store>) {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new(store.clone()).unwrap());
        let state = AppState {
            queue: queue.clone(),
            store: store.clone(),
            registry,
            metrics: Arc::new(Metrics::default()),
        };
        (state, queue, store)
    }

    async fn post_json(state: AppState, body: serde_json::Value) -> StatusCode {
        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::post("/events")
                    .header("host", "127.0.0.1:7845")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn valid_event_is_accepted_and_enqueued() {
        let (state, queue, _) = test_state();
        let status = post_json(
            state,
            serde_json::json!({
                "event": {"event_type": "tool_use", "payload": {"tool": "Read"}},
                "platform": "claude_code",
                "session_id": "4be0ac86-21f1-4c34-9ddb-d95b3c6b0f8a"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queue.len(STREAM_EVENTS), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let (state, queue, _) = test_state();
        let status = post_json(state, serde_json::json!({"not": "an event"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(queue.len(STREAM_EVENTS), 0);
    }

    #[tokio::test]
    async fn unknown_platform_is_rejected() {
        let (state, _, _) = test_state();
        let status = post_json(
            state,
            serde_json::json!({
                "event": {"event_type": "x", "payload": {}},
                "platform": "vscode",
                "session_id": "s"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn session_start_registers_and_stamps_workspace() {
        let (state, queue, _) = test_state();
        let registry = state.registry.clone();
        let status = post_json(
            state,
            serde_json::json!({
                "event": {
                    "event_type": "session_start",
                    "payload": {"workspace_path": "/home/dev/api", "pid": 4242}
                },
                "platform": "cursor",
                "session_id": "curs_1700000000_ab12"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(registry.resolve("curs_1700000000_ab12").is_some());

        // the session_start event itself was enqueued, workspace stamped
        assert_eq!(queue.len(STREAM_EVENTS), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_without_enqueue() {
        let (state, queue, _) = test_state();
        state
            .registry
            .session_start("curs_1_a", "/home/dev/api", None, None, None)
            .unwrap();
        let status = post_json(
            state,
            serde_json::json!({
                "event": {"event_type": "heartbeat", "payload": {}},
                "platform": "cursor",
                "session_id": "curs_1_a"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queue.len(STREAM_EVENTS), 0);
    }

    #[tokio::test]
    async fn claude_session_end_clears_offsets() {
        let (state, _, store) = test_state();
        store
            .upsert_file_state(
                "/tmp/s1.jsonl",
                "s1",
                None,
                &crate::store::FileState::default(),
            )
            .unwrap();

        let status = post_json(
            state,
            serde_json::json!({
                "event": {"event_type": "session_end", "payload": {}},
                "platform": "claude_code",
                "session_id": "s1"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(store.get_file_state("/tmp/s1.jsonl").unwrap().is_none());
    }

    #[test]
    fn loopback_host_detection() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("127.0.0.1:7845"));
        assert!(is_loopback_host("127.0.0.53:80"));
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("localhost:7845"));
        assert!(is_loopback_host("[::1]:7845"));
        assert!(is_loopback_host(""));

        assert!(!is_loopback_host("evil.example.com"));
        assert!(!is_loopback_host("10.0.0.5:7845"));
        assert!(!is_loopback_host("192.168.1.20"));
    }

    #[tokio::test]
    async fn foreign_host_header_is_forbidden() {
        let (state, _, _) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::get("/health")
                    .header("host", "evil.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let (state, _, _) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::get("/health")
                    .header("host", "localhost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

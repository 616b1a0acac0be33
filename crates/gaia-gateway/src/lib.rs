//! Local admin/read HTTP API: pending listing, event-log SSE tail, pending
//! control, dead-letter requeue, and the rate-limited instruction endpoint.
//!
//! Token check: `X-Admin-Token` header or `token` query against the
//! configured admin token. No configured token leaves the API open, which is
//! the single-user local default.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use gaia_approval::ApprovalPipeline;
use gaia_core::principal_fingerprint;
use gaia_delivery::{Delivery, RequeueSelector};
use gaia_events::{sse_event_name, EventLog, EventRecord};
use gaia_store::{AuditStatus, PendingState, SqliteStore, StoreError};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;

const INSTRUCT_WINDOW_SECS: u64 = 60;
const INSTRUCT_MAX_HITS: u32 = 5;
const EVENT_SOURCE: &str = "gateway";

#[derive(Clone)]
pub struct GatewayConfig {
    pub bind: String,
    /// `MONITOR_ADMIN_TOKEN`; `None` leaves admin endpoints open.
    pub admin_token: Option<String>,
}

impl GatewayConfig {
    pub fn from_env(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            admin_token: std::env::var("MONITOR_ADMIN_TOKEN")
                .ok()
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<SqliteStore>,
    pub events: EventLog,
    pub pipeline: ApprovalPipeline,
    pub delivery: Delivery,
    pub admin_token: Option<String>,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/pending", get(handle_list_pending))
        .route("/events/tail", get(handle_events_tail))
        .route("/pending/{id}/approve", post(handle_approve))
        .route("/pending/{id}/deny", post(handle_deny))
        .route("/pending/{id}/postpone", post(handle_postpone))
        .route("/pending/{id}/rewake", post(handle_rewake))
        .route("/pending/{id}/toggle_option", post(handle_toggle_option))
        .route("/admin/requeue", post(handle_requeue))
        .route("/instruct", post(handle_instruct))
        .with_state(Arc::new(state))
}

/// Serves the admin API until the shutdown signal flips.
pub async fn run_gateway(
    config: GatewayConfig,
    state: GatewayState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{}'", config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(%local_addr, "gateway listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        })
        .await
        .context("gateway server exited unexpectedly")
}

struct AuthError;

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response()
    }
}

/// Checks the admin token and returns the acting principal. Failures write
/// an `unauthorized` audit row before rejecting.
fn authorize(
    state: &GatewayState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    action: &str,
) -> Result<String, AuthError> {
    let presented = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("token").cloned());
    match (&state.admin_token, presented) {
        (None, presented) => Ok(presented.unwrap_or_else(|| "anonymous".to_string())),
        (Some(expected), Some(presented)) if *expected == presented => Ok(presented),
        (Some(_), presented) => {
            let principal = presented.as_deref().unwrap_or("missing");
            if let Err(error) = state.store.write_audit(
                &principal_fingerprint(principal),
                action,
                AuditStatus::Unauthorized,
                &json!({ "reason": "admin token mismatch" }),
            ) {
                tracing::warn!(%error, "failed to write unauthorized audit row");
            }
            Err(AuthError)
        }
    }
}

fn store_error_response(error: anyhow::Error) -> Response {
    let status = match error.downcast_ref::<StoreError>() {
        Some(StoreError::PendingNotFound(_)) | Some(StoreError::TaskNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        Some(StoreError::InvalidPendingTransition { .. })
        | Some(StoreError::AlreadyTerminal { .. })
        | Some(StoreError::NotApproved(_)) => StatusCode::CONFLICT,
        Some(StoreError::Busy { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

async fn handle_list_pending(State(state): State<Arc<GatewayState>>) -> Response {
    match state.pipeline.list_pending() {
        Ok(pending) => (StatusCode::OK, Json(json!({ "pending": pending }))).into_response(),
        Err(error) => store_error_response(error),
    }
}

async fn handle_events_tail(State(state): State<Arc<GatewayState>>) -> Response {
    let receiver = state.events.tail();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        let record: EventRecord = item.ok()?;
        let data = serde_json::to_string(&record).ok()?;
        Some(Ok::<Event, Infallible>(
            Event::default()
                .event(sse_event_name(&record.event_type))
                .data(data),
        ))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn transition(
    state: &GatewayState,
    id: &str,
    from: PendingState,
    to: PendingState,
    actor: &str,
) -> Response {
    let result = state
        .store
        .transition_pending(id, from, to, actor, Utc::now())
        .map_err(anyhow::Error::from);
    match result {
        Ok(pending) => {
            let event_type = match to {
                PendingState::Approved => "command.approved",
                PendingState::Denied => "command.denied",
                _ => "command.updated",
            };
            if let Err(error) = state.events.append(
                EventRecord::new(event_type, EVENT_SOURCE)
                    .target(&pending.chat_id)
                    .payload(json!({
                        "pending_id": pending.id,
                        "command": pending.command,
                        "by": actor,
                        "to": to.as_str(),
                    })),
            ) {
                tracing::warn!(%error, "failed to append gateway event");
            }
            (StatusCode::OK, Json(json!({ "pending": pending }))).into_response()
        }
        Err(error) => store_error_response(error),
    }
}

async fn handle_approve(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let actor = match authorize(&state, &headers, &query, "approve") {
        Ok(actor) => principal_fingerprint(&actor),
        Err(error) => return error.into_response(),
    };
    let response = transition(&state, &id, PendingState::Pending, PendingState::Approved, &actor).await;
    if response.status() != StatusCode::OK {
        return response;
    }
    // Honor exec_request the same way a chat approval would.
    if !state.pipeline.allow_execution() {
        return response;
    }
    match state.store.get_pending(&id) {
        Ok(Some(pending)) if pending.options.exec_request => {
            match state.pipeline.execute(&id, &actor, &gaia_core::new_trace_id()).await {
                Ok(executed) => {
                    (StatusCode::OK, Json(json!({ "pending": executed }))).into_response()
                }
                Err(error) => store_error_response(error),
            }
        }
        Ok(_) => response,
        Err(error) => store_error_response(error.into()),
    }
}

async fn handle_deny(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let actor = match authorize(&state, &headers, &query, "deny") {
        Ok(actor) => principal_fingerprint(&actor),
        Err(error) => return error.into_response(),
    };
    transition(&state, &id, PendingState::Pending, PendingState::Denied, &actor).await
}

async fn handle_postpone(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let actor = match authorize(&state, &headers, &query, "postpone") {
        Ok(actor) => principal_fingerprint(&actor),
        Err(error) => return error.into_response(),
    };
    transition(&state, &id, PendingState::Pending, PendingState::Postponed, &actor).await
}

async fn handle_rewake(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let actor = match authorize(&state, &headers, &query, "rewake") {
        Ok(actor) => principal_fingerprint(&actor),
        Err(error) => return error.into_response(),
    };
    match state.pipeline.rewake(&id, &actor) {
        Ok(pending) => (StatusCode::OK, Json(json!({ "pending": pending }))).into_response(),
        Err(error) => store_error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleOptionRequest {
    option: String,
}

async fn handle_toggle_option(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<ToggleOptionRequest>,
) -> Response {
    let actor = match authorize(&state, &headers, &query, "toggle_option") {
        Ok(actor) => principal_fingerprint(&actor),
        Err(error) => return error.into_response(),
    };
    match state.store.toggle_pending_option(&id, &request.option, &actor) {
        Ok(pending) => (StatusCode::OK, Json(json!({ "pending": pending }))).into_response(),
        Err(error) => store_error_response(error.into()),
    }
}

#[derive(Debug, Deserialize)]
struct RequeueRequest {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    callback_id: Option<String>,
}

async fn handle_requeue(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<RequeueRequest>,
) -> Response {
    let principal = match authorize(&state, &headers, &query, "admin-requeue") {
        Ok(principal) => principal,
        Err(error) => return error.into_response(),
    };
    let selector = match (request.index, request.callback_id) {
        (Some(index), None) => RequeueSelector::Index(index),
        (None, Some(callback_id)) => RequeueSelector::Id(callback_id),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "exactly one of index or callback_id is required" })),
            )
                .into_response();
        }
    };
    let fingerprint = principal_fingerprint(&principal);
    match state.delivery.operator_requeue(&selector) {
        Ok(Some(job)) => {
            if let Err(error) = state.store.write_audit(
                &fingerprint,
                "admin-requeue",
                AuditStatus::Ok,
                &json!({ "job_id": job.id, "action": job.action.kind() }),
            ) {
                tracing::warn!(%error, "failed to write requeue audit row");
            }
            (StatusCode::OK, Json(json!({ "requeued": job }))).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no matching dead-letter job" })),
        )
            .into_response(),
        Err(error) => store_error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct InstructRequest {
    text: String,
    #[serde(default)]
    target: Option<String>,
}

async fn handle_instruct(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<InstructRequest>,
) -> Response {
    let principal = match authorize(&state, &headers, &query, "instruct") {
        Ok(principal) => principal,
        Err(error) => return error.into_response(),
    };
    let fingerprint = principal_fingerprint(&principal);
    let decision = match state.store.instruct_rate_check(
        &format!("instruct:{fingerprint}"),
        INSTRUCT_WINDOW_SECS,
        INSTRUCT_MAX_HITS,
        Utc::now(),
    ) {
        Ok(decision) => decision,
        Err(error) => return store_error_response(error.into()),
    };
    if !decision.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", decision.retry_after_secs.to_string())],
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
    }
    let mut record = EventRecord::new("instruction", EVENT_SOURCE)
        .payload(json!({ "text": request.text, "by": fingerprint }));
    if let Some(target) = request.target {
        record = record.target(target);
    }
    let trace_id = record.trace_id.clone();
    match state.events.append_sync(record) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "trace_id": trace_id }))).into_response(),
        Err(error) => store_error_response(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gaia_approval::{ApprovalConfig, ExecutionPolicy, InboundQueue};
    use gaia_delivery::{DeliveryConfig, JobFile, MetricsFile, OutboundAction, OutboundJob};
    use gaia_store::NewPendingCommand;
    use gaia_telegram::{ChatApi, ChatApiError};

    struct OkApi;

    #[async_trait]
    impl ChatApi for OkApi {
        async fn get_updates(&self, _: u64, _: u64) -> Result<Vec<Value>, ChatApiError> {
            Ok(Vec::new())
        }
        async fn send_message(
            &self,
            _: &str,
            _: &str,
            _: Option<Value>,
        ) -> Result<Value, ChatApiError> {
            Ok(Value::Null)
        }
        async fn answer_callback(&self, _: &str, _: Option<&str>) -> Result<Value, ChatApiError> {
            Ok(Value::Null)
        }
        async fn edit_message_text(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Option<Value>,
        ) -> Result<Value, ChatApiError> {
            Ok(Value::Null)
        }
        async fn send_chat_action(&self, _: &str, _: &str) -> Result<Value, ChatApiError> {
            Ok(Value::Null)
        }
    }

    struct TestServer {
        base_url: String,
        state: GatewayState,
        _tempdir: tempfile::TempDir,
    }

    async fn serve(admin_token: Option<&str>) -> TestServer {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::new(tempdir.path().join("gaia.db")).expect("store"));
        let events = EventLog::open(tempdir.path().join("events.jsonl")).expect("events");
        let delivery = Delivery::new(
            Arc::new(OkApi),
            JobFile::new(tempdir.path().join("failed.json")),
            JobFile::new(tempdir.path().join("dead.json")),
            MetricsFile::new(tempdir.path().join("metrics.json")),
            DeliveryConfig::default(),
        );
        let pipeline = ApprovalPipeline::new(
            store.clone(),
            events.clone(),
            delivery.clone(),
            InboundQueue::new(tempdir.path().join("inbound.json")),
            ExecutionPolicy {
                allow_execution: false,
            },
            ApprovalConfig::default(),
        );
        let state = GatewayState {
            store,
            events,
            pipeline,
            delivery,
            admin_token: admin_token.map(str::to_string),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let local_addr = listener.local_addr().expect("addr");
        let app = build_router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestServer {
            base_url: format!("http://{local_addr}"),
            state,
            _tempdir: tempdir,
        }
    }

    async fn seed_pending(server: &TestServer) -> String {
        server
            .state
            .pipeline
            .request_approval(NewPendingCommand {
                chat_id: "42".to_string(),
                message_id: "5".to_string(),
                command: "echo hi".to_string(),
                from: json!({ "id": 777 }),
                options: gaia_store::PendingOptions::default(),
            })
            .await
            .expect("request approval")
            .id
    }

    #[tokio::test]
    async fn pending_listing_is_open_without_token() {
        let server = serve(None).await;
        seed_pending(&server).await;
        let body: Value = reqwest::get(format!("{}/pending", server.base_url))
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(body["pending"].as_array().expect("array").len(), 1);
    }

    #[tokio::test]
    async fn admin_approve_requires_token_and_audits_rejections() {
        let server = serve(Some("sekrit")).await;
        let id = seed_pending(&server).await;
        let client = reqwest::Client::new();

        let rejected = client
            .post(format!("{}/pending/{id}/approve", server.base_url))
            .header("X-Admin-Token", "wrong")
            .send()
            .await
            .expect("request");
        assert_eq!(rejected.status().as_u16(), 401);
        let unauthorized: Vec<_> = server
            .state
            .store
            .list_audit(20)
            .expect("audit")
            .into_iter()
            .filter(|row| row.status == "unauthorized")
            .collect();
        assert_eq!(unauthorized.len(), 1);

        let approved = client
            .post(format!("{}/pending/{id}/approve", server.base_url))
            .header("X-Admin-Token", "sekrit")
            .send()
            .await
            .expect("request");
        assert_eq!(approved.status().as_u16(), 200);
        let pending = server
            .state
            .store
            .get_pending(&id)
            .expect("get")
            .expect("present");
        assert_eq!(pending.status, PendingState::Approved);
    }

    #[tokio::test]
    async fn approve_leaves_exec_request_alone_while_execution_is_disabled() {
        let server = serve(None).await;
        let id = server
            .state
            .pipeline
            .request_approval(NewPendingCommand {
                chat_id: "42".to_string(),
                message_id: "6".to_string(),
                command: "echo hi".to_string(),
                from: json!({ "id": 777 }),
                options: gaia_store::PendingOptions {
                    exec_request: true,
                    ..Default::default()
                },
            })
            .await
            .expect("request approval")
            .id;
        let client = reqwest::Client::new();
        let approved = client
            .post(format!("{}/pending/{id}/approve", server.base_url))
            .send()
            .await
            .expect("request");
        assert_eq!(approved.status().as_u16(), 200);
        let pending = server
            .state
            .store
            .get_pending(&id)
            .expect("get")
            .expect("present");
        // Execution is off, so the approval must not run or dry-run the command.
        assert_eq!(pending.status, PendingState::Approved);
    }

    #[tokio::test]
    async fn token_via_query_parameter_works() {
        let server = serve(Some("sekrit")).await;
        let id = seed_pending(&server).await;
        let client = reqwest::Client::new();
        let denied = client
            .post(format!(
                "{}/pending/{id}/deny?token=sekrit",
                server.base_url
            ))
            .send()
            .await
            .expect("request");
        assert_eq!(denied.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn double_approve_conflicts() {
        let server = serve(None).await;
        let id = seed_pending(&server).await;
        let client = reqwest::Client::new();
        let first = client
            .post(format!("{}/pending/{id}/approve", server.base_url))
            .send()
            .await
            .expect("request");
        assert_eq!(first.status().as_u16(), 200);
        let second = client
            .post(format!("{}/pending/{id}/approve", server.base_url))
            .send()
            .await
            .expect("request");
        assert_eq!(second.status().as_u16(), 409);
    }

    #[tokio::test]
    async fn requeue_moves_dead_letter_and_audits() {
        let server = serve(Some("sekrit")).await;
        let job = OutboundJob::new(
            OutboundAction::SendMessage {
                chat_id: "42".to_string(),
                text: "hello".to_string(),
                reply_markup: None,
            },
            "2026-08-29T12:00:00Z",
        )
        .with_source_id("cq-3");
        // Park one job in the dead-letter directly.
        let dead = JobFile::new(server._tempdir.path().join("dead.json"));
        dead.append(job).expect("append");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/admin/requeue", server.base_url))
            .header("X-Admin-Token", "sekrit")
            .json(&json!({ "callback_id": "cq-3" }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status().as_u16(), 200);
        assert!(dead.load().expect("load").is_empty());
        let audits: Vec<_> = server
            .state
            .store
            .list_audit(20)
            .expect("audit")
            .into_iter()
            .filter(|row| row.action == "admin-requeue" && row.status == "ok")
            .collect();
        assert_eq!(audits.len(), 1);

        let missing = client
            .post(format!("{}/admin/requeue", server.base_url))
            .header("X-Admin-Token", "sekrit")
            .json(&json!({ "index": 9 }))
            .send()
            .await
            .expect("request");
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn instruct_rate_limits_with_retry_after() {
        let server = serve(None).await;
        let client = reqwest::Client::new();
        for _ in 0..INSTRUCT_MAX_HITS {
            let accepted = client
                .post(format!("{}/instruct", server.base_url))
                .json(&json!({ "text": "do the thing" }))
                .send()
                .await
                .expect("request");
            assert_eq!(accepted.status().as_u16(), 202);
        }
        let limited = client
            .post(format!("{}/instruct", server.base_url))
            .json(&json!({ "text": "do the thing" }))
            .send()
            .await
            .expect("request");
        assert_eq!(limited.status().as_u16(), 429);
        assert!(limited.headers().contains_key("Retry-After"));
    }
}

//! Scenario: operator requeue over the admin API, unauthorized then
//! authorized, with the audit trail checked both ways.

use std::sync::Arc;

use gaia_approval::{ApprovalConfig, ApprovalPipeline, ExecutionPolicy, InboundQueue};
use gaia_delivery::{Delivery, DeliveryConfig, JobFile, MetricsFile, OutboundAction, OutboundJob};
use gaia_events::EventLog;
use gaia_gateway::{build_router, GatewayState};
use gaia_store::SqliteStore;
use gaia_telegram::{TelegramApi, TelegramConfig};
use httpmock::prelude::*;
use serde_json::json;
use tokio::net::TcpListener;

#[tokio::test]
async fn requeue_needs_the_admin_token_and_audits_both_paths() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let provider = MockServer::start();
    provider.mock(|when, then| {
        when.method(POST);
        then.status(200).json_body(json!({ "ok": true, "result": {} }));
    });

    let store = Arc::new(SqliteStore::new(tempdir.path().join("gaia.db")).expect("store"));
    let events = EventLog::open(tempdir.path().join("events.jsonl")).expect("events");
    let api = TelegramApi::new(TelegramConfig {
        api_base: provider.base_url(),
        bot_token: "test-token".to_string(),
        retries: 1,
        base_backoff: std::time::Duration::from_millis(1),
        http_timeout: std::time::Duration::from_secs(5),
    })
    .expect("api");
    let failed = JobFile::new(tempdir.path().join("failed.json"));
    let dead = JobFile::new(tempdir.path().join("dead.json"));
    let delivery = Delivery::new(
        Arc::new(api),
        failed.clone(),
        dead.clone(),
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

    // One quarantined acknowledgement to move back.
    dead.append(
        OutboundJob::new(
            OutboundAction::AnswerCallback {
                callback_query_id: "cb-2".to_string(),
                text: None,
            },
            "2026-08-29T12:00:00Z",
        )
        .with_source_id("cb-2"),
    )
    .expect("seed dead letter");

    let state = GatewayState {
        store: store.clone(),
        events,
        pipeline,
        delivery,
        admin_token: Some("sekrit".to_string()),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base_url = format!("http://{}", listener.local_addr().expect("addr"));
    let app = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = reqwest::Client::new();
    let rejected = client
        .post(format!("{base_url}/admin/requeue"))
        .json(&json!({ "index": 0 }))
        .send()
        .await
        .expect("request");
    assert_eq!(rejected.status().as_u16(), 401);
    let unauthorized: Vec<_> = store
        .list_audit(20)
        .expect("audit")
        .into_iter()
        .filter(|row| row.action == "admin-requeue" && row.status == "unauthorized")
        .collect();
    assert_eq!(unauthorized.len(), 1);
    assert_eq!(dead.load().expect("dead letter").len(), 1);

    let accepted = client
        .post(format!("{base_url}/admin/requeue"))
        .header("X-Admin-Token", "sekrit")
        .json(&json!({ "index": 0 }))
        .send()
        .await
        .expect("request");
    assert_eq!(accepted.status().as_u16(), 200);
    assert!(dead.load().expect("dead letter").is_empty());
    assert_eq!(failed.load().expect("failed queue").len(), 1);

    let authorized: Vec<_> = store
        .list_audit(20)
        .expect("audit")
        .into_iter()
        .filter(|row| row.action == "admin-requeue" && row.status == "ok")
        .collect();
    assert_eq!(authorized.len(), 1);
    // The audited actor is a truncated fingerprint, never the raw token.
    assert_ne!(authorized[0].actor, "sekrit");
    assert_eq!(authorized[0].actor.len(), 12);
}

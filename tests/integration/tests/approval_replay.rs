//! Idempotence of the approval pipeline under provider redelivery: replayed
//! callbacks, repeated textual approvals, and inbound-queue replay after a
//! crash.

use std::sync::Arc;

use chrono::Utc;
use gaia_approval::{ApprovalConfig, ApprovalPipeline, ExecutionPolicy, InboundQueue};
use gaia_delivery::{Delivery, DeliveryConfig, JobFile, MetricsFile};
use gaia_events::{EventFilter, EventLog};
use gaia_store::{NewPendingCommand, PendingOptions, PendingState, SqliteStore};
use gaia_telegram::{TelegramApi, TelegramConfig};
use httpmock::prelude::*;
use serde_json::{json, Value};

struct Fixture {
    pipeline: ApprovalPipeline,
    store: Arc<SqliteStore>,
    events: EventLog,
    _server: MockServer,
    _tempdir: tempfile::TempDir,
}

/// Pipeline wired to a provider stub that accepts every outbound call.
fn fixture() -> Fixture {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST);
        then.status(200)
            .json_body(json!({ "ok": true, "result": {} }));
    });

    let store = Arc::new(SqliteStore::new(tempdir.path().join("gaia.db")).expect("store"));
    let events = EventLog::open(tempdir.path().join("events.jsonl")).expect("events");
    let api = TelegramApi::new(TelegramConfig {
        api_base: server.base_url(),
        bot_token: "test-token".to_string(),
        retries: 1,
        base_backoff: std::time::Duration::from_millis(1),
        http_timeout: std::time::Duration::from_secs(5),
    })
    .expect("api");
    let delivery = Delivery::new(
        Arc::new(api),
        JobFile::new(tempdir.path().join("failed.json")),
        JobFile::new(tempdir.path().join("dead.json")),
        MetricsFile::new(tempdir.path().join("metrics.json")),
        DeliveryConfig::default(),
    );
    let pipeline = ApprovalPipeline::new(
        store.clone(),
        events.clone(),
        delivery,
        InboundQueue::new(tempdir.path().join("inbound.json")),
        ExecutionPolicy {
            allow_execution: false,
        },
        ApprovalConfig::default(),
    );
    Fixture {
        pipeline,
        store,
        events,
        _server: server,
        _tempdir: tempdir,
    }
}

fn seed_pending(fixture: &Fixture, id: &str) {
    fixture
        .store
        .enqueue_pending(
            id,
            NewPendingCommand {
                chat_id: "42".to_string(),
                message_id: "5".to_string(),
                command: "echo hi".to_string(),
                from: json!({ "id": 777 }),
                options: PendingOptions::default(),
            },
            None,
        )
        .expect("enqueue pending");
}

fn count_events(fixture: &Fixture, event_type: &str) -> usize {
    fixture.events.flush().expect("flush");
    fixture
        .events
        .read_filtered(&EventFilter {
            event_type: Some(event_type.to_string()),
            ..EventFilter::default()
        })
        .expect("read events")
        .len()
}

async fn ingest(fixture: &Fixture, update_id: u64, update: Value) {
    fixture
        .pipeline
        .inbound()
        .append_if_unseen(update_id, update, Utc::now())
        .expect("append");
    fixture.pipeline.drain_inbound().await.expect("drain");
}

#[tokio::test]
async fn replayed_approve_callback_fires_once() {
    let fixture = fixture();
    seed_pending(&fixture, "cb-replay");

    let callback = |update_id: u64| {
        json!({
            "update_id": update_id,
            "callback_query": {
                "id": "cq-1",
                "from": { "id": 777 },
                "data": "approve:cb-replay",
                "message": { "message_id": 5, "chat": { "id": 42 } }
            }
        })
    };
    ingest(&fixture, 1, callback(1)).await;
    ingest(&fixture, 2, callback(2)).await;

    assert_eq!(count_events(&fixture, "command.approved"), 1);
    let pending = fixture
        .store
        .get_pending("cb-replay")
        .expect("get")
        .expect("present");
    assert_eq!(pending.status, PendingState::Approved);
    let approved_audits: Vec<_> = fixture
        .store
        .list_audit(50)
        .expect("audit")
        .into_iter()
        .filter(|row| row.action == "approve" && row.status == "ok")
        .collect();
    assert_eq!(approved_audits.len(), 1);
}

#[tokio::test]
async fn repeated_text_approval_fires_once() {
    let fixture = fixture();
    seed_pending(&fixture, "abc123");

    let message = |update_id: u64| {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": 9,
                "chat": { "id": 42 },
                "from": { "id": 777 },
                "text": "approve abc123"
            }
        })
    };
    ingest(&fixture, 1, message(1)).await;
    ingest(&fixture, 2, message(2)).await;

    // The second message is a distinct update, but the command is already
    // approved, so no further event or audit row is produced.
    assert_eq!(count_events(&fixture, "command.approved"), 1);
    let approved_audits: Vec<_> = fixture
        .store
        .list_audit(50)
        .expect("audit")
        .into_iter()
        .filter(|row| row.action == "approve" && row.status == "ok")
        .collect();
    assert_eq!(approved_audits.len(), 1);
}

#[tokio::test]
async fn inbound_replay_after_crash_adds_no_events() {
    let fixture = fixture();
    seed_pending(&fixture, "cb-crash");

    let update = json!({
        "update_id": 7,
        "callback_query": {
            "id": "cq-7",
            "from": { "id": 777 },
            "data": "approve:cb-crash",
            "message": { "message_id": 5, "chat": { "id": 42 } }
        }
    });
    ingest(&fixture, 7, update.clone()).await;
    let baseline = count_events(&fixture, "command");

    // Simulate the provider re-sending the whole batch after a restart: the
    // seen-set survives, so nothing is appended or processed again.
    assert!(!fixture
        .pipeline
        .inbound()
        .append_if_unseen(7, update, Utc::now())
        .expect("replay append"));
    fixture.pipeline.drain_inbound().await.expect("drain");

    assert_eq!(count_events(&fixture, "command"), baseline);
}

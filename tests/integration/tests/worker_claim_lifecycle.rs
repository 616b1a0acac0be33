//! End-to-end task lifecycle: concurrent workers splitting a queue, and the
//! stale-lease reclaimer inside and past its attempt cap.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gaia_events::{EventFilter, EventLog};
use gaia_queue::{Coordinator, TaskHandler, Worker, WorkerConfig};
use gaia_store::{SqliteStore, Task, TaskState};
use serde_json::{json, Value};

struct RecordingHandler {
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<Value> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task.id);
        Ok(json!({ "handled": task.id }))
    }
}

fn fixture(dir: &std::path::Path) -> (SqliteStore, EventLog) {
    let store = SqliteStore::new(dir.join("gaia.db")).expect("store");
    let events = EventLog::open(dir.join("events.jsonl")).expect("events");
    (store, events)
}

#[tokio::test]
async fn two_workers_split_three_tasks_without_overlap() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let (store, events) = fixture(tempdir.path());
    let coordinator = Coordinator::new(store.clone(), events.clone());

    let mut enqueued = HashSet::new();
    for command in ["echo 1", "echo 2", "echo 3"] {
        let id = coordinator
            .enqueue("shell", json!({ "command": command }))
            .expect("enqueue");
        enqueued.insert(id);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handlers: Vec<Arc<RecordingHandler>> = (0..2)
        .map(|_| {
            Arc::new(RecordingHandler {
                seen: Mutex::new(Vec::new()),
            })
        })
        .collect();
    let mut worker_tasks = Vec::new();
    for (index, handler) in handlers.iter().enumerate() {
        let coordinator = coordinator.clone();
        let handler = handler.clone();
        let shutdown = shutdown_rx.clone();
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(20),
            ..WorkerConfig::new(format!("worker-{index}"))
        };
        worker_tasks.push(tokio::spawn(async move {
            Worker::new(coordinator, handler, config)
                .run(shutdown)
                .await
                .expect("worker run");
        }));
    }

    // Wait for the queue to drain.
    for _ in 0..100 {
        if store
            .list_tasks(Some(TaskState::Completed))
            .expect("list")
            .len()
            == 3
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown_tx.send(true).expect("signal shutdown");
    for task in worker_tasks {
        task.await.expect("join worker");
    }

    let completed: HashSet<i64> = store
        .list_tasks(Some(TaskState::Completed))
        .expect("list completed")
        .iter()
        .map(|task| task.id)
        .collect();
    assert_eq!(completed, enqueued);
    assert!(store
        .list_tasks(Some(TaskState::Pending))
        .expect("list pending")
        .is_empty());

    // No task was handled by both workers.
    let first: HashSet<i64> = handlers[0]
        .seen
        .lock()
        .expect("lock")
        .iter()
        .copied()
        .collect();
    let second: HashSet<i64> = handlers[1]
        .seen
        .lock()
        .expect("lock")
        .iter()
        .copied()
        .collect();
    assert!(first.is_disjoint(&second));
    assert_eq!(first.len() + second.len(), 3);

    events.flush().expect("flush");
    let complete_events = events
        .read_filtered(&EventFilter {
            event_type: Some("task.complete".to_string()),
            ..EventFilter::default()
        })
        .expect("read events");
    assert_eq!(complete_events.len(), 3);
}

#[tokio::test]
async fn stale_claim_is_reclaimed_within_cap() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let (store, events) = fixture(tempdir.path());
    let coordinator = Coordinator::new(store.clone(), events.clone());
    let task_id = coordinator.enqueue("shell", json!({})).expect("enqueue");

    // A worker claimed an hour ago and never came back.
    let stale_now = Utc::now() - chrono::Duration::seconds(3600);
    store
        .claim_next("worker-crashed", stale_now)
        .expect("claim")
        .expect("task claimed");

    let report = coordinator.reclaim_stale(60, 3).expect("reclaim");
    assert_eq!(report.reclaimed_ids, vec![task_id]);
    assert!(report.failed_ids.is_empty());

    let task = store
        .get_task(task_id)
        .expect("get")
        .expect("task present");
    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(task.reclaim_attempts, 1);
    assert!(task.worker_id.is_none());

    let reclaim_audits: Vec<_> = store
        .list_audit(20)
        .expect("audit")
        .into_iter()
        .filter(|row| row.action == "reclaim" && row.status == "ok")
        .collect();
    assert_eq!(reclaim_audits.len(), 1);
}

#[tokio::test]
async fn reclaim_past_cap_fails_terminally() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let (store, events) = fixture(tempdir.path());
    let coordinator = Coordinator::new(store.clone(), events.clone());
    let task_id = coordinator.enqueue("shell", json!({})).expect("enqueue");

    // Burn through the reclaim budget.
    for _ in 0..3 {
        let stale_now = Utc::now() - chrono::Duration::seconds(3600);
        store
            .claim_next("worker-crashed", stale_now)
            .expect("claim")
            .expect("task claimed");
        coordinator.reclaim_stale(60, 3).expect("reclaim");
    }
    let stale_now = Utc::now() - chrono::Duration::seconds(3600);
    store
        .claim_next("worker-crashed", stale_now)
        .expect("claim")
        .expect("task claimed");
    let report = coordinator.reclaim_stale(60, 3).expect("reclaim");
    assert_eq!(report.failed_ids, vec![task_id]);

    let task = store
        .get_task(task_id)
        .expect("get")
        .expect("task present");
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.last_error.as_deref(), Some("reclaim_exhausted"));

    events.flush().expect("flush");
    let failed_events = events
        .read_filtered(&EventFilter {
            event_type: Some("task.reclaim_failed".to_string()),
            ..EventFilter::default()
        })
        .expect("read events");
    assert_eq!(failed_events.len(), 1);

    let exhausted_audits: Vec<_> = store
        .list_audit(50)
        .expect("audit")
        .into_iter()
        .filter(|row| row.action == "reclaim_failed")
        .collect();
    assert_eq!(exhausted_audits.len(), 1);
}

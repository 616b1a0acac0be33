//! Task lifecycle coordination: producers enqueue, workers claim and settle,
//! the reclaimer returns expired leases to the queue. Every mutation emits
//! exactly one event; privileged transitions write audit rows inside the
//! store transaction that performs them.

use anyhow::Result;
use chrono::Utc;
use gaia_events::{EventLog, EventRecord};
use gaia_store::{ReclaimReport, SqliteStore, Task, TaskState};
use serde_json::{json, Value};

const EVENT_SOURCE: &str = "queue";

/// Single entry point both producers and workers call; workers depend only on
/// this public contract.
#[derive(Clone)]
pub struct Coordinator {
    store: SqliteStore,
    events: EventLog,
}

impl Coordinator {
    pub fn new(store: SqliteStore, events: EventLog) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Inserts a task and emits `task.enqueued`.
    pub fn enqueue(&self, task_type: &str, payload: Value) -> Result<i64> {
        let task_id = self.store.enqueue_task(task_type, &payload)?;
        self.events.append(
            EventRecord::new("task.enqueued", EVENT_SOURCE)
                .task_id(task_id.to_string())
                .payload(json!({ "task_type": task_type })),
        )?;
        Ok(task_id)
    }

    /// Claims the oldest pending task for `worker_id`, granting an implicit
    /// lease until the worker settles it or the reclaimer takes it back.
    pub fn claim(&self, worker_id: &str) -> Result<Option<Task>> {
        let Some(task) = self.store.claim_next(worker_id, Utc::now())? else {
            return Ok(None);
        };
        self.events.append(
            EventRecord::new("task.claimed", EVENT_SOURCE)
                .task_id(task.id.to_string())
                .target(worker_id)
                .payload(json!({ "task_type": task.task_type })),
        )?;
        Ok(Some(task))
    }

    /// Settles a claimed task as `completed`; only the claiming worker may
    /// call this, exactly once.
    pub fn complete(&self, task_id: i64, worker_id: &str, result: Value) -> Result<Task> {
        let task = self.store.complete_task(task_id, worker_id, result)?;
        self.events.append(
            EventRecord::new("task.complete", EVENT_SOURCE)
                .task_id(task_id.to_string())
                .target(worker_id)
                .payload(Value::Null),
        )?;
        Ok(task)
    }

    /// Settles a claimed task as `failed` with the error recorded.
    pub fn fail(&self, task_id: i64, worker_id: &str, error: &str) -> Result<Task> {
        let task = self.store.fail_task(task_id, worker_id, error)?;
        self.events.append(
            EventRecord::new("task.failed", EVENT_SOURCE)
                .task_id(task_id.to_string())
                .target(worker_id)
                .payload(json!({ "error": error })),
        )?;
        Ok(task)
    }

    /// Returns expired leases to `pending` (up to `max_attempts` reclaims) or
    /// fails them terminally, emitting one event per transitioned task.
    pub fn reclaim_stale(&self, ttl_seconds: u64, max_attempts: u32) -> Result<ReclaimReport> {
        let report = self
            .store
            .reclaim_stale(ttl_seconds, max_attempts, Utc::now())?;
        for task_id in &report.reclaimed_ids {
            self.events.append(
                EventRecord::new("task.reclaimed", EVENT_SOURCE).task_id(task_id.to_string()),
            )?;
        }
        for task_id in &report.failed_ids {
            self.events.append(
                EventRecord::new("task.reclaim_failed", EVENT_SOURCE)
                    .task_id(task_id.to_string())
                    .payload(json!({ "error": "reclaim_exhausted" })),
            )?;
        }
        Ok(report)
    }

    /// Admin-surface listing.
    pub fn list(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(state)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_events::EventFilter;
    use gaia_store::StoreError;

    fn coordinator() -> (tempfile::TempDir, Coordinator) {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(tempdir.path().join("gaia.db")).expect("store");
        let events = EventLog::open(tempdir.path().join("events.jsonl")).expect("events");
        (tempdir, Coordinator::new(store, events))
    }

    #[test]
    fn enqueue_claim_complete_emits_one_event_each() {
        let (_guard, coordinator) = coordinator();
        let task_id = coordinator
            .enqueue("echo", json!({ "cmd": "echo 1" }))
            .expect("enqueue");
        let claimed = coordinator
            .claim("worker-1")
            .expect("claim")
            .expect("task");
        assert_eq!(claimed.id, task_id);
        coordinator
            .complete(task_id, "worker-1", json!({ "rc": 0 }))
            .expect("complete");

        let events = coordinator
            .events
            .read_filtered(&EventFilter {
                event_type: Some("task".to_string()),
                ..EventFilter::default()
            })
            .expect("events");
        let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(names, vec!["task.enqueued", "task.claimed", "task.complete"]);
        let listed = coordinator
            .list(Some(TaskState::Completed))
            .expect("list completed");
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn settle_after_reclaim_reports_already_terminal_or_not_owner() {
        let (_guard, coordinator) = coordinator();
        let task_id = coordinator.enqueue("echo", json!({})).expect("enqueue");
        coordinator.claim("worker-1").expect("claim").expect("task");

        // Force the lease to expire and reclaim the task.
        let long_ago = Utc::now() - chrono::Duration::seconds(3600);
        coordinator
            .store
            .reclaim_stale(60, 3, long_ago + chrono::Duration::seconds(7200))
            .expect("reclaim");

        // The original worker no longer owns the row.
        let settle = coordinator.complete(task_id, "worker-1", json!({}));
        let error = settle.expect_err("stale settle must fail");
        assert!(matches!(
            error.downcast_ref::<StoreError>(),
            Some(StoreError::NotOwner { .. })
        ));
    }

    #[test]
    fn reclaim_emits_reclaimed_then_failed_events() {
        let (_guard, coordinator) = coordinator();
        coordinator.enqueue("echo", json!({})).expect("enqueue");
        let long_ago = Utc::now() - chrono::Duration::seconds(3600);

        coordinator
            .store
            .claim_next("worker-1", long_ago)
            .expect("claim")
            .expect("task");
        coordinator.reclaim_stale(60, 0).expect("exhausted sweep");

        let events = coordinator
            .events
            .read_filtered(&EventFilter {
                event_type: Some("task.reclaim_failed".to_string()),
                ..EventFilter::default()
            })
            .expect("events");
        assert_eq!(events.len(), 1);
    }
}

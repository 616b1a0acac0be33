//! Worker poll loop: claims are paced by available slots, each task runs on
//! its own tokio task, and a termination signal opens a short grace window
//! before in-flight work is abandoned to the reclaimer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use gaia_store::{StoreError, Task};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::coordinator::Coordinator;

/// Agent bodies implement this; what they do with a task is their business.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_jobs: usize,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_jobs: 2,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub struct Worker {
    coordinator: Coordinator,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(coordinator: Coordinator, handler: Arc<dyn TaskHandler>, config: WorkerConfig) -> Self {
        Self {
            coordinator,
            handler,
            config,
        }
    }

    /// Polls for claims until `shutdown` flips to true, then waits out the
    /// grace window for in-flight tasks before abandoning them.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut jobs: JoinSet<()> = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished slots without blocking.
            while jobs.try_join_next().is_some() {}

            let mut claimed_any = false;
            while jobs.len() < self.config.max_jobs {
                let Some(task) = self.coordinator.claim(&self.config.worker_id)? else {
                    break;
                };
                claimed_any = true;
                let coordinator = self.coordinator.clone();
                let handler = Arc::clone(&self.handler);
                let worker_id = self.config.worker_id.clone();
                jobs.spawn(async move {
                    run_one(&coordinator, handler.as_ref(), &worker_id, task).await;
                });
            }

            if !claimed_any {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        let drain = async {
            while jobs.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id = %self.config.worker_id,
                "shutdown grace elapsed, abandoning in-flight tasks to the reclaimer"
            );
            jobs.abort_all();
        }
        Ok(())
    }
}

async fn run_one(coordinator: &Coordinator, handler: &dyn TaskHandler, worker_id: &str, task: Task) {
    let task_id = task.id;
    let settle = match handler.handle(&task).await {
        Ok(result) => coordinator.complete(task_id, worker_id, result),
        Err(error) => coordinator.fail(task_id, worker_id, &error.to_string()),
    };
    if let Err(error) = settle {
        // A reclaimed task may have been settled by someone else meanwhile.
        match error.downcast_ref::<StoreError>() {
            Some(StoreError::AlreadyTerminal { .. }) | Some(StoreError::NotOwner { .. }) => {
                tracing::debug!(task_id, worker_id, %error, "task settled elsewhere");
            }
            _ => {
                tracing::error!(task_id, worker_id, %error, "failed to settle task");
            }
        }
    }
}

/// Periodic stale-lease sweep; one long-running task per process.
pub async fn run_reclaimer(
    coordinator: Coordinator,
    ttl_seconds: u64,
    max_attempts: u32,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match coordinator.reclaim_stale(ttl_seconds, max_attempts) {
            Ok(report) if !report.reclaimed_ids.is_empty() || !report.failed_ids.is_empty() => {
                tracing::info!(
                    reclaimed = report.reclaimed_ids.len(),
                    failed = report.failed_ids.len(),
                    "stale-lease sweep"
                );
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "stale-lease sweep failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

//! Single-instance agent enforcement and supervised process spawning.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use gaia_events::{EventLog, EventRecord};
use gaia_store::{SqliteStore, StoreError};
use serde_json::json;
use tokio::process::{Child, Command};

const EVENT_SOURCE: &str = "agent-supervisor";

/// Retry tuning for platform operations (process spawn, child supervision).
#[derive(Debug, Clone, Copy)]
pub struct SpawnRetryConfig {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for SpawnRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Runs `operation` up to `attempts` times with exponential backoff, doubling
/// the delay each attempt; the last error is returned.
pub async fn retry_with_backoff<T, F, Fut>(config: SpawnRetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.attempts.max(1);
    let mut backoff = config.base_backoff;
    let mut last_error = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                tracing::warn!(attempt, attempts, %error, "operation failed, backing off");
                last_error = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("operation failed with no attempts")))
}

/// Platform-appropriate process-exists probe.
pub fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        return Path::new(&format!("/proc/{pid}")).exists();
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// A successfully started, registered agent process.
#[derive(Debug)]
pub struct AgentHandle {
    pub agent_id: String,
    pub child: Child,
}

/// Starts agents at most once per logical id, backed by the `agents_state`
/// registration rows.
#[derive(Clone)]
pub struct AgentSupervisor {
    store: SqliteStore,
    events: EventLog,
    retry: SpawnRetryConfig,
}

impl AgentSupervisor {
    pub fn new(store: SqliteStore, events: EventLog, retry: SpawnRetryConfig) -> Self {
        Self {
            store,
            events,
            retry,
        }
    }

    /// Starts `program args…` as agent `agent_id` unless a live predecessor is
    /// registered, in which case the start is refused and `agent.start.skipped`
    /// is emitted. Registration is claimed before the spawn so concurrent
    /// start attempts cannot race past each other.
    pub async fn start_agent(
        &self,
        agent_id: &str,
        program: &str,
        args: &[String],
    ) -> Result<AgentHandle> {
        let registration =
            self.store
                .register_agent(agent_id, std::process::id(), Utc::now(), process_alive);
        match registration {
            Ok(_) => {}
            Err(StoreError::AgentAlreadyRunning { pid, .. }) => {
                self.events.append(
                    EventRecord::new("agent.start.skipped", EVENT_SOURCE)
                        .target(agent_id)
                        .payload(json!({ "reason": "already_running", "pid": pid })),
                )?;
                return Err(StoreError::AgentAlreadyRunning {
                    agent_id: agent_id.to_string(),
                    pid,
                }
                .into());
            }
            Err(other) => return Err(other.into()),
        }

        let spawn_result = retry_with_backoff(self.retry, || async {
            Command::new(program)
                .args(args)
                .spawn()
                .with_context(|| format!("failed to spawn agent '{agent_id}' ({program})"))
        })
        .await;

        let child = match spawn_result {
            Ok(child) => child,
            Err(error) => {
                // Give the slot back so a later start can succeed.
                self.store.clear_agent(agent_id)?;
                return Err(error);
            }
        };
        if let Some(pid) = child.id() {
            self.store.update_agent_pid(agent_id, pid)?;
        }
        self.events.append(
            EventRecord::new("agent.started", EVENT_SOURCE)
                .target(agent_id)
                .payload(json!({ "pid": child.id() })),
        )?;
        Ok(AgentHandle {
            agent_id: agent_id.to_string(),
            child,
        })
    }

    /// Releases the registration after the agent's terminal transition.
    pub fn stop_agent(&self, agent_id: &str) -> Result<()> {
        self.store.clear_agent(agent_id)?;
        Ok(())
    }
}

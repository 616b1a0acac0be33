//! Durable store abstractions for the gaia orchestrator.
//!
//! One SQLite file owns every persisted row: the task queue, pending
//! approval commands, audit trail, callback seen-set, rate-limit windows,
//! and agent registrations. Components receive values by copy and submit
//! compound transitions that commit or roll back as a unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod sqlite;

pub use sqlite::{SqliteStore, DEFAULT_LOCK_TIMEOUT_SECS};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(i64),
    #[error("task {task_id} is owned by another worker (caller '{worker_id}')")]
    NotOwner { task_id: i64, worker_id: String },
    #[error("task {task_id} already reached terminal state {state:?}")]
    AlreadyTerminal { task_id: i64, state: TaskState },
    #[error("pending command '{0}' not found")]
    PendingNotFound(String),
    #[error("invalid pending transition: {from:?} -> {to:?}")]
    InvalidPendingTransition { from: PendingState, to: PendingState },
    #[error("pending command '{0}' is not approved")]
    NotApproved(String),
    #[error("agent '{agent_id}' already running with pid {pid}")]
    AgentAlreadyRunning { agent_id: String, pid: u32 },
    #[error("store busy: no progress within {timeout_secs}s lock timeout")]
    Busy { timeout_secs: u64 },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A row in the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: String,
    pub payload: Value,
    pub state: TaskState,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub reclaim_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a stale-task sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed_ids: Vec<i64>,
    pub failed_ids: Vec<i64>,
}

/// State of a chat-originated pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    Pending,
    Approved,
    Denied,
    Postponed,
    Expired,
    ExecutedDryrun,
    Executed,
    Failed,
}

impl PendingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Postponed => "postponed",
            Self::Expired => "expired",
            Self::ExecutedDryrun => "executed_dryrun",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "postponed" => Some(Self::Postponed),
            "expired" => Some(Self::Expired),
            "executed_dryrun" => Some(Self::ExecutedDryrun),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Denied | Self::Expired | Self::ExecutedDryrun | Self::Executed | Self::Failed
        )
    }

    /// The approval state machine is a DAG; `expired` is reachable only from
    /// `pending`, and `executed*` only from `approved`.
    pub fn can_transition_to(self, to: PendingState) -> bool {
        match self {
            Self::Pending => matches!(
                to,
                Self::Approved | Self::Denied | Self::Postponed | Self::Expired
            ),
            Self::Approved => {
                matches!(to, Self::ExecutedDryrun | Self::Executed | Self::Failed)
            }
            // Manual re-wake via admin action only.
            Self::Postponed => matches!(to, Self::Pending),
            Self::Denied
            | Self::Expired
            | Self::ExecutedDryrun
            | Self::Executed
            | Self::Failed => false,
        }
    }
}

/// Named flags carried by a pending command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOptions {
    /// On approve, automatically invoke execute when the execution switch is on.
    #[serde(default)]
    pub exec_request: bool,
    /// Presentational: outbound message adds a warning banner and disables proceed.
    #[serde(default)]
    pub is_test: bool,
}

/// A chat-originated request held durably until an approver decides its fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    pub command: String,
    pub from: Value,
    pub status: PendingState,
    pub options: PendingOptions,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Fields supplied when a new pending command is enqueued.
#[derive(Debug, Clone)]
pub struct NewPendingCommand {
    pub chat_id: String,
    pub message_id: String,
    pub command: String,
    pub from: Value,
    pub options: PendingOptions,
}

/// Outcome of recording an execution attempt on an approved command.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub state: PendingState,
    pub rc: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

/// Status written on every privileged operation, including refused ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Unauthorized,
    Failed,
    Timeout,
    Skipped,
    Error,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unauthorized => "unauthorized",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

/// One structured trace row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub status: String,
    pub details: Value,
}

/// Row guarding single-instance agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Verdict of the persisted sliding-window rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &error {
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::Busy { timeout_secs: 0 };
            }
        }
        StoreError::Sqlite(error)
    }
}

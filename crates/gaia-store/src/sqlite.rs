//! SQLite-backed store with durable compound transitions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gaia_core::{format_timestamp, parse_timestamp};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

use crate::{
    AgentRegistration, AuditRow, AuditStatus, ExecutionRecord, NewPendingCommand, PendingCommand,
    PendingOptions, PendingState, RateDecision, ReclaimReport, StoreError, StoreResult, Task,
    TaskState,
};

/// Default contention timeout, overridable via `CLAIMS_LOCK_TIMEOUT`.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 5;

/// Persistent SQLite store; the single coordination point between components.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    lock_timeout_secs: u64,
}

impl SqliteStore {
    /// Opens (or creates) the store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    /// Opens the store with an explicit contention timeout in seconds.
    pub fn with_lock_timeout(path: impl AsRef<Path>, lock_timeout_secs: u64) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            db_path,
            lock_timeout_secs,
        };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(self.lock_timeout_secs))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL,
                worker_id TEXT NULL,
                claimed_at TEXT NULL,
                started_at TEXT NULL,
                reclaim_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT NULL,
                result TEXT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_state ON queue (state, id);

            CREATE TABLE IF NOT EXISTS pending_commands (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                command TEXT NOT NULL,
                from_json TEXT NOT NULL,
                status TEXT NOT NULL,
                exec_request INTEGER NOT NULL DEFAULT 0,
                is_test INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                approved_at TEXT NULL,
                approved_by TEXT NULL,
                denied_at TEXT NULL,
                denied_by TEXT NULL,
                executed_at TEXT NULL,
                expired_at TEXT NULL,
                posted_at TEXT NULL,
                rc INTEGER NULL,
                stdout TEXT NULL,
                stderr TEXT NULL,
                last_error TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_status
                ON pending_commands (status, created_at);

            CREATE TABLE IF NOT EXISTS command_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS approvals (
                callback_id TEXT PRIMARY KEY,
                seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instruct_rate (
                key TEXT PRIMARY KEY,
                window_start INTEGER NOT NULL,
                hits INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents_state (
                agent_id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                started_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS traces (
                idempotency_key TEXT PRIMARY KEY,
                pending_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backlog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn busy(&self, error: StoreError) -> StoreError {
        match error {
            StoreError::Busy { .. } => StoreError::Busy {
                timeout_secs: self.lock_timeout_secs,
            },
            other => other,
        }
    }

    // ----- task queue -----

    /// Inserts a new pending task and returns its id.
    pub fn enqueue_task(&self, task_type: &str, payload: &Value) -> StoreResult<i64> {
        let connection = self.open_connection()?;
        connection
            .execute(
                r#"
                INSERT INTO queue (task_type, payload, state, created_at)
                VALUES (?1, ?2, 'pending', ?3)
                "#,
                params![
                    task_type,
                    serde_json::to_string(payload)?,
                    format_timestamp(Utc::now())
                ],
            )
            .map_err(|error| self.busy(error.into()))?;
        Ok(connection.last_insert_rowid())
    }

    /// Atomically pops the oldest pending task for `worker_id`. Returns `None`
    /// when the queue is empty; no two concurrent callers receive the same row.
    pub fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let mut connection = self.open_connection()?;
        let result = (|| -> StoreResult<Option<Task>> {
            loop {
                let transaction =
                    connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let candidate: Option<i64> = transaction
                    .query_row(
                        "SELECT id FROM queue WHERE state = 'pending' ORDER BY id LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(task_id) = candidate else {
                    transaction.commit()?;
                    return Ok(None);
                };

                let now_db = format_timestamp(now);
                let changed = transaction.execute(
                    r#"
                    UPDATE queue
                    SET state = 'in_progress', worker_id = ?1, claimed_at = ?2, started_at = ?2
                    WHERE id = ?3 AND state = 'pending'
                    "#,
                    params![worker_id, now_db, task_id],
                )?;
                if changed == 0 {
                    // Lost the row to a concurrent claimer; retry from the top.
                    transaction.commit()?;
                    continue;
                }

                insert_audit(
                    &transaction,
                    now,
                    worker_id,
                    "claim",
                    AuditStatus::Ok,
                    &serde_json::json!({ "task_id": task_id }),
                )?;
                let task = read_task(&transaction, task_id)?
                    .ok_or(StoreError::TaskNotFound(task_id))?;
                transaction.commit()?;
                return Ok(Some(task));
            }
        })();
        result.map_err(|error| self.busy(error))
    }

    /// Transitions a claimed task to `completed`. Only the claiming worker may
    /// call this; re-submits after a terminal transition report `AlreadyTerminal`.
    pub fn complete_task(&self, task_id: i64, worker_id: &str, result: Value) -> StoreResult<Task> {
        self.mark_terminal(task_id, worker_id, TaskState::Completed, Some(result), None)
    }

    /// Transitions a claimed task to `failed` with `error` recorded.
    pub fn fail_task(&self, task_id: i64, worker_id: &str, error: &str) -> StoreResult<Task> {
        self.mark_terminal(
            task_id,
            worker_id,
            TaskState::Failed,
            None,
            Some(error.to_string()),
        )
    }

    fn mark_terminal(
        &self,
        task_id: i64,
        worker_id: &str,
        state: TaskState,
        result: Option<Value>,
        error: Option<String>,
    ) -> StoreResult<Task> {
        debug_assert!(state.is_terminal());
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<Task> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current =
                read_task(&transaction, task_id)?.ok_or(StoreError::TaskNotFound(task_id))?;
            if current.state.is_terminal() {
                return Err(StoreError::AlreadyTerminal {
                    task_id,
                    state: current.state,
                });
            }
            if current.worker_id.as_deref() != Some(worker_id) {
                let now = Utc::now();
                insert_audit(
                    &transaction,
                    now,
                    worker_id,
                    terminal_action(state),
                    AuditStatus::Failed,
                    &serde_json::json!({ "task_id": task_id, "reason": "not_owner" }),
                )?;
                transaction.commit()?;
                return Err(StoreError::NotOwner {
                    task_id,
                    worker_id: worker_id.to_string(),
                });
            }

            let result_json = result.as_ref().map(serde_json::to_string).transpose()?;
            transaction.execute(
                "UPDATE queue SET state = ?1, result = ?2, last_error = ?3 WHERE id = ?4",
                params![state.as_str(), result_json, error, task_id],
            )?;
            let now = Utc::now();
            insert_audit(
                &transaction,
                now,
                worker_id,
                terminal_action(state),
                AuditStatus::Ok,
                &serde_json::json!({ "task_id": task_id }),
            )?;
            let task =
                read_task(&transaction, task_id)?.ok_or(StoreError::TaskNotFound(task_id))?;
            transaction.commit()?;
            Ok(task)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Returns every `in_progress` task whose lease expired to `pending`, or to
    /// `failed` once `max_attempts` reclaims are exhausted.
    pub fn reclaim_stale(
        &self,
        ttl_seconds: u64,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ReclaimReport> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<ReclaimReport> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cutoff = format_timestamp(now - ChronoDuration::seconds(ttl_seconds as i64));

            let stale: Vec<(i64, u32)> = {
                let mut statement = transaction.prepare(
                    r#"
                    SELECT id, reclaim_attempts FROM queue
                    WHERE state = 'in_progress' AND started_at IS NOT NULL AND started_at < ?1
                    ORDER BY id
                    "#,
                )?;
                let rows = statement.query_map(params![cutoff], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u32))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let mut report = ReclaimReport::default();
            for (task_id, attempts) in stale {
                if attempts < max_attempts {
                    transaction.execute(
                        r#"
                        UPDATE queue
                        SET state = 'pending', worker_id = NULL, claimed_at = NULL,
                            started_at = NULL, reclaim_attempts = reclaim_attempts + 1
                        WHERE id = ?1
                        "#,
                        params![task_id],
                    )?;
                    insert_audit(
                        &transaction,
                        now,
                        "reclaimer",
                        "reclaim",
                        AuditStatus::Ok,
                        &serde_json::json!({ "task_id": task_id, "attempt": attempts + 1 }),
                    )?;
                    report.reclaimed_ids.push(task_id);
                } else {
                    transaction.execute(
                        r#"
                        UPDATE queue
                        SET state = 'failed', last_error = 'reclaim_exhausted'
                        WHERE id = ?1
                        "#,
                        params![task_id],
                    )?;
                    insert_audit(
                        &transaction,
                        now,
                        "reclaimer",
                        "reclaim_failed",
                        AuditStatus::Failed,
                        &serde_json::json!({ "task_id": task_id, "attempts": attempts }),
                    )?;
                    report.failed_ids.push(task_id);
                }
            }
            transaction.commit()?;
            Ok(report)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Lists tasks, optionally filtered by state, oldest first.
    pub fn list_tasks(&self, state: Option<TaskState>) -> StoreResult<Vec<Task>> {
        let connection = self.open_connection()?;
        let mut tasks = Vec::new();
        match state {
            Some(state) => {
                let mut statement = connection
                    .prepare("SELECT id FROM queue WHERE state = ?1 ORDER BY id")?;
                let ids = statement
                    .query_map(params![state.as_str()], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                for id in ids {
                    if let Some(task) = read_task(&connection, id)? {
                        tasks.push(task);
                    }
                }
            }
            None => {
                let mut statement = connection.prepare("SELECT id FROM queue ORDER BY id")?;
                let ids = statement
                    .query_map([], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                for id in ids {
                    if let Some(task) = read_task(&connection, id)? {
                        tasks.push(task);
                    }
                }
            }
        }
        Ok(tasks)
    }

    pub fn get_task(&self, task_id: i64) -> StoreResult<Option<Task>> {
        let connection = self.open_connection()?;
        read_task(&connection, task_id)
    }

    // ----- pending commands -----

    /// Inserts a new pending command, replay-safe when `idempotency_key` was
    /// seen before (the previously created command is returned unchanged).
    pub fn enqueue_pending(
        &self,
        id: &str,
        command: NewPendingCommand,
        idempotency_key: Option<&str>,
    ) -> StoreResult<PendingCommand> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<PendingCommand> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(key) = idempotency_key {
                let existing: Option<String> = transaction
                    .query_row(
                        "SELECT pending_id FROM traces WHERE idempotency_key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing_id) = existing {
                    let pending = read_pending(&transaction, &existing_id)?
                        .ok_or_else(|| StoreError::PendingNotFound(existing_id))?;
                    transaction.commit()?;
                    return Ok(pending);
                }
            }

            let now = Utc::now();
            let now_db = format_timestamp(now);
            transaction.execute(
                r#"
                INSERT INTO pending_commands (
                    id, chat_id, message_id, command, from_json, status,
                    exec_request, is_test, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8)
                "#,
                params![
                    id,
                    command.chat_id,
                    command.message_id,
                    command.command,
                    serde_json::to_string(&command.from)?,
                    command.options.exec_request as i64,
                    command.options.is_test as i64,
                    now_db
                ],
            )?;
            if let Some(key) = idempotency_key {
                transaction.execute(
                    "INSERT INTO traces (idempotency_key, pending_id, created_at) VALUES (?1, ?2, ?3)",
                    params![key, id, now_db],
                )?;
            }
            let pending = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            transaction.commit()?;
            Ok(pending)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    pub fn get_pending(&self, id: &str) -> StoreResult<Option<PendingCommand>> {
        let connection = self.open_connection()?;
        read_pending(&connection, id)
    }

    /// Resolves a command by exact id or unique id prefix (textual approvals
    /// reference ids by their first hex characters).
    pub fn find_pending_by_prefix(&self, prefix: &str) -> StoreResult<Option<PendingCommand>> {
        let connection = self.open_connection()?;
        let ids: Vec<String> = {
            let mut statement = connection
                .prepare("SELECT id FROM pending_commands WHERE id LIKE ?1 ORDER BY created_at")?;
            let pattern = format!("{}%", prefix.replace(['%', '_'], ""));
            let rows = statement.query_map(params![pattern], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        match ids.as_slice() {
            [only] => read_pending(&connection, only),
            _ => Ok(None),
        }
    }

    pub fn list_pending(&self, status: Option<PendingState>) -> StoreResult<Vec<PendingCommand>> {
        let connection = self.open_connection()?;
        let ids: Vec<String> = match status {
            Some(status) => {
                let mut statement = connection.prepare(
                    "SELECT id FROM pending_commands WHERE status = ?1 ORDER BY created_at, id",
                )?;
                let rows = statement.query_map(params![status.as_str()], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut statement = connection
                    .prepare("SELECT id FROM pending_commands ORDER BY created_at, id")?;
                let rows = statement.query_map([], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        let mut pendings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pending) = read_pending(&connection, &id)? {
                pendings.push(pending);
            }
        }
        Ok(pendings)
    }

    /// Compare-and-swap transition on the pending DAG; the audit row and the
    /// timeline column for `to` commit in the same transaction.
    pub fn transition_pending(
        &self,
        id: &str,
        from: PendingState,
        to: PendingState,
        actor: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PendingCommand> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<PendingCommand> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            if current.status != from || !from.can_transition_to(to) {
                return Err(StoreError::InvalidPendingTransition {
                    from: current.status,
                    to,
                });
            }

            let now_db = format_timestamp(now);
            match to {
                PendingState::Approved => {
                    transaction.execute(
                        "UPDATE pending_commands SET status = ?1, approved_at = ?2, approved_by = ?3 WHERE id = ?4",
                        params![to.as_str(), now_db, actor, id],
                    )?;
                }
                PendingState::Denied => {
                    transaction.execute(
                        "UPDATE pending_commands SET status = ?1, denied_at = ?2, denied_by = ?3 WHERE id = ?4",
                        params![to.as_str(), now_db, actor, id],
                    )?;
                }
                PendingState::Expired => {
                    transaction.execute(
                        "UPDATE pending_commands SET status = ?1, expired_at = ?2 WHERE id = ?3",
                        params![to.as_str(), now_db, id],
                    )?;
                }
                _ => {
                    transaction.execute(
                        "UPDATE pending_commands SET status = ?1 WHERE id = ?2",
                        params![to.as_str(), id],
                    )?;
                }
            }
            insert_audit(
                &transaction,
                now,
                actor,
                transition_action(to),
                AuditStatus::Ok,
                &serde_json::json!({ "pending_id": id, "from": from.as_str(), "to": to.as_str() }),
            )?;
            let pending = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            transaction.commit()?;
            Ok(pending)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Records the outcome of executing an approved command. `executed*` and
    /// `failed` are only reachable from `approved`.
    pub fn record_execution(
        &self,
        id: &str,
        record: ExecutionRecord,
        actor: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<PendingCommand> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<PendingCommand> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            if current.status != PendingState::Approved {
                return Err(StoreError::NotApproved(id.to_string()));
            }
            if !PendingState::Approved.can_transition_to(record.state) {
                return Err(StoreError::InvalidPendingTransition {
                    from: current.status,
                    to: record.state,
                });
            }

            transaction.execute(
                r#"
                UPDATE pending_commands
                SET status = ?1, executed_at = ?2, rc = ?3, stdout = ?4, stderr = ?5,
                    last_error = ?6
                WHERE id = ?7
                "#,
                params![
                    record.state.as_str(),
                    format_timestamp(now),
                    record.rc,
                    record.stdout,
                    record.stderr,
                    record.error,
                    id
                ],
            )?;
            let status = if record.state == PendingState::Failed {
                AuditStatus::Failed
            } else {
                AuditStatus::Ok
            };
            insert_audit(
                &transaction,
                now,
                actor,
                "execute",
                status,
                &serde_json::json!({
                    "pending_id": id,
                    "state": record.state.as_str(),
                    "rc": record.rc,
                }),
            )?;
            let pending = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            transaction.commit()?;
            Ok(pending)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Flips one named option on a pending command; every toggle is audited.
    pub fn toggle_pending_option(
        &self,
        id: &str,
        option: &str,
        actor: &str,
    ) -> StoreResult<PendingCommand> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<PendingCommand> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            let column = match option {
                "exec_request" => "exec_request",
                "is_test" => "is_test",
                other => {
                    return Err(StoreError::InvalidPersistedValue {
                        field: "option",
                        value: other.to_string(),
                    });
                }
            };
            let new_value = match column {
                "exec_request" => !current.options.exec_request,
                _ => !current.options.is_test,
            };
            transaction.execute(
                &format!("UPDATE pending_commands SET {column} = ?1 WHERE id = ?2"),
                params![new_value as i64, id],
            )?;
            insert_audit(
                &transaction,
                Utc::now(),
                actor,
                "toggle_option",
                AuditStatus::Ok,
                &serde_json::json!({ "pending_id": id, "option": option, "value": new_value }),
            )?;
            let pending = read_pending(&transaction, id)?
                .ok_or_else(|| StoreError::PendingNotFound(id.to_string()))?;
            transaction.commit()?;
            Ok(pending)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Expires pending commands older than the retention window. Expired rows
    /// are retained for history; returns the ids that moved.
    pub fn expire_old(&self, retention_days: u32, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<Vec<String>> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cutoff =
                format_timestamp(now - ChronoDuration::days(i64::from(retention_days)));
            let expired: Vec<String> = {
                let mut statement = transaction.prepare(
                    "SELECT id FROM pending_commands WHERE status = 'pending' AND created_at < ?1",
                )?;
                let rows = statement.query_map(params![cutoff], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let now_db = format_timestamp(now);
            for id in &expired {
                transaction.execute(
                    "UPDATE pending_commands SET status = 'expired', expired_at = ?1 WHERE id = ?2",
                    params![now_db, id],
                )?;
                insert_audit(
                    &transaction,
                    now,
                    "retention-sweep",
                    "expire",
                    AuditStatus::Ok,
                    &serde_json::json!({ "pending_id": id }),
                )?;
            }
            transaction.commit()?;
            Ok(expired)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Best-effort re-notify hint; not a delivery guarantee.
    pub fn mark_posted(&self, id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "UPDATE pending_commands SET posted_at = ?1 WHERE id = ?2",
            params![format_timestamp(now), id],
        )?;
        Ok(())
    }

    // ----- callback dedup -----

    /// Records a callback-query id in the persistent seen-set. Returns `false`
    /// when the id was already present (provider re-delivery).
    pub fn record_callback_seen(&self, callback_id: &str) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection
            .execute(
                "INSERT OR IGNORE INTO approvals (callback_id, seen_at) VALUES (?1, ?2)",
                params![callback_id, format_timestamp(Utc::now())],
            )
            .map_err(|error| self.busy(error.into()))?;
        Ok(inserted > 0)
    }

    // ----- agent registrations -----

    /// Registers `agent_id` with `pid` unless a live predecessor exists; the
    /// liveness probe runs while the registration row is locked.
    pub fn register_agent<F>(
        &self,
        agent_id: &str,
        pid: u32,
        now: DateTime<Utc>,
        liveness: F,
    ) -> StoreResult<AgentRegistration>
    where
        F: Fn(u32) -> bool,
    {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<AgentRegistration> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<i64> = transaction
                .query_row(
                    "SELECT pid FROM agents_state WHERE agent_id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing_pid) = existing {
                let existing_pid = existing_pid as u32;
                if liveness(existing_pid) {
                    return Err(StoreError::AgentAlreadyRunning {
                        agent_id: agent_id.to_string(),
                        pid: existing_pid,
                    });
                }
            }
            let now_db = format_timestamp(now);
            transaction.execute(
                r#"
                INSERT INTO agents_state (agent_id, pid, started_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(agent_id) DO UPDATE SET
                    pid = excluded.pid, started_at = excluded.started_at
                "#,
                params![agent_id, i64::from(pid), now_db],
            )?;
            transaction.commit()?;
            Ok(AgentRegistration {
                agent_id: agent_id.to_string(),
                pid,
                started_at: now,
            })
        })();
        outcome.map_err(|error| self.busy(error))
    }

    /// Replaces the recorded pid once the agent process is actually spawned.
    pub fn update_agent_pid(&self, agent_id: &str, pid: u32) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "UPDATE agents_state SET pid = ?1 WHERE agent_id = ?2",
            params![i64::from(pid), agent_id],
        )?;
        Ok(())
    }

    /// Removes a registration; only the owner's terminal transition or an
    /// explicit admin operation calls this.
    pub fn clear_agent(&self, agent_id: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            "DELETE FROM agents_state WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentRegistration>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                "SELECT agent_id, pid, started_at FROM agents_state WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(agent_id, pid, started_at)| {
            Ok(AgentRegistration {
                agent_id,
                pid: pid as u32,
                started_at: parse_timestamp(&started_at)?,
            })
        })
        .transpose()
    }

    // ----- rate limiting -----

    /// Persisted sliding-window limiter keyed by caller; restarts do not
    /// reset windows.
    pub fn instruct_rate_check(
        &self,
        key: &str,
        window_secs: u64,
        max_hits: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<RateDecision> {
        let mut connection = self.open_connection()?;
        let outcome = (|| -> StoreResult<RateDecision> {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_unix = now.timestamp().max(0) as u64;
            let row: Option<(u64, u32)> = transaction
                .query_row(
                    "SELECT window_start, hits FROM instruct_rate WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u32)),
                )
                .optional()?;

            let decision = match row {
                Some((window_start, hits))
                    if now_unix < window_start.saturating_add(window_secs) =>
                {
                    if hits >= max_hits {
                        RateDecision {
                            allowed: false,
                            retry_after_secs: window_start
                                .saturating_add(window_secs)
                                .saturating_sub(now_unix),
                        }
                    } else {
                        transaction.execute(
                            "UPDATE instruct_rate SET hits = hits + 1 WHERE key = ?1",
                            params![key],
                        )?;
                        RateDecision {
                            allowed: true,
                            retry_after_secs: 0,
                        }
                    }
                }
                _ => {
                    transaction.execute(
                        r#"
                        INSERT INTO instruct_rate (key, window_start, hits) VALUES (?1, ?2, 1)
                        ON CONFLICT(key) DO UPDATE SET
                            window_start = excluded.window_start, hits = 1
                        "#,
                        params![key, now_unix as i64],
                    )?;
                    RateDecision {
                        allowed: true,
                        retry_after_secs: 0,
                    }
                }
            };
            transaction.commit()?;
            Ok(decision)
        })();
        outcome.map_err(|error| self.busy(error))
    }

    // ----- audit -----

    /// Standalone audit write for operations with no surrounding transaction.
    pub fn write_audit(
        &self,
        actor: &str,
        action: &str,
        status: AuditStatus,
        details: &Value,
    ) -> StoreResult<()> {
        let connection = self.open_connection()?;
        insert_audit(&connection, Utc::now(), actor, action, status, details)
            .map_err(|error| self.busy(error))
    }

    /// Most recent audit rows, newest first.
    pub fn list_audit(&self, limit: usize) -> StoreResult<Vec<AuditRow>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT timestamp, actor, action, status, details FROM command_audit ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = statement.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut audit = Vec::new();
        for row in rows {
            let (timestamp, actor, action, status, details) = row?;
            audit.push(AuditRow {
                timestamp: parse_timestamp(&timestamp)?,
                actor,
                action,
                status,
                details: serde_json::from_str(&details)?,
            });
        }
        Ok(audit)
    }
}

fn terminal_action(state: TaskState) -> &'static str {
    match state {
        TaskState::Completed => "complete",
        _ => "fail",
    }
}

fn transition_action(to: PendingState) -> &'static str {
    match to {
        PendingState::Approved => "approve",
        PendingState::Denied => "deny",
        PendingState::Postponed => "postpone",
        PendingState::Expired => "expire",
        PendingState::Pending => "rewake",
        PendingState::ExecutedDryrun | PendingState::Executed | PendingState::Failed => "execute",
    }
}

fn insert_audit(
    connection: &Connection,
    now: DateTime<Utc>,
    actor: &str,
    action: &str,
    status: AuditStatus,
    details: &Value,
) -> StoreResult<()> {
    connection.execute(
        r#"
        INSERT INTO command_audit (timestamp, actor, action, status, details)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            format_timestamp(now),
            actor,
            action,
            status.as_str(),
            serde_json::to_string(details)?
        ],
    )?;
    Ok(())
}

fn read_task(connection: &Connection, task_id: i64) -> StoreResult<Option<Task>> {
    let row = connection
        .query_row(
            r#"
            SELECT id, task_type, payload, state, worker_id, claimed_at, started_at,
                   reclaim_attempts, last_error, result, created_at
            FROM queue WHERE id = ?1
            "#,
            params![task_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(
            id,
            task_type,
            payload,
            state,
            worker_id,
            claimed_at,
            started_at,
            reclaim_attempts,
            last_error,
            result,
            created_at,
        )| {
            Ok(Task {
                id,
                task_type,
                payload: serde_json::from_str(&payload)?,
                state: TaskState::parse(&state).ok_or(StoreError::InvalidPersistedValue {
                    field: "queue.state",
                    value: state,
                })?,
                worker_id,
                claimed_at: claimed_at.as_deref().map(parse_timestamp).transpose()?,
                started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
                reclaim_attempts: reclaim_attempts as u32,
                last_error,
                result: result.as_deref().map(serde_json::from_str).transpose()?,
                created_at: parse_timestamp(&created_at)?,
            })
        },
    )
    .transpose()
}

fn read_pending(connection: &Connection, id: &str) -> StoreResult<Option<PendingCommand>> {
    let row = connection
        .query_row(
            r#"
            SELECT id, chat_id, message_id, command, from_json, status, exec_request, is_test,
                   created_at, approved_at, approved_by, denied_at, denied_by, executed_at,
                   expired_at, posted_at, rc, stdout, stderr, last_error
            FROM pending_commands WHERE id = ?1
            "#,
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, Option<String>>(13)?,
                    row.get::<_, Option<String>>(14)?,
                    row.get::<_, Option<String>>(15)?,
                    row.get::<_, Option<i64>>(16)?,
                    row.get::<_, Option<String>>(17)?,
                    row.get::<_, Option<String>>(18)?,
                    row.get::<_, Option<String>>(19)?,
                ))
            },
        )
        .optional()?;
    row.map(
        |(
            id,
            chat_id,
            message_id,
            command,
            from_json,
            status,
            exec_request,
            is_test,
            created_at,
            approved_at,
            approved_by,
            denied_at,
            denied_by,
            executed_at,
            expired_at,
            posted_at,
            rc,
            stdout,
            stderr,
            last_error,
        )| {
            Ok(PendingCommand {
                id,
                chat_id,
                message_id,
                command,
                from: serde_json::from_str(&from_json)?,
                status: PendingState::parse(&status).ok_or(StoreError::InvalidPersistedValue {
                    field: "pending_commands.status",
                    value: status,
                })?,
                options: PendingOptions {
                    exec_request: exec_request != 0,
                    is_test: is_test != 0,
                },
                created_at: parse_timestamp(&created_at)?,
                approved_at: approved_at.as_deref().map(parse_timestamp).transpose()?,
                approved_by,
                denied_at: denied_at.as_deref().map(parse_timestamp).transpose()?,
                denied_by,
                executed_at: executed_at.as_deref().map(parse_timestamp).transpose()?,
                expired_at: expired_at.as_deref().map(parse_timestamp).transpose()?,
                posted_at: posted_at.as_deref().map(parse_timestamp).transpose()?,
                rc,
                stdout,
                stderr,
                last_error,
            })
        },
    )
    .transpose()
}

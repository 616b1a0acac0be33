//! The approval pipeline: turns classified updates into pending-command
//! transitions, gates execution behind the process switch, and pushes every
//! acknowledgement through the outbound delivery pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gaia_core::{format_timestamp, idempotency_key, new_trace_id, truncate_bytes};
use gaia_delivery::{Delivery, OutboundAction};
use gaia_events::{EventLog, EventRecord};
use gaia_store::{
    AuditStatus, ExecutionRecord, NewPendingCommand, PendingCommand, PendingState, SqliteStore,
    StoreError,
};
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::classify::{classify, Inbound, Origin, SeqVerb};
use crate::inbound::{InboundQueue, InboundUpdate};

const EVENT_SOURCE: &str = "approval";
const MAX_CAPTURED_OUTPUT_BYTES: usize = 4096;
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Process-wide execution switch, passed in explicitly at construction.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPolicy {
    pub allow_execution: bool,
}

impl ExecutionPolicy {
    /// `ALLOW_COMMAND_EXECUTION=1` enables real execution; anything else is
    /// dry-run only.
    pub fn from_env() -> Self {
        Self {
            allow_execution: std::env::var("ALLOW_COMMAND_EXECUTION")
                .map(|value| value.trim() == "1")
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Principals allowed to approve or deny. Empty means anyone.
    pub approvers: Vec<String>,
    pub retention_days: u32,
    pub exec_timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            approvers: Vec::new(),
            retention_days: DEFAULT_RETENTION_DAYS,
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
        }
    }
}

impl ApprovalConfig {
    /// Reads the comma-separated `GAIA_APPROVERS` list.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("GAIA_APPROVERS") {
            config.approvers = raw
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }
}

#[derive(Clone)]
pub struct ApprovalPipeline {
    store: Arc<SqliteStore>,
    events: EventLog,
    delivery: Delivery,
    inbound: InboundQueue,
    policy: ExecutionPolicy,
    config: ApprovalConfig,
}

impl ApprovalPipeline {
    pub fn new(
        store: Arc<SqliteStore>,
        events: EventLog,
        delivery: Delivery,
        inbound: InboundQueue,
        policy: ExecutionPolicy,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            store,
            events,
            delivery,
            inbound,
            policy,
            config,
        }
    }

    pub fn inbound(&self) -> &InboundQueue {
        &self.inbound
    }

    pub fn allow_execution(&self) -> bool {
        self.policy.allow_execution
    }

    /// Creates a pending command and posts the approval prompt to the chat.
    /// Replays with the same origin and command return the existing row.
    pub async fn request_approval(&self, command: NewPendingCommand) -> Result<PendingCommand> {
        let key = idempotency_key(
            "pending",
            &json!({
                "chat_id": command.chat_id,
                "message_id": command.message_id,
                "command": command.command,
            }),
        );
        let id = uuid::Uuid::new_v4().to_string();
        let pending = self.store.enqueue_pending(&id, command, Some(&key))?;
        if pending.id != id {
            // Replay hit the traces table; the prompt was already posted.
            return Ok(pending);
        }
        self.events.append(
            EventRecord::new("command.pending", EVENT_SOURCE)
                .target(&pending.chat_id)
                .trace_id(new_trace_id())
                .payload(json!({ "pending_id": pending.id, "command": pending.command })),
        )?;
        self.delivery
            .dispatch(
                OutboundAction::SendMessage {
                    chat_id: pending.chat_id.clone(),
                    text: approval_prompt(&pending),
                    reply_markup: Some(approval_keyboard(&pending)),
                },
                None,
            )
            .await?;
        self.store.mark_posted(&pending.id, Utc::now())?;
        Ok(pending)
    }

    /// Applies one popped inbound update. Errors bubble to the processor
    /// loop, which requeues with backoff.
    pub async fn process_update(&self, update: &InboundUpdate) -> Result<()> {
        let trace_id = new_trace_id();
        match classify(&update.payload) {
            Inbound::Approve {
                origin,
                callback_query_id,
                pending_ref,
            } => {
                self.decide(
                    &origin,
                    callback_query_id.as_deref(),
                    &pending_ref,
                    PendingState::Approved,
                    &trace_id,
                )
                .await
            }
            Inbound::Deny {
                origin,
                callback_query_id,
                pending_ref,
            } => {
                self.decide(
                    &origin,
                    callback_query_id.as_deref(),
                    &pending_ref,
                    PendingState::Denied,
                    &trace_id,
                )
                .await
            }
            Inbound::Info {
                origin,
                callback_query_id,
                pending_ref,
            } => self.handle_info(&origin, &callback_query_id, &pending_ref).await,
            Inbound::Proceed {
                origin,
                callback_query_id,
                pending_ref,
            } => {
                self.decide(
                    &origin,
                    Some(&callback_query_id),
                    &pending_ref,
                    PendingState::Approved,
                    &trace_id,
                )
                .await
            }
            Inbound::ProceedDisabled {
                origin: _,
                callback_query_id,
                pending_ref,
            } => {
                self.ack(
                    &callback_query_id,
                    Some("This is a test command; proceed is disabled."),
                )
                .await?;
                tracing::info!(pending_ref, "proceed pressed on a test command");
                Ok(())
            }
            Inbound::Sequence {
                origin,
                callback_query_id,
                verb,
                seq_id,
                step,
                sub,
            } => {
                self.handle_sequence(&origin, &callback_query_id, verb, &seq_id, &step, sub, &trace_id)
                    .await
            }
            Inbound::Input { origin, text } => {
                self.events.append(
                    EventRecord::new("command.input", EVENT_SOURCE)
                        .target(&origin.chat_id)
                        .trace_id(&trace_id)
                        .payload(json!({ "text": text, "from": origin.from })),
                )?;
                Ok(())
            }
            Inbound::Unsupported { origin, detail } => {
                tracing::warn!(detail, "unsupported inbound update");
                self.events.append(
                    EventRecord::new("command.unsupported", EVENT_SOURCE)
                        .target(origin.as_ref().map(|o| o.chat_id.clone()).unwrap_or_default())
                        .trace_id(&trace_id)
                        .payload(json!({ "detail": detail })),
                )?;
                Ok(())
            }
        }
    }

    /// Shared approve/deny path: callback dedup, authorization, transition,
    /// event, acknowledgement, optional auto-execute.
    async fn decide(
        &self,
        origin: &Origin,
        callback_query_id: Option<&str>,
        pending_ref: &str,
        to: PendingState,
        trace_id: &str,
    ) -> Result<()> {
        if let Some(callback_id) = callback_query_id {
            if !self.store.record_callback_seen(callback_id)? {
                // Provider redelivery; acknowledge without re-deciding.
                tracing::debug!(callback_id, "duplicate callback acknowledged");
                return self.ack(callback_id, None).await;
            }
        }
        let verb = if to == PendingState::Approved { "approve" } else { "deny" };
        if !self.is_approver(&origin.principal) {
            self.store.write_audit(
                &origin.principal,
                verb,
                AuditStatus::Unauthorized,
                &json!({ "pending_ref": pending_ref }),
            )?;
            if let Some(callback_id) = callback_query_id {
                self.ack(callback_id, Some("You are not an approver.")).await?;
            }
            return Ok(());
        }
        let Some(pending) = self.store.find_pending_by_prefix(pending_ref)? else {
            if let Some(callback_id) = callback_query_id {
                self.ack(callback_id, Some("Unknown or ambiguous command id.")).await?;
            }
            return Ok(());
        };
        let decided = match self.store.transition_pending(
            &pending.id,
            PendingState::Pending,
            to,
            &origin.principal,
            Utc::now(),
        ) {
            Ok(decided) => decided,
            Err(StoreError::InvalidPendingTransition { from, .. }) => {
                tracing::info!(pending_id = %pending.id, from = from.as_str(), "decision on non-pending command ignored");
                if let Some(callback_id) = callback_query_id {
                    self.ack(callback_id, Some(&format!("Already {}.", from.as_str())))
                        .await?;
                }
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let event_type = if to == PendingState::Approved {
            "command.approved"
        } else {
            "command.denied"
        };
        self.events.append(
            EventRecord::new(event_type, EVENT_SOURCE)
                .target(&decided.chat_id)
                .trace_id(trace_id)
                .payload(json!({
                    "pending_id": decided.id,
                    "command": decided.command,
                    "by": origin.principal,
                })),
        )?;
        if let Some(callback_id) = callback_query_id {
            let ack_text = if to == PendingState::Approved { "Approved." } else { "Denied." };
            self.ack(callback_id, Some(ack_text)).await?;
        }
        self.delivery
            .dispatch(
                OutboundAction::EditMessage {
                    chat_id: decided.chat_id.clone(),
                    message_id: decided.message_id.clone(),
                    text: decision_summary(&decided),
                    reply_markup: None,
                },
                callback_query_id,
            )
            .await?;

        if to == PendingState::Approved && decided.options.exec_request && self.policy.allow_execution
        {
            self.execute(&decided.id, &origin.principal, trace_id).await?;
        }
        Ok(())
    }

    async fn handle_info(
        &self,
        origin: &Origin,
        callback_query_id: &str,
        pending_ref: &str,
    ) -> Result<()> {
        if !self.store.record_callback_seen(callback_query_id)? {
            return self.ack(callback_query_id, None).await;
        }
        self.ack(callback_query_id, None).await?;
        let text = match self.store.find_pending_by_prefix(pending_ref)? {
            Some(pending) => format!(
                "Command {}\nstatus: {}\ncreated: {}\ncommand: {}",
                short_id(&pending.id),
                pending.status.as_str(),
                format_timestamp(pending.created_at),
                pending.command,
            ),
            None => "Unknown or ambiguous command id.".to_string(),
        };
        self.delivery
            .dispatch(
                OutboundAction::SendMessage {
                    chat_id: origin.chat_id.clone(),
                    text,
                    reply_markup: None,
                },
                Some(callback_query_id),
            )
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_sequence(
        &self,
        origin: &Origin,
        callback_query_id: &str,
        verb: SeqVerb,
        seq_id: &str,
        step: &str,
        sub: Option<String>,
        trace_id: &str,
    ) -> Result<()> {
        if !self.store.record_callback_seen(callback_query_id)? {
            return self.ack(callback_query_id, None).await;
        }
        // Sequence steps belong to the dispatcher; route them out as input.
        self.events.append(
            EventRecord::new("command.input", EVENT_SOURCE)
                .target(&origin.chat_id)
                .trace_id(trace_id)
                .payload(json!({
                    "sequence": { "verb": verb.as_str(), "seq_id": seq_id, "step": step, "sub": sub },
                    "from": origin.from,
                })),
        )?;
        self.ack(callback_query_id, None).await
    }

    /// Executes an approved command, or records a dry-run when the switch is
    /// off. Output capture is truncated to 4 KiB per stream.
    pub async fn execute(&self, pending_id: &str, actor: &str, trace_id: &str) -> Result<PendingCommand> {
        let pending = self
            .store
            .get_pending(pending_id)?
            .ok_or_else(|| StoreError::PendingNotFound(pending_id.to_string()))?;

        if !self.policy.allow_execution {
            let recorded = self.store.record_execution(
                pending_id,
                ExecutionRecord {
                    state: PendingState::ExecutedDryrun,
                    rc: None,
                    stdout: None,
                    stderr: None,
                    error: None,
                },
                actor,
                Utc::now(),
            )?;
            self.events.append(
                EventRecord::new("command.executed.dryrun", EVENT_SOURCE)
                    .target(&recorded.chat_id)
                    .trace_id(trace_id)
                    .payload(json!({ "pending_id": recorded.id, "command": recorded.command })),
            )?;
            self.delivery
                .dispatch(
                    OutboundAction::SendMessage {
                        chat_id: recorded.chat_id.clone(),
                        text: format!("DRY RUN — would execute:\n{}", recorded.command),
                        reply_markup: None,
                    },
                    None,
                )
                .await?;
            return Ok(recorded);
        }

        let outcome = self.run_command(&pending.command).await;
        let (record, event_type, status) = match outcome {
            CommandOutcome::Finished { rc, stdout, stderr } => {
                let succeeded = rc == 0;
                (
                    ExecutionRecord {
                        state: if succeeded { PendingState::Executed } else { PendingState::Failed },
                        rc: Some(rc),
                        stdout: Some(stdout),
                        stderr: Some(stderr),
                        error: if succeeded { None } else { Some(format!("exit code {rc}")) },
                    },
                    if succeeded { "command.executed" } else { "command.failed" },
                    if succeeded { AuditStatus::Ok } else { AuditStatus::Failed },
                )
            }
            CommandOutcome::TimedOut => (
                ExecutionRecord {
                    state: PendingState::Failed,
                    rc: None,
                    stdout: None,
                    stderr: None,
                    error: Some(format!(
                        "timed out after {}s",
                        self.config.exec_timeout.as_secs()
                    )),
                },
                "command.failed",
                AuditStatus::Timeout,
            ),
            CommandOutcome::SpawnFailed(error) => (
                ExecutionRecord {
                    state: PendingState::Failed,
                    rc: None,
                    stdout: None,
                    stderr: None,
                    error: Some(error),
                },
                "command.failed",
                AuditStatus::Error,
            ),
        };
        if status != AuditStatus::Ok && status != AuditStatus::Failed {
            self.store.write_audit(
                actor,
                "execute",
                status,
                &json!({ "pending_id": pending_id }),
            )?;
        }
        let recorded = self
            .store
            .record_execution(pending_id, record, actor, Utc::now())?;
        self.events.append(
            EventRecord::new(event_type, EVENT_SOURCE)
                .target(&recorded.chat_id)
                .trace_id(trace_id)
                .payload(json!({
                    "pending_id": recorded.id,
                    "command": recorded.command,
                    "rc": recorded.rc,
                })),
        )?;
        self.delivery
            .dispatch(
                OutboundAction::SendMessage {
                    chat_id: recorded.chat_id.clone(),
                    text: execution_summary(&recorded),
                    reply_markup: None,
                },
                None,
            )
            .await?;
        Ok(recorded)
    }

    async fn run_command(&self, command: &str) -> CommandOutcome {
        // kill_on_drop: a timed-out child must not keep running after the
        // output future is dropped.
        let child = tokio::process::Command::new("sh")
            .arg("-lc")
            .arg(command)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.config.exec_timeout, child).await {
            Ok(Ok(output)) => CommandOutcome::Finished {
                rc: output.status.code().unwrap_or(-1) as i64,
                stdout: truncate_bytes(
                    &String::from_utf8_lossy(&output.stdout),
                    MAX_CAPTURED_OUTPUT_BYTES,
                ),
                stderr: truncate_bytes(
                    &String::from_utf8_lossy(&output.stderr),
                    MAX_CAPTURED_OUTPUT_BYTES,
                ),
            },
            Ok(Err(error)) => CommandOutcome::SpawnFailed(error.to_string()),
            Err(_) => CommandOutcome::TimedOut,
        }
    }

    /// Returns a postponed command to pending. Admin-side only.
    pub fn rewake(&self, pending_id: &str, actor: &str) -> Result<PendingCommand> {
        let pending = self.store.transition_pending(
            pending_id,
            PendingState::Postponed,
            PendingState::Pending,
            actor,
            Utc::now(),
        )?;
        Ok(pending)
    }

    /// Current pendings after the expiry pass, so readers never see items
    /// past retention as still pending.
    pub fn list_pending(&self) -> Result<Vec<PendingCommand>> {
        let expired = self.store.expire_old(self.config.retention_days, Utc::now())?;
        for id in &expired {
            self.events.append(
                EventRecord::new("command.expired", EVENT_SOURCE)
                    .trace_id(new_trace_id())
                    .payload(json!({ "pending_id": id })),
            )?;
        }
        Ok(self.store.list_pending(None)?)
    }

    fn is_approver(&self, principal: &str) -> bool {
        self.config.approvers.is_empty()
            || self.config.approvers.iter().any(|entry| entry == principal)
    }

    async fn ack(&self, callback_query_id: &str, text: Option<&str>) -> Result<()> {
        self.delivery
            .dispatch(
                OutboundAction::AnswerCallback {
                    callback_query_id: callback_query_id.to_string(),
                    text: text.map(str::to_string),
                },
                Some(callback_query_id),
            )
            .await
    }

    /// Pops due inbound updates until the queue is drained, requeueing
    /// failures with backoff.
    pub async fn drain_inbound(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(update) = self.inbound.pop_due(Utc::now())? {
            match self.process_update(&update).await {
                Ok(()) => processed += 1,
                Err(error) => {
                    tracing::warn!(update_id = update.update_id, %error, "inbound update failed");
                    self.inbound.requeue_with_backoff(update, Utc::now())?;
                }
            }
        }
        Ok(processed)
    }

    /// Processor loop: drain, sleep, repeat until shutdown.
    pub async fn run_processor(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(error) = self.drain_inbound().await {
                tracing::warn!(%error, "inbound drain failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Periodic retention sweep; `list_pending` also expires inline.
    pub async fn run_expiry_sweep(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.list_pending() {
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "expiry sweep failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

enum CommandOutcome {
    Finished { rc: i64, stdout: String, stderr: String },
    TimedOut,
    SpawnFailed(String),
}

pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn approval_prompt(pending: &PendingCommand) -> String {
    let mut text = String::new();
    if pending.options.is_test {
        text.push_str("⚠️ TEST COMMAND — will not run against production.\n");
    }
    text.push_str(&format!(
        "Approval requested [{}]\n{}",
        short_id(&pending.id),
        pending.command
    ));
    text
}

/// Inline keyboard for the approval prompt. Test commands get a disabled
/// proceed button instead of a live one.
fn approval_keyboard(pending: &PendingCommand) -> Value {
    let proceed = if pending.options.is_test {
        json!({ "text": "⛔ Proceed (test)", "callback_data": format!("proceed_disabled:{}", pending.id) })
    } else {
        json!({ "text": "▶ Proceed", "callback_data": format!("proceed:{}", pending.id) })
    };
    json!({
        "inline_keyboard": [
            [
                { "text": "✅ Approve", "callback_data": format!("approve:{}", pending.id) },
                { "text": "❌ Deny", "callback_data": format!("deny:{}", pending.id) }
            ],
            [
                { "text": "ℹ Info", "callback_data": format!("info:{}", pending.id) },
                proceed
            ]
        ]
    })
}

fn decision_summary(pending: &PendingCommand) -> String {
    let decided_by = pending
        .approved_by
        .as_deref()
        .or(pending.denied_by.as_deref())
        .unwrap_or("unknown");
    format!(
        "[{}] {} — {} by {}",
        short_id(&pending.id),
        pending.command,
        pending.status.as_str(),
        decided_by
    )
}


fn execution_summary(pending: &PendingCommand) -> String {
    let mut text = format!(
        "[{}] {} — {}",
        short_id(&pending.id),
        pending.command,
        pending.status.as_str()
    );
    if let Some(rc) = pending.rc {
        text.push_str(&format!(" (rc={rc})"));
    }
    if let Some(stdout) = pending.stdout.as_deref() {
        if !stdout.is_empty() {
            text.push_str(&format!("\nstdout:\n{stdout}"));
        }
    }
    if let Some(stderr) = pending.stderr.as_deref() {
        if !stderr.is_empty() {
            text.push_str(&format!("\nstderr:\n{stderr}"));
        }
    }
    if let Some(error) = pending.last_error.as_deref() {
        text.push_str(&format!("\nerror: {error}"));
    }
    text
}

//! Dispatch path and the retry/auto-requeue loops over the durable queues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use gaia_core::{format_timestamp, parse_timestamp};
use gaia_telegram::{ChatApi, ChatApiError};
use serde_json::Value;
use tokio::sync::watch;

use crate::files::JobFile;
use crate::job::{classify, FailureClass, OutboundAction, OutboundJob};
use crate::metrics::{
    MetricsFile, METRIC_ATTEMPT_ERROR, METRIC_ATTEMPT_START, METRIC_ATTEMPT_SUCCEEDED,
    METRIC_MOVED_PERMANENT,
};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Attempts per job per retry-worker pass.
    pub worker_attempts: u32,
    pub worker_base_backoff: Duration,
    pub auto_requeue_max_retries: u32,
    pub auto_requeue_max_age_hours: i64,
    pub auto_requeue_max_per_run: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_attempts: 3,
            worker_base_backoff: Duration::from_millis(500),
            auto_requeue_max_retries: 3,
            auto_requeue_max_age_hours: 72,
            auto_requeue_max_per_run: 10,
        }
    }
}

impl DeliveryConfig {
    /// Applies the `TELEGRAM_RETRY_WORKER_*` and `AUTO_REQUEUE_*` environment
    /// overrides on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(attempts) = env_u64("TELEGRAM_RETRY_WORKER_ATTEMPTS") {
            config.worker_attempts = attempts.clamp(1, 10) as u32;
        }
        if let Some(backoff_ms) = env_u64("TELEGRAM_RETRY_WORKER_BACKOFF_MS") {
            config.worker_base_backoff = Duration::from_millis(backoff_ms.max(1));
        }
        if let Some(retries) = env_u64("AUTO_REQUEUE_MAX_RETRIES") {
            config.auto_requeue_max_retries = retries as u32;
        }
        if let Some(hours) = env_u64("AUTO_REQUEUE_MAX_AGE_HOURS") {
            config.auto_requeue_max_age_hours = hours as i64;
        }
        if let Some(per_run) = env_u64("AUTO_REQUEUE_MAX_PER_RUN") {
            config.auto_requeue_max_per_run = per_run as usize;
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Dead-letter item selector for operator requeue.
#[derive(Debug, Clone)]
pub enum RequeueSelector {
    Index(usize),
    Id(String),
}

/// Single front door for everything the system says on the chat channel.
#[derive(Clone)]
pub struct Delivery {
    api: Arc<dyn ChatApi>,
    failed: JobFile,
    dead_letter: JobFile,
    metrics: MetricsFile,
    config: DeliveryConfig,
}

impl Delivery {
    pub fn new(
        api: Arc<dyn ChatApi>,
        failed: JobFile,
        dead_letter: JobFile,
        metrics: MetricsFile,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            api,
            failed,
            dead_letter,
            metrics,
            config,
        }
    }

    pub fn metrics(&self) -> &MetricsFile {
        &self.metrics
    }

    /// Sends immediately; on failure the job lands in the live-failed queue
    /// (transient) or the dead-letter (permanent). Never returns a provider
    /// error to the caller.
    pub async fn dispatch(&self, action: OutboundAction, source_id: Option<&str>) -> Result<()> {
        match call_adapter(self.api.as_ref(), &action).await {
            Ok(_) => Ok(()),
            Err(error) => {
                let mut job = OutboundJob::new(action, &format_timestamp(Utc::now()));
                if let Some(source_id) = source_id {
                    job = job.with_source_id(source_id);
                }
                self.park_failed(job, &error)
            }
        }
    }

    /// Routes a freshly failed job to the right queue by classification.
    fn park_failed(&self, mut job: OutboundJob, error: &ChatApiError) -> Result<()> {
        let class = classify(error);
        job.last_error = Some(error.to_string());
        job.classification = Some(class);
        match class {
            FailureClass::Permanent => {
                tracing::warn!(kind = job.action.kind(), %error, "outbound call failed permanently");
                job.failed_at = Some(format_timestamp(Utc::now()));
                self.dead_letter.append(job)?;
                self.metrics.increment(METRIC_MOVED_PERMANENT)?;
            }
            FailureClass::Transient | FailureClass::Unknown => {
                tracing::warn!(kind = job.action.kind(), %error, "outbound call failed, queued for retry");
                self.failed.append_if_new(job)?;
            }
        }
        Ok(())
    }

    /// One pass over the live-failed queue: each job gets up to
    /// `worker_attempts` tries with doubling backoff; exhaustion stamps
    /// `_failed_at` and moves the job to the dead-letter.
    pub async fn run_retry_pass(&self) -> Result<RetryPassReport> {
        let jobs = self.failed.load()?;
        if jobs.is_empty() {
            return Ok(RetryPassReport::default());
        }
        let mut report = RetryPassReport::default();
        let processed: Vec<String> = jobs.iter().map(|job| job.id.clone()).collect();
        for job in jobs {
            self.metrics.increment(METRIC_ATTEMPT_START)?;
            match self.retry_job(&job).await {
                RetryOutcome::Sent => {
                    self.metrics.increment(METRIC_ATTEMPT_SUCCEEDED)?;
                    report.sent += 1;
                }
                RetryOutcome::Exhausted(error) | RetryOutcome::Permanent(error) => {
                    let mut dead = job;
                    dead.last_error = Some(error.to_string());
                    dead.classification = Some(classify(&error));
                    dead.failed_at = Some(format_timestamp(Utc::now()));
                    tracing::warn!(
                        kind = dead.action.kind(),
                        job_id = %dead.id,
                        %error,
                        "moving outbound job to dead-letter"
                    );
                    self.dead_letter.append(dead)?;
                    self.metrics.increment(METRIC_MOVED_PERMANENT)?;
                    report.moved_permanent += 1;
                }
            }
        }
        // Drop the snapshot we just worked through; jobs dispatched while the
        // pass ran stay queued for the next pass.
        let remaining: Vec<_> = self
            .failed
            .load()?
            .into_iter()
            .filter(|job| !processed.contains(&job.id))
            .collect();
        self.failed.save(remaining)?;
        Ok(report)
    }

    async fn retry_job(&self, job: &OutboundJob) -> RetryOutcome {
        let mut backoff = self.config.worker_base_backoff;
        let mut last_error = ChatApiError::network("no attempts made");
        for attempt in 1..=self.config.worker_attempts.max(1) {
            match call_adapter(self.api.as_ref(), &job.action).await {
                Ok(_) => return RetryOutcome::Sent,
                Err(error) => {
                    let _ = self.metrics.increment(METRIC_ATTEMPT_ERROR);
                    tracing::debug!(job_id = %job.id, attempt, %error, "retry attempt failed");
                    if classify(&error) == FailureClass::Permanent {
                        return RetryOutcome::Permanent(error);
                    }
                    last_error = error;
                    if attempt < self.config.worker_attempts.max(1) {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
        RetryOutcome::Exhausted(last_error)
    }

    /// Returns eligible dead-letter items to the live-failed queue:
    /// under the retry cap, younger than the age cap, bounded per run.
    pub fn auto_requeue_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let dead = self.dead_letter.load()?;
        if dead.is_empty() {
            return Ok(0);
        }
        let mut requeued = 0;
        let mut remaining = Vec::with_capacity(dead.len());
        for mut job in dead {
            let eligible = requeued < self.config.auto_requeue_max_per_run
                && job.retries < self.config.auto_requeue_max_retries
                && !self.too_old(&job, now);
            if eligible {
                job.retries += 1;
                job.failed_at = None;
                tracing::info!(job_id = %job.id, retries = job.retries, "auto-requeueing dead-letter job");
                self.failed.append_if_new(job)?;
                requeued += 1;
            } else {
                remaining.push(job);
            }
        }
        self.dead_letter.save(remaining)?;
        Ok(requeued)
    }

    fn too_old(&self, job: &OutboundJob, now: DateTime<Utc>) -> bool {
        let stamp = job.failed_at.as_deref().unwrap_or(&job.queued_at);
        match parse_timestamp(stamp) {
            Ok(at) => (now - at).num_hours() > self.config.auto_requeue_max_age_hours,
            // Unparseable stamps never auto-requeue; operators still can.
            Err(_) => true,
        }
    }

    /// Operator-driven move of one dead-letter item back to the live-failed
    /// queue. Returns the job that was moved, if the selector matched.
    pub fn operator_requeue(&self, selector: &RequeueSelector) -> Result<Option<OutboundJob>> {
        let taken = match selector {
            RequeueSelector::Index(index) => self.dead_letter.take_at(*index)?,
            RequeueSelector::Id(id) => self.dead_letter.take_by_id(id)?,
        };
        let Some(mut job) = taken else {
            return Ok(None);
        };
        job.failed_at = None;
        self.failed.append_if_new(job.clone())?;
        tracing::info!(job_id = %job.id, "operator requeued dead-letter job");
        Ok(Some(job))
    }

    pub fn list_dead_letter(&self) -> Result<Vec<OutboundJob>> {
        self.dead_letter.load()
    }

    /// Periodic loop: retry pass then auto-requeue, until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(error) = self.run_retry_pass().await {
                tracing::warn!(%error, "retry pass failed");
            }
            match self.auto_requeue_pass(Utc::now()) {
                Ok(count) if count > 0 => {
                    tracing::info!(count, "auto-requeued dead-letter jobs");
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "auto-requeue pass failed"),
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

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetryPassReport {
    pub sent: usize,
    pub moved_permanent: usize,
}

enum RetryOutcome {
    Sent,
    Permanent(ChatApiError),
    Exhausted(ChatApiError),
}

async fn call_adapter(api: &dyn ChatApi, action: &OutboundAction) -> Result<Value, ChatApiError> {
    match action {
        OutboundAction::SendMessage {
            chat_id,
            text,
            reply_markup,
        } => api.send_message(chat_id, text, reply_markup.clone()).await,
        OutboundAction::AnswerCallback {
            callback_query_id,
            text,
        } => api.answer_callback(callback_query_id, text.as_deref()).await,
        OutboundAction::EditMessage {
            chat_id,
            message_id,
            text,
            reply_markup,
        } => {
            api.edit_message_text(chat_id, message_id, text, reply_markup.clone())
                .await
        }
        OutboundAction::SendChatAction {
            chat_id,
            chat_action,
        } => api.send_chat_action(chat_id, chat_action).await,
    }
}

//! Durable inbound update queue plus the persistent seen-set, one atomic JSON
//! state file. Restarts never reprocess an update that was already appended.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use gaia_core::{format_timestamp, parse_timestamp, write_json_atomic};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const INBOUND_SCHEMA_VERSION: u32 = 1;
const REQUEUE_BASE_SECS: i64 = 30;
const REQUEUE_CAP_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundUpdate {
    pub update_id: u64,
    pub received_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_popped_at: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct InboundFile {
    schema_version: u32,
    #[serde(default)]
    seen: BTreeSet<u64>,
    #[serde(default)]
    queue: Vec<InboundUpdate>,
}

impl Default for InboundFile {
    fn default() -> Self {
        Self {
            schema_version: INBOUND_SCHEMA_VERSION,
            seen: BTreeSet::new(),
            queue: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundQueue {
    path: PathBuf,
}

impl InboundQueue {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<InboundFile> {
        if !self.path.exists() {
            return Ok(InboundFile::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(InboundFile::default());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn save(&self, file: &InboundFile) -> Result<()> {
        write_json_atomic(&self.path, file)
    }

    /// Appends a raw provider update unless its `update_id` was seen before.
    /// The id enters the seen-set in the same write. Returns whether the
    /// update was new.
    pub fn append_if_unseen(&self, update_id: u64, payload: Value, now: DateTime<Utc>) -> Result<bool> {
        let mut file = self.load()?;
        if !file.seen.insert(update_id) {
            tracing::debug!(update_id, "skipping already-seen inbound update");
            return Ok(false);
        }
        file.queue.push(InboundUpdate {
            update_id,
            received_at: format_timestamp(now),
            attempts: 0,
            next_attempt_at: None,
            last_popped_at: None,
            payload,
        });
        self.save(&file)?;
        Ok(true)
    }

    /// Removes and returns the next update whose `next_attempt_at` has
    /// passed, incrementing `attempts` and stamping `last_popped_at`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Result<Option<InboundUpdate>> {
        let mut file = self.load()?;
        let position = file.queue.iter().position(|update| {
            match update.next_attempt_at.as_deref() {
                None => true,
                Some(at) => parse_timestamp(at).map(|at| at <= now).unwrap_or(true),
            }
        });
        let Some(position) = position else {
            return Ok(None);
        };
        let mut update = file.queue.remove(position);
        update.attempts += 1;
        update.last_popped_at = Some(format_timestamp(now));
        self.save(&file)?;
        Ok(Some(update))
    }

    /// Puts a failed update back with exponential backoff: 30 s doubling per
    /// attempt, capped at one hour.
    pub fn requeue_with_backoff(&self, update: InboundUpdate, now: DateTime<Utc>) -> Result<()> {
        let exponent = update.attempts.saturating_sub(1).min(30);
        let delay_secs = (REQUEUE_BASE_SECS << exponent).min(REQUEUE_CAP_SECS);
        let mut requeued = update;
        requeued.next_attempt_at = Some(format_timestamp(now + Duration::seconds(delay_secs)));
        tracing::warn!(
            update_id = requeued.update_id,
            attempts = requeued.attempts,
            delay_secs,
            "requeueing inbound update"
        );
        let mut file = self.load()?;
        file.queue.push(requeued);
        self.save(&file)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load()?.queue.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.load()?.queue.is_empty())
    }
}

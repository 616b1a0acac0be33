//! Append-only event log for the gaia orchestrator.
//!
//! One newline-delimited JSON record per event. Appends are serialized by the
//! log's write lock and fsynced by a group-commit flusher (≤100 ms batches);
//! `append_sync` gives strict durability. Tail subscribers receive each new
//! record exactly once per subscription through a broadcast channel.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gaia_core::{format_timestamp, new_trace_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Default group-commit flush interval.
pub const FLUSH_INTERVAL_MS: u64 = 100;

const TAIL_CHANNEL_CAPACITY: usize = 256;

/// One record in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub trace_id: String,
    pub timestamp: String,
    pub payload: Value,
}

impl EventRecord {
    /// New record with a fresh trace id; callers propagate the id of the
    /// causing event instead when one event triggers another.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            target: None,
            task_id: None,
            trace_id: new_trace_id(),
            timestamp: format_timestamp(Utc::now()),
            payload: Value::Null,
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Filters applied when replaying the log from disk.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact type or dotted prefix (`task` matches `task.enqueued`).
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    fn matches(&self, record: &EventRecord) -> bool {
        if let Some(wanted) = &self.event_type {
            let matches_type = record.event_type == *wanted
                || record
                    .event_type
                    .strip_prefix(wanted.as_str())
                    .is_some_and(|rest| rest.starts_with('.'));
            if !matches_type {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if record.source != *source {
                return false;
            }
        }
        if self.since.is_some() || self.until.is_some() {
            let Ok(at) = gaia_core::parse_timestamp(&record.timestamp) else {
                return false;
            };
            if self.since.is_some_and(|since| at < since) {
                return false;
            }
            if self.until.is_some_and(|until| at > until) {
                return false;
            }
        }
        true
    }
}

struct EventLogInner {
    path: PathBuf,
    file: Mutex<File>,
    dirty: AtomicBool,
    tail: broadcast::Sender<EventRecord>,
}

/// Handle to the durable event log; cheap to clone across components.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

impl EventLog {
    /// Opens (or creates) the log at `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        let (tail, _) = broadcast::channel(TAIL_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(EventLogInner {
                path,
                file: Mutex::new(file),
                dirty: AtomicBool::new(false),
                tail,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Appends one record; durability is deferred to the group-commit flusher.
    pub fn append(&self, record: EventRecord) -> Result<()> {
        self.write_record(&record)?;
        self.inner.dirty.store(true, Ordering::Release);
        let _ = self.inner.tail.send(record);
        Ok(())
    }

    /// Appends one record and fsyncs before returning.
    pub fn append_sync(&self, record: EventRecord) -> Result<()> {
        self.write_record(&record)?;
        {
            let file = self
                .inner
                .file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            file.sync_data().context("failed to fsync event log")?;
        }
        self.inner.dirty.store(false, Ordering::Release);
        let _ = self.inner.tail.send(record);
        Ok(())
    }

    fn write_record(&self, record: &EventRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to encode event record")?;
        line.push('\n');
        let mut file = self
            .inner
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.write_all(line.as_bytes())
            .context("failed to append to event log")?;
        Ok(())
    }

    /// Syncs pending appends to disk if any accumulated since the last flush.
    pub fn flush(&self) -> Result<()> {
        if self.inner.dirty.swap(false, Ordering::AcqRel) {
            let file = self
                .inner
                .file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            file.sync_data().context("failed to fsync event log")?;
        }
        Ok(())
    }

    /// Spawns the group-commit flusher; batches fsyncs every `FLUSH_INTERVAL_MS`.
    pub fn spawn_flusher(&self) -> tokio::task::JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));
            loop {
                ticker.tick().await;
                if log.flush().is_err() {
                    break;
                }
            }
        })
    }

    /// New tail subscription; sees every record appended after this call.
    pub fn tail(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.tail.subscribe()
    }

    /// Replays the on-disk log through `filter`. Unparseable lines surface as
    /// `event.unparseable` records instead of being dropped.
    pub fn read_filtered(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read {}", self.inner.path.display()));
            }
        };
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<EventRecord>(line) {
                Ok(record) => record,
                Err(_) => unparseable_record(line),
            };
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn unparseable_record(line: &str) -> EventRecord {
    EventRecord::new("event.unparseable", "event-log")
        .payload(serde_json::json!({ "raw": line }))
}

/// SSE event name for a record type: dots become dashes and the `instruction`
/// type is delivered as `instruct`.
pub fn sse_event_name(event_type: &str) -> String {
    if event_type == "instruction" {
        return "instruct".to_string();
    }
    event_type.replace('.', "-")
}

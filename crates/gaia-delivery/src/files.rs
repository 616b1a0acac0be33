//! Durable queue state: one JSON file for the live-failed queue, one for the
//! permanent dead-letter. Every mutation is a load-mutate-save against a
//! single file, saved with a temp-and-rename write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gaia_core::write_json_atomic;
use serde::{Deserialize, Serialize};

use crate::job::OutboundJob;

const QUEUE_FILE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    schema_version: u32,
    #[serde(default)]
    jobs: Vec<OutboundJob>,
}

impl Default for QueueFile {
    fn default() -> Self {
        Self {
            schema_version: QUEUE_FILE_SCHEMA_VERSION,
            jobs: Vec::new(),
        }
    }
}

/// A list-of-jobs state file; used for both the live-failed queue and the
/// dead-letter.
#[derive(Debug, Clone)]
pub struct JobFile {
    path: PathBuf,
}

impl JobFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<OutboundJob>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: QueueFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(file.jobs)
    }

    pub fn save(&self, jobs: Vec<OutboundJob>) -> Result<()> {
        write_json_atomic(
            &self.path,
            &QueueFile {
                schema_version: QUEUE_FILE_SCHEMA_VERSION,
                jobs,
            },
        )
    }

    /// Appends unless a live job with the same logical key already exists.
    /// Returns whether the job was actually added.
    pub fn append_if_new(&self, job: OutboundJob) -> Result<bool> {
        let mut jobs = self.load()?;
        let key = job.action.logical_key();
        if jobs.iter().any(|existing| existing.action.logical_key() == key) {
            tracing::debug!(logical_key = %key, "skipping duplicate outbound job");
            return Ok(false);
        }
        jobs.push(job);
        self.save(jobs)?;
        Ok(true)
    }

    pub fn append(&self, job: OutboundJob) -> Result<()> {
        let mut jobs = self.load()?;
        jobs.push(job);
        self.save(jobs)
    }

    /// Removes and returns the job at `index`, if present.
    pub fn take_at(&self, index: usize) -> Result<Option<OutboundJob>> {
        let mut jobs = self.load()?;
        if index >= jobs.len() {
            return Ok(None);
        }
        let job = jobs.remove(index);
        self.save(jobs)?;
        Ok(Some(job))
    }

    /// Removes and returns the first job whose `source_id` or `id` matches.
    pub fn take_by_id(&self, wanted: &str) -> Result<Option<OutboundJob>> {
        let mut jobs = self.load()?;
        let position = jobs.iter().position(|job| {
            job.id == wanted || job.source_id.as_deref() == Some(wanted)
        });
        let Some(position) = position else {
            return Ok(None);
        };
        let job = jobs.remove(position);
        self.save(jobs)?;
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::OutboundAction;

    fn send(text: &str) -> OutboundJob {
        OutboundJob::new(
            OutboundAction::SendMessage {
                chat_id: "1".to_string(),
                text: text.to_string(),
                reply_markup: None,
            },
            "2026-08-29T12:00:00Z",
        )
    }

    #[test]
    fn append_if_new_dedups_by_logical_key() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let file = JobFile::new(tempdir.path().join("failed.json"));
        assert!(file.append_if_new(send("hello")).expect("first"));
        assert!(!file.append_if_new(send("hello")).expect("duplicate"));
        assert!(file.append_if_new(send("other")).expect("distinct"));
        assert_eq!(file.load().expect("load").len(), 2);
    }

    #[test]
    fn take_by_id_matches_source_or_job_id() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let file = JobFile::new(tempdir.path().join("dead.json"));
        let job = send("hello").with_source_id("cq-9");
        let job_id = job.id.clone();
        file.append(job).expect("append");
        let taken = file.take_by_id("cq-9").expect("take").expect("found");
        assert_eq!(taken.id, job_id);
        assert!(file.load().expect("load").is_empty());
        assert!(file.take_by_id("cq-9").expect("take again").is_none());
    }

    #[test]
    fn take_at_out_of_range_is_none() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let file = JobFile::new(tempdir.path().join("dead.json"));
        file.append(send("hello")).expect("append");
        assert!(file.take_at(5).expect("take").is_none());
        assert!(file.take_at(0).expect("take").is_some());
    }
}

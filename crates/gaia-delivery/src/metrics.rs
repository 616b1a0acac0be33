//! Retry counters, persisted to a JSON file after every update so external
//! alerters can tail them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const METRIC_ATTEMPT_START: &str = "telegram.retry.attempt.start";
pub const METRIC_ATTEMPT_ERROR: &str = "telegram.retry.attempt.error";
pub const METRIC_ATTEMPT_SUCCEEDED: &str = "telegram.retry.attempt.succeeded";
pub const METRIC_MOVED_PERMANENT: &str = "telegram.retry.moved_permanent";

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetricsFileState {
    #[serde(default)]
    counters: std::collections::BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct MetricsFile {
    path: PathBuf,
}

impl MetricsFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<MetricsFileState> {
        if !self.path.exists() {
            return Ok(MetricsFileState::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(MetricsFileState::default());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    pub fn increment(&self, counter: &str) -> Result<u64> {
        let mut state = self.load()?;
        let value = state.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        let new_value = *value;
        gaia_core::write_json_atomic(&self.path, &state)?;
        Ok(new_value)
    }

    pub fn get(&self, counter: &str) -> Result<u64> {
        Ok(self.load()?.counters.get(counter).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_persist_across_handles() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("metrics.json");
        let metrics = MetricsFile::new(&path);
        assert_eq!(metrics.increment(METRIC_ATTEMPT_START).expect("inc"), 1);
        assert_eq!(metrics.increment(METRIC_ATTEMPT_START).expect("inc"), 2);
        let reopened = MetricsFile::new(&path);
        assert_eq!(reopened.get(METRIC_ATTEMPT_START).expect("get"), 2);
        assert_eq!(reopened.get(METRIC_ATTEMPT_ERROR).expect("get"), 0);
    }
}

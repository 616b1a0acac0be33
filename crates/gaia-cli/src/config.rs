//! Daemon configuration, assembled from environment variables with
//! documented defaults.

use std::path::PathBuf;

use gaia_store::DEFAULT_LOCK_TIMEOUT_SECS;

/// Paths and tuning for one daemon process.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// `GAIA_DB_PATH`, default `gaia.db` under the state dir.
    pub db_path: PathBuf,
    /// `GAIA_EVENTS_PATH`, default `events.jsonl` under the state dir.
    pub events_path: PathBuf,
    /// `GAIA_STATE_DIR`, default `./gaia-state`. Holds the inbound queue,
    /// outbound queues, offset file and metrics file.
    pub state_dir: PathBuf,
    /// `TELEGRAM_BOT_TOKEN`; empty disables the inbound poller.
    pub bot_token: String,
    /// `CLAIMS_LOCK_TIMEOUT` in seconds.
    pub lock_timeout_secs: u64,
    /// `GAIA_BIND`, default `127.0.0.1:8490`.
    pub bind: String,
    /// Stale-lease TTL for the reclaimer, seconds.
    pub reclaim_ttl_secs: u64,
    /// Reclaim attempts before a task fails terminally.
    pub reclaim_max_attempts: u32,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let state_dir = PathBuf::from(env_or("GAIA_STATE_DIR", "gaia-state"));
        let db_path = std::env::var("GAIA_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("gaia.db"));
        let events_path = std::env::var("GAIA_EVENTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir.join("events.jsonl"));
        Self {
            db_path,
            events_path,
            state_dir,
            bot_token: std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            lock_timeout_secs: env_u64("CLAIMS_LOCK_TIMEOUT", DEFAULT_LOCK_TIMEOUT_SECS),
            bind: env_or("GAIA_BIND", "127.0.0.1:8490"),
            reclaim_ttl_secs: env_u64("GAIA_RECLAIM_TTL_SECS", 300),
            reclaim_max_attempts: env_u64("GAIA_RECLAIM_MAX_ATTEMPTS", 3) as u32,
        }
    }

    pub fn inbound_queue_path(&self) -> PathBuf {
        self.state_dir.join("inbound_queue.json")
    }

    pub fn offset_path(&self) -> PathBuf {
        self.state_dir.join("telegram_offset.json")
    }

    pub fn failed_queue_path(&self) -> PathBuf {
        self.state_dir.join("telegram_failed.json")
    }

    pub fn dead_letter_path(&self) -> PathBuf {
        self.state_dir.join("telegram_dead_letter.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.state_dir.join("metrics.json")
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

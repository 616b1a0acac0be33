//! Foundational low-level utilities shared across gaia crates.
//!
//! Provides atomic file-write helpers, timestamp formatting for persisted
//! rows, correlation ids, and idempotency-key hashing.

pub mod atomic_io;
pub mod time_utils;
pub mod trace;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, format_timestamp, parse_timestamp,
};
pub use trace::{idempotency_key, new_trace_id, principal_fingerprint, truncate_bytes};

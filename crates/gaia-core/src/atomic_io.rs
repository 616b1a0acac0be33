//! Crash-safe state-file writes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp;

/// Replaces `path` with `content` through a sibling temp file and a rename,
/// so a concurrent reader only ever sees the previous or the new contents.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let (dir, temp_path) = staging_paths(path)?;
    fs::create_dir_all(&dir).with_context(|| format!("creating state dir {}", dir.display()))?;

    let mut temp = fs::File::create(&temp_path)
        .with_context(|| format!("creating temp state file {}", temp_path.display()))?;
    temp.write_all(content.as_bytes())
        .and_then(|_| temp.sync_all())
        .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
    drop(temp);

    fs::rename(&temp_path, path)
        .with_context(|| format!("replacing state file {}", path.display()))?;
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value)
        .with_context(|| format!("encoding state for {}", path.display()))?;
    write_text_atomic(path, &payload)
}

/// Temp names carry the pid and a timestamp so writers on the same file never
/// collide with each other's staging files.
fn staging_paths(path: &Path) -> Result<(PathBuf, PathBuf)> {
    if path.as_os_str().is_empty() {
        bail!("state file path is empty");
    }
    if path.is_dir() {
        bail!("state file path {} is a directory", path.display());
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    let temp_name = format!(
        ".{stem}.{}-{}.tmp",
        std::process::id(),
        current_unix_timestamp()
    );
    let temp_path = dir.join(temp_name);
    Ok((dir, temp_path))
}

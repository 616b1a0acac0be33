//! Long-poll ingestion: pulls provider updates into the durable inbound
//! queue and advances the persisted offset after every successful batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use gaia_telegram::{next_offset, ChatApi, OffsetStore};
use serde_json::Value;
use tokio::sync::watch;

use crate::inbound::InboundQueue;

const LONG_POLL_TIMEOUT_SECS: u64 = 25;

/// One getUpdates round: append every new update, then persist the offset.
/// Returns the number of updates actually appended.
pub async fn poll_once(
    api: &dyn ChatApi,
    inbound: &InboundQueue,
    offsets: &OffsetStore,
) -> Result<usize> {
    let offset = offsets.load()?;
    let updates = match api.get_updates(offset, LONG_POLL_TIMEOUT_SECS).await {
        Ok(updates) => updates,
        Err(error) => {
            tracing::warn!(%error, "getUpdates failed");
            return Ok(0);
        }
    };
    let mut appended = 0;
    let now = Utc::now();
    for update in &updates {
        let Some(update_id) = update.get("update_id").and_then(Value::as_u64) else {
            tracing::warn!("dropping update without update_id");
            continue;
        };
        if inbound.append_if_unseen(update_id, update.clone(), now)? {
            appended += 1;
        }
    }
    if let Some(next) = next_offset(&updates) {
        offsets.save(next)?;
    }
    Ok(appended)
}

/// Poll loop until shutdown. The provider holds the connection open for the
/// long-poll window, so the idle sleep only matters on errors and empty
/// batches.
pub async fn run_inbound_poller(
    api: Arc<dyn ChatApi>,
    inbound: InboundQueue,
    offsets: OffsetStore,
    idle_sleep: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match poll_once(api.as_ref(), &inbound, &offsets).await {
            Ok(appended) if appended > 0 => {
                tracing::debug!(appended, "appended inbound updates");
                continue;
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "inbound poll failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(idle_sleep) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

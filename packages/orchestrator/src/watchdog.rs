//! Watchdog sweep: reclaim failed and stalled work.
//!
//! The watchdog owns no state of its own; one tick is one call to
//! [`sweep`] and everything it does is visible through the store and the
//! event log. Periodicity belongs to whatever scheduler invokes the CLI
//! (cron or equivalent).

use serde_json::json;
use tracing::info;

use crate::clock::{parse_wall, Clock};
use crate::error::Result;
use crate::events::EventType;
use crate::item::{append_note, ItemStatus};
use crate::store::{ListFilter, QueueStore};

pub const DEFAULT_STALE_MINUTES: i64 = 60;

/// One watchdog tick.
///
/// 1. Retry sweep: FAILED and lease-expired IN_PROGRESS items go back to
///    PENDING with attempt accounting (see `QueueStore::retry_eligible`).
/// 2. Stale sweep: IN_PROGRESS items whose `started_at` is older than
///    `stale_minutes` are reset with a `[watchdog] stale reset` note.
///    This catches non-leased executions that simply went quiet.
///
/// Returns all reset ids in sweep order.
pub async fn sweep(store: &QueueStore, stale_minutes: i64) -> Result<Vec<String>> {
    let mut reset = store.retry_eligible(None).await?;

    let now = store.clock().now_epoch();
    let offset = store.clock().offset();
    let cutoff = now - stale_minutes * 60;

    let in_progress = store.list(ListFilter::status(ItemStatus::InProgress)).await?;
    for item in in_progress {
        // A live lease means the worker is still heartbeating; only the
        // retry sweep may reclaim leased work, and only after expiry.
        if matches!(item.lease_expires_at, Some(expires) if expires > now) {
            continue;
        }
        let Some(started) = parse_wall(offset, &item.started_at) else {
            continue;
        };
        if started.timestamp() > cutoff {
            continue;
        }

        let notes = append_note(&item.notes, "[watchdog] stale reset");
        store
            .reset_to_pending(
                &item.id,
                &notes,
                None,
                EventType::Retried,
                json!({"reason": "stale_reset"}),
            )
            .await?;
        reset.push(item.id);
    }

    if reset.is_empty() {
        info!("watchdog sweep: NOOP");
    } else {
        info!(count = reset.len(), "watchdog sweep reset items");
    }
    Ok(reset)
}

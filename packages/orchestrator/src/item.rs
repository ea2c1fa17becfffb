//! Queue item model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::StoreError;

/// Item lifecycle state. `DONE` and `BLOCKED` are terminal for user
/// intent; `FAILED` stays retry-eligible until attempts run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Failed,
    Done,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::InProgress => "IN_PROGRESS",
            ItemStatus::Blocked => "BLOCKED",
            ItemStatus::Failed => "FAILED",
            ItemStatus::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Failed | ItemStatus::Blocked)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ItemStatus::Pending),
            "IN_PROGRESS" => Ok(ItemStatus::InProgress),
            "BLOCKED" => Ok(ItemStatus::Blocked),
            "FAILED" => Ok(ItemStatus::Failed),
            "DONE" => Ok(ItemStatus::Done),
            other => Err(StoreError::InvalidTransition(format!(
                "unknown status: {other}"
            ))),
        }
    }
}

/// Dispatch priority. Lower ordinal wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
}

impl Priority {
    /// Integer for DB ordering (lower = more urgent).
    pub fn ordinal(&self) -> i64 {
        match self {
            Priority::P0 => 0,
            Priority::P1 => 1,
            Priority::P2 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            other => Err(StoreError::InvalidTransition(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// One unit of work as stored in `queue_items`.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub status: ItemStatus,
    pub priority: Priority,
    pub task: String,
    pub success_criteria: String,

    // Execution
    pub owner_session: String,
    pub started_at: String,
    pub due_at: String,
    pub notes: String,

    // Lease
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,

    // Retry accounting
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub last_error: String,

    // Dedup
    pub idempotency_key: Option<String>,

    // Timestamps (wall-clock strings, monotonic per row)
    pub created_at: String,
    pub updated_at: String,
}

impl Item {
    /// Whether a running item's lease has lapsed at `now`.
    pub fn lease_expired(&self, now: i64) -> bool {
        matches!(self.lease_expires_at, Some(expires) if expires <= now)
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Fields accepted by `QueueStore::add`. Everything else gets its
/// initial value from the store.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: String,
    pub priority: Priority,
    pub task: String,
    pub success_criteria: String,
    pub due_at: String,
    pub notes: String,
    pub idempotency_key: Option<String>,
    pub max_attempts: i64,
}

impl NewItem {
    pub fn new(id: impl Into<String>, priority: Priority, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority,
            task: task.into(),
            success_criteria: String::new(),
            due_at: "-".to_string(),
            notes: String::new(),
            idempotency_key: None,
            max_attempts: 3,
        }
    }

    pub fn success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    pub fn due_at(mut self, due: impl Into<String>) -> Self {
        self.due_at = due.into();
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max: i64) -> Self {
        self.max_attempts = max;
        self
    }
}

/// Append to the pipe-separated audit trail. Notes are write-only from
/// the core's point of view except for the narrow `retry_not_before=`
/// marker.
pub fn append_note(existing: &str, msg: &str) -> String {
    let msg = msg.trim();
    if existing.trim().is_empty() {
        msg.to_string()
    } else {
        format!("{} | {}", existing.trim(), msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn priority_ordering_is_correct() {
        assert!(Priority::P0.ordinal() < Priority::P1.ordinal());
        assert!(Priority::P1.ordinal() < Priority::P2.ordinal());
    }

    #[test]
    fn status_roundtrips_through_str() {
        for s in ["PENDING", "IN_PROGRESS", "BLOCKED", "FAILED", "DONE"] {
            assert_eq!(ItemStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(ItemStatus::from_str("RUNNING").is_err());
    }

    #[test]
    fn priority_roundtrips_through_str() {
        for p in ["P0", "P1", "P2"] {
            assert_eq!(Priority::from_str(p).unwrap().as_str(), p);
        }
        assert!(Priority::from_str("P3").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ItemStatus::Done.is_terminal());
        assert!(ItemStatus::Blocked.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::InProgress.is_terminal());
    }

    #[test]
    fn new_item_defaults() {
        let item = NewItem::new("ORCH-001", Priority::P1, "do the thing");
        assert_eq!(item.max_attempts, 3);
        assert_eq!(item.due_at, "-");
        assert_eq!(item.notes, "");
        assert!(item.idempotency_key.is_none());
    }

    #[test]
    fn append_note_joins_with_pipe() {
        assert_eq!(append_note("", "first"), "first");
        assert_eq!(append_note("first", "second"), "first | second");
        assert_eq!(append_note("  ", " padded "), "padded");
    }

    #[test]
    fn lease_expired_boundary() {
        let mut item = sample_item();
        item.lease_expires_at = Some(1000);
        assert!(item.lease_expired(1000));
        assert!(!item.lease_expired(999));
        item.lease_expires_at = None;
        assert!(!item.lease_expired(5000));
    }

    fn sample_item() -> Item {
        Item {
            id: "ORCH-001".to_string(),
            status: ItemStatus::Pending,
            priority: Priority::P1,
            task: "task".to_string(),
            success_criteria: "criteria".to_string(),
            owner_session: "-".to_string(),
            started_at: "-".to_string(),
            due_at: "-".to_string(),
            notes: String::new(),
            lease_owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts: 3,
            last_error: String::new(),
            idempotency_key: None,
            created_at: "2026-01-01 09:00".to_string(),
            updated_at: "2026-01-01 09:00".to_string(),
        }
    }
}

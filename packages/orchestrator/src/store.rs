//! SQLite-backed queue store.
//!
//! All writes are read-then-write inside a single transaction; WAL mode
//! plus a busy timeout gives row-level exclusion between concurrent
//! writer processes. Every state transition appends its audit event in
//! the same transaction, so the log never disagrees with the rows.
//!
//! Schema evolution is additive: `ensure_migrations` appends missing
//! columns with defaults and never drops existing data.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::events::{EventRecord, EventType};
use crate::item::{Item, ItemStatus, NewItem, Priority};

pub const DEFAULT_LEASE_TTL_SECONDS: i64 = 900;
pub const DEFAULT_RETRY_BACKOFF_SECONDS: &[i64] = &[60, 180, 600];

const ITEM_COLUMNS: &str = "id, status, priority, task, success_criteria, owner_session, \
     started_at, due_at, notes, lease_owner, lease_expires_at, attempt_count, max_attempts, \
     last_error, idempotency_key, created_at, updated_at";

/// Canonical dispatch order: priority ordinal, then insertion order.
const CANONICAL_ORDER: &str = "CASE priority WHEN 'P0' THEN 0 WHEN 'P1' THEN 1 WHEN 'P2' THEN 2 \
     ELSE 99 END, created_at ASC, rowid ASC";

/// Status/priority filter for `list`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub status: Option<ItemStatus>,
    pub priority: Option<Priority>,
}

impl ListFilter {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            priority: None,
        }
    }
}

pub struct QueueStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    retry_backoff: Vec<i64>,
}

impl QueueStore {
    /// Open (and create if missing) the store at `path`, applying the
    /// schema and any additive migrations.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            clock,
            retry_backoff: DEFAULT_RETRY_BACKOFF_SECONDS.to_vec(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Replace the default retry backoff schedule.
    pub fn with_retry_backoff(mut self, backoff: Vec<i64>) -> Self {
        if !backoff.is_empty() {
            self.retry_backoff = backoff;
        }
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                task TEXT NOT NULL,
                success_criteria TEXT NOT NULL,
                owner_session TEXT NOT NULL DEFAULT '-',
                started_at TEXT NOT NULL DEFAULT '-',
                due_at TEXT NOT NULL DEFAULT '-',
                notes TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_events (
                event_id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.ensure_migrations().await?;
        Ok(())
    }

    /// Additive column migrations, keyed off `PRAGMA table_info`.
    async fn ensure_migrations(&self) -> Result<()> {
        let rows = sqlx::query("PRAGMA table_info(queue_items)")
            .fetch_all(&self.pool)
            .await?;
        let cols: Vec<String> = rows
            .iter()
            .map(|r| r.get::<String, _>("name"))
            .collect();

        let additions: &[(&str, &str)] = &[
            ("lease_owner", "TEXT"),
            ("lease_expires_at", "INTEGER"),
            ("attempt_count", "INTEGER NOT NULL DEFAULT 0"),
            ("max_attempts", "INTEGER NOT NULL DEFAULT 3"),
            ("idempotency_key", "TEXT"),
            ("last_error", "TEXT NOT NULL DEFAULT ''"),
        ];

        for (name, ddl) in additions {
            if !cols.iter().any(|c| c == name) {
                info!(column = name, "adding queue_items column");
                sqlx::query(&format!("ALTER TABLE queue_items ADD COLUMN {name} {ddl}"))
                    .execute(&self.pool)
                    .await?;
            }
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_items_lease ON queue_items(lease_expires_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_items_idempotency ON queue_items(idempotency_key)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_event_on(
        conn: &mut SqliteConnection,
        item_id: &str,
        event_type: &EventType,
        payload: serde_json::Value,
        created_at: &str,
    ) -> Result<i64> {
        // serde_json's default map is ordered, so payload keys serialize sorted.
        let payload_json = serde_json::to_string(&payload)?;
        let result = sqlx::query(
            "INSERT INTO queue_events(item_id, event_type, payload_json, created_at) \
             VALUES(?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(event_type.as_str())
        .bind(payload_json)
        .bind(created_at)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Append an audit event outside any item transition. Always succeeds
    /// for existing or unknown ids alike; the log is an open channel.
    pub async fn append_event(
        &self,
        item_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let wall = self.clock.now_wall();
        let mut conn = self.pool.acquire().await?;
        Self::append_event_on(&mut conn, item_id, &event_type, payload, &wall).await
    }

    /// Insert a new PENDING item. Fails with `DuplicateId` when the id
    /// already exists. Emits `added`.
    pub async fn add(&self, new: NewItem) -> Result<()> {
        let wall = self.clock.now_wall();
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM queue_items WHERE id = ?")
            .bind(&new.id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(StoreError::DuplicateId(new.id));
        }

        let due = if new.due_at.trim().is_empty() {
            "-".to_string()
        } else {
            new.due_at.clone()
        };

        sqlx::query(
            r#"
            INSERT INTO queue_items(
                id, status, priority, task, success_criteria, owner_session,
                started_at, due_at, notes, created_at, updated_at,
                attempt_count, max_attempts, idempotency_key, last_error
            ) VALUES(?, 'PENDING', ?, ?, ?, '-', '-', ?, ?, ?, ?, 0, ?, ?, '')
            "#,
        )
        .bind(&new.id)
        .bind(new.priority.as_str())
        .bind(&new.task)
        .bind(&new.success_criteria)
        .bind(&due)
        .bind(&new.notes)
        .bind(&wall)
        .bind(&wall)
        .bind(new.max_attempts)
        .bind(&new.idempotency_key)
        .execute(&mut *tx)
        .await?;

        Self::append_event_on(
            &mut tx,
            &new.id,
            &EventType::Added,
            json!({"priority": new.priority.as_str(), "idempotency_key": new.idempotency_key}),
            &wall,
        )
        .await?;

        tx.commit().await?;
        debug!(item_id = %new.id, "item added");
        Ok(())
    }

    /// Items in canonical order, optionally filtered by status/priority.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Item>> {
        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items");
        let mut clauses = Vec::new();
        if filter.status.is_some() {
            clauses.push("status = ?");
        }
        if filter.priority.is_some() {
            clauses.push("priority = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {CANONICAL_ORDER}"));

        let mut query = sqlx::query_as::<_, Item>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(priority) = filter.priority {
            query = query.bind(priority.as_str());
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Fetch one item or `NotFound`.
    pub async fn get(&self, id: &str) -> Result<Item> {
        let item = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        item.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Claim the next eligible PENDING item for `owner_session`.
    ///
    /// Candidates whose idempotency key already has a DONE item are
    /// auto-closed with a duplicate-skip note (and an
    /// `idempotency_skipped` event) inside the same transaction, and the
    /// scan continues. Returns `Ok(None)` on an empty queue. The lease is
    /// NOT acquired here.
    pub async fn pick_next(&self, owner_session: &str) -> Result<Option<Item>> {
        let wall = self.clock.now_wall();
        let mut tx = self.pool.begin().await?;

        let picked = loop {
            let candidate = sqlx::query_as::<_, Item>(&format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items WHERE status = 'PENDING' \
                 ORDER BY {CANONICAL_ORDER} LIMIT 1"
            ))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(item) = candidate else {
                break None;
            };

            if let Some(key) = &item.idempotency_key {
                let done_twin: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM queue_items \
                     WHERE status = 'DONE' AND idempotency_key = ? AND id != ? LIMIT 1",
                )
                .bind(key)
                .bind(&item.id)
                .fetch_optional(&mut *tx)
                .await?;

                if done_twin.is_some() {
                    sqlx::query(
                        r#"
                        UPDATE queue_items
                        SET status = 'DONE',
                            notes = CASE
                              WHEN notes = '' THEN 'Skipped duplicate by idempotency_key'
                              ELSE notes || ' | Skipped duplicate by idempotency_key'
                            END,
                            updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&wall)
                    .bind(&item.id)
                    .execute(&mut *tx)
                    .await?;

                    Self::append_event_on(
                        &mut tx,
                        &item.id,
                        &EventType::IdempotencySkipped,
                        json!({"reason": "already_done"}),
                        &wall,
                    )
                    .await?;
                    debug!(item_id = %item.id, "duplicate auto-closed at pick");
                    continue;
                }
            }

            sqlx::query(
                "UPDATE queue_items \
                 SET status = 'IN_PROGRESS', owner_session = ?, started_at = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(owner_session)
            .bind(&wall)
            .bind(&wall)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;

            Self::append_event_on(
                &mut tx,
                &item.id,
                &EventType::Picked,
                json!({"owner_session": owner_session}),
                &wall,
            )
            .await?;

            let fresh = sqlx::query_as::<_, Item>(&format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?"
            ))
            .bind(&item.id)
            .fetch_one(&mut *tx)
            .await?;
            break Some(fresh);
        };

        tx.commit().await?;
        if let Some(item) = &picked {
            info!(item_id = %item.id, owner = owner_session, "picked");
        }
        Ok(picked)
    }

    /// Acquire an exclusive lease. Succeeds iff the row has no current
    /// holder or the previous lease has expired. Contention returns
    /// `Ok(false)`, never an error.
    pub async fn acquire_lease(&self, id: &str, owner_session: &str, ttl_seconds: i64) -> Result<bool> {
        let now = self.clock.now_epoch();
        let expires = now + ttl_seconds;
        let wall = self.clock.now_wall();

        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            r#"
            UPDATE queue_items
            SET lease_owner = ?, lease_expires_at = ?, updated_at = ?
            WHERE id = ?
              AND (lease_owner IS NULL OR lease_owner = ''
                   OR lease_expires_at IS NULL OR lease_expires_at <= ?)
            "#,
        )
        .bind(owner_session)
        .bind(expires)
        .bind(&wall)
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 1 {
            Self::append_event_on(
                &mut tx,
                id,
                &EventType::LeaseAcquired,
                json!({"owner_session": owner_session, "expires_at": expires}),
                &wall,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(affected == 1)
    }

    /// Extend a held, unexpired lease. Only the current owner may renew.
    pub async fn renew_lease(&self, id: &str, owner_session: &str, ttl_seconds: i64) -> Result<bool> {
        let now = self.clock.now_epoch();
        let expires = now + ttl_seconds;
        let wall = self.clock.now_wall();

        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            r#"
            UPDATE queue_items
            SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND lease_owner = ?
              AND lease_expires_at IS NOT NULL AND lease_expires_at > ?
            "#,
        )
        .bind(expires)
        .bind(&wall)
        .bind(id)
        .bind(owner_session)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 1 {
            Self::append_event_on(
                &mut tx,
                id,
                &EventType::LeaseRenewed,
                json!({"owner_session": owner_session, "expires_at": expires}),
                &wall,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(affected == 1)
    }

    /// Release a held lease. Only the current owner may release; expiry
    /// does not matter.
    pub async fn release_lease(&self, id: &str, owner_session: &str) -> Result<bool> {
        let wall = self.clock.now_wall();

        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE queue_items \
             SET lease_owner = NULL, lease_expires_at = NULL, updated_at = ? \
             WHERE id = ? AND lease_owner = ?",
        )
        .bind(&wall)
        .bind(id)
        .bind(owner_session)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 1 {
            Self::append_event_on(
                &mut tx,
                id,
                &EventType::LeaseReleased,
                json!({"owner_session": owner_session}),
                &wall,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(affected == 1)
    }

    /// Reset every FAILED item with attempts remaining, and every
    /// IN_PROGRESS item whose lease lapsed at `now`. Each reset runs in
    /// the sweep's transaction: back to PENDING, owner and lease cleared,
    /// attempt_count bumped, advisory `retry_not_before=` note appended,
    /// `retried` event emitted. Returns the reset ids.
    pub async fn retry_eligible(&self, now_ts: Option<i64>) -> Result<Vec<String>> {
        let now = now_ts.unwrap_or_else(|| self.clock.now_epoch());
        let wall = self.clock.now_wall();
        let mut retried = Vec::new();

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, Item>(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items \
             WHERE status IN ('FAILED', 'IN_PROGRESS') ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(&mut *tx)
        .await?;

        for item in rows {
            if !item.attempts_remaining() {
                continue;
            }
            let is_failed = item.status == ItemStatus::Failed;
            let is_timeout = item.status == ItemStatus::InProgress && item.lease_expired(now);
            if !(is_failed || is_timeout) {
                continue;
            }

            let backoff_idx = (item.attempt_count as usize).min(self.retry_backoff.len() - 1);
            let backoff = self.retry_backoff[backoff_idx];
            let note = format!("retry_not_before={}", now + backoff);

            sqlx::query(
                r#"
                UPDATE queue_items
                SET status = 'PENDING',
                    owner_session = '-',
                    started_at = '-',
                    lease_owner = NULL,
                    lease_expires_at = NULL,
                    attempt_count = attempt_count + 1,
                    notes = CASE WHEN notes = '' THEN ? ELSE notes || ' | ' || ? END,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&note)
            .bind(&note)
            .bind(&wall)
            .bind(&item.id)
            .execute(&mut *tx)
            .await?;

            Self::append_event_on(
                &mut tx,
                &item.id,
                &EventType::Retried,
                json!({"reason": "failed_or_timeout"}),
                &wall,
            )
            .await?;
            retried.push(item.id);
        }

        tx.commit().await?;
        if !retried.is_empty() {
            info!(count = retried.len(), "retry sweep reset items");
        }
        Ok(retried)
    }

    async fn mark_terminal(&self, id: &str, status: ItemStatus, notes: &str) -> Result<()> {
        let wall = self.clock.now_wall();
        let notes = notes.trim();
        let last_error = if status == ItemStatus::Failed { notes } else { "" };

        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "UPDATE queue_items SET status = ?, notes = ?, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(notes)
        .bind(last_error)
        .bind(&wall)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let event_type = match status {
            ItemStatus::Done => EventType::Done,
            ItemStatus::Failed => EventType::Failed,
            ItemStatus::Blocked => EventType::Blocked,
            other => {
                return Err(StoreError::InvalidTransition(format!(
                    "{other} is not a terminal status"
                )))
            }
        };
        Self::append_event_on(&mut tx, id, &event_type, json!({"notes": notes}), &wall).await?;

        tx.commit().await?;
        info!(item_id = id, status = %status, "terminal transition");
        Ok(())
    }

    /// Terminal transition to DONE. Replaces notes, clears `last_error`.
    pub async fn mark_done(&self, id: &str, notes: &str) -> Result<()> {
        self.mark_terminal(id, ItemStatus::Done, notes).await
    }

    /// Terminal transition to FAILED. Replaces notes and sets `last_error`.
    pub async fn mark_failed(&self, id: &str, notes: &str) -> Result<()> {
        self.mark_terminal(id, ItemStatus::Failed, notes).await
    }

    /// Terminal transition to BLOCKED with a machine-readable reason.
    pub async fn mark_blocked(&self, id: &str, reason: &str) -> Result<()> {
        self.mark_terminal(id, ItemStatus::Blocked, reason).await
    }

    /// Put an item back to PENDING with owner/lease cleared, replacing
    /// notes, optionally pinning `attempt_count`, and emitting the
    /// caller's audit event in the same transaction. Routing and operator
    /// actions are built on this.
    pub async fn reset_to_pending(
        &self,
        id: &str,
        notes: &str,
        attempt_count: Option<i64>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<()> {
        let wall = self.clock.now_wall();
        let mut tx = self.pool.begin().await?;

        let affected = if let Some(attempts) = attempt_count {
            sqlx::query(
                r#"
                UPDATE queue_items
                SET status = 'PENDING', owner_session = '-', started_at = '-',
                    lease_owner = NULL, lease_expires_at = NULL,
                    attempt_count = ?, notes = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(attempts)
            .bind(notes)
            .bind(&wall)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE queue_items
                SET status = 'PENDING', owner_session = '-', started_at = '-',
                    lease_owner = NULL, lease_expires_at = NULL,
                    notes = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(notes)
            .bind(&wall)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Self::append_event_on(&mut tx, id, &event_type, payload, &wall).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Audit record of a guardrail decision.
    pub async fn append_guardrail_event(
        &self,
        item_id: &str,
        state: &str,
        action: &str,
        current_tokens: i64,
        estimated_tokens: i64,
        violations: serde_json::Value,
    ) -> Result<i64> {
        self.append_event(
            item_id,
            EventType::Guardrail,
            json!({
                "state": state,
                "action": action,
                "current_tokens": current_tokens,
                "estimated_tokens": estimated_tokens,
                "violations": violations,
            }),
        )
        .await
    }

    /// Full event log for one item, in append order.
    pub async fn events_for_item(&self, item_id: &str) -> Result<Vec<EventRecord>> {
        Ok(sqlx::query_as::<_, EventRecord>(
            "SELECT event_id, item_id, event_type, payload_json, created_at \
             FROM queue_events WHERE item_id = ? ORDER BY event_id ASC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Whole event log in append order.
    pub async fn events(&self) -> Result<Vec<EventRecord>> {
        Ok(sqlx::query_as::<_, EventRecord>(
            "SELECT event_id, item_id, event_type, payload_json, created_at \
             FROM queue_events ORDER BY event_id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Count of log entries with the given type (KPI input).
    pub async fn count_events(&self, event_type: &EventType) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_events WHERE event_type = ?")
                .bind(event_type.as_str())
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

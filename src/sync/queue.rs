//! Pending-Operation Queue - durable, collapsing outbox of local mutations
//!
//! Every committed local write leaves one entry here until the remote store
//! confirms it. Entries are keyed by `(entity_type, entity_id)`:
//! - A newer operation supersedes the older one (collapse at enqueue time)
//! - Failed entries stay queued with exponential backoff, never given up
//! - Resolution is idempotent
//!
//! Repositories only enqueue; everything else belongs to the coordinator.

use super::models::{OperationKind, PendingOperation, QueueStats};
use super::now_millis;
use crate::db::{Database, DbError, DbResult};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

const BASE_DELAY_SECS: u64 = 30; // Initial retry delay: 30 seconds
const MAX_DELAY_SECS: u64 = 3600; // Max retry delay: 1 hour

const SELECT_COLUMNS: &str = "entity_type, entity_id, kind, payload, revision, enqueued_at, \
                              attempt_count, last_error, next_attempt_at";

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff keyed by attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: BASE_DELAY_SECS,
            max_secs: MAX_DELAY_SECS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt_count` (1 = first retry)
    pub fn delay_ms(&self, attempt_count: u32) -> i64 {
        let exponent = attempt_count.saturating_sub(1).min(32);
        let delay_secs = self
            .base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_secs);
        i64::try_from(delay_secs.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

/// What acknowledging a sent operation did to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledged {
    /// Entry removed (or was already gone)
    Resolved,
    /// A newer operation replaced the sent one and stays queued
    Superseded,
    /// The create reached the server; the newer edit now goes out as an update
    ConvertedToUpdate,
}

// ============================================================================
// Queue
// ============================================================================

/// SQLite-backed pending-operation queue
pub struct PendingQueue {
    db: Arc<Database>,
    backoff: BackoffPolicy,
}

impl PendingQueue {
    pub fn new(db: Arc<Database>, backoff: BackoffPolicy) -> Self {
        Self { db, backoff }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Insert an operation, or collapse it into the existing entry for the key
    pub fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        kind: OperationKind,
        payload: Option<&str>,
    ) -> QueueResult<PendingOperation> {
        let op = self
            .db
            .transaction(|tx| Self::enqueue_in(tx, entity_type, entity_id, kind, payload))?;
        Ok(op)
    }

    /// Connection-level enqueue, for use inside a caller's transaction
    pub fn enqueue_in(
        conn: &Connection,
        entity_type: &str,
        entity_id: &str,
        kind: OperationKind,
        payload: Option<&str>,
    ) -> DbResult<PendingOperation> {
        let now = now_millis();

        match Self::get_in(conn, entity_type, entity_id)? {
            None => {
                conn.execute(
                    r#"
                    INSERT INTO pending_operations (
                        entity_type, entity_id, kind, payload, revision,
                        enqueued_at, attempt_count, last_error, next_attempt_at
                    ) VALUES (?1, ?2, ?3, ?4, 1, ?5, 0, NULL, ?5)
                    "#,
                    params![entity_type, entity_id, kind.as_str(), payload, now],
                )?;
                log::debug!("Queued {} {}/{}", kind, entity_type, entity_id);
            }
            Some(existing) => {
                let collapsed = existing.kind.collapse(kind);
                // enqueued_at is kept so a frequently edited record is not starved
                conn.execute(
                    r#"
                    UPDATE pending_operations
                    SET kind = ?3, payload = ?4, revision = revision + 1,
                        attempt_count = 0, last_error = NULL, next_attempt_at = ?5
                    WHERE entity_type = ?1 AND entity_id = ?2
                    "#,
                    params![entity_type, entity_id, collapsed.as_str(), payload, now],
                )?;
                log::debug!(
                    "Collapsed {} onto {} for {}/{} -> {}",
                    kind, existing.kind, entity_type, entity_id, collapsed
                );
            }
        }

        Self::get_in(conn, entity_type, entity_id)?
            .ok_or_else(|| DbError::Serialization(format!("queue entry {}/{} vanished", entity_type, entity_id)))
    }

    /// Due operations for a type, oldest first
    pub fn peek_batch(&self, entity_type: &str, limit: usize) -> QueueResult<Vec<PendingOperation>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ops = self.db.query(
            &format!(
                "SELECT {} FROM pending_operations
                 WHERE entity_type = ?1 AND next_attempt_at <= ?2
                 ORDER BY enqueued_at ASC, rowid ASC
                 LIMIT ?3",
                SELECT_COLUMNS
            ),
            params![entity_type, now_millis(), limit],
            row_to_operation,
        )?;
        Ok(ops)
    }

    /// Every entry for a type regardless of backoff, oldest first
    pub fn list(&self, entity_type: &str) -> QueueResult<Vec<PendingOperation>> {
        let ops = self.db.query(
            &format!(
                "SELECT {} FROM pending_operations WHERE entity_type = ?1
                 ORDER BY enqueued_at ASC, rowid ASC",
                SELECT_COLUMNS
            ),
            params![entity_type],
            row_to_operation,
        )?;
        Ok(ops)
    }

    /// Remove the entry for a key. Absent keys are a no-op.
    pub fn mark_resolved(&self, entity_type: &str, entity_id: &str) -> QueueResult<bool> {
        let removed = self.db.execute(
            "DELETE FROM pending_operations WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, entity_id],
        )?;
        if removed > 0 {
            log::debug!("Resolved pending operation {}/{}", entity_type, entity_id);
        }
        Ok(removed > 0)
    }

    /// Count a failed attempt and schedule the next one
    pub fn mark_failed(
        &self,
        entity_type: &str,
        entity_id: &str,
        error: &str,
    ) -> QueueResult<Option<PendingOperation>> {
        let backoff = self.backoff;
        let op = self
            .db
            .transaction(|tx| Self::mark_failed_in(tx, backoff, entity_type, entity_id, error))?;
        Ok(op)
    }

    /// Like [`mark_failed`](Self::mark_failed), but only if `op` is still the
    /// current entry. A superseding operation stays due immediately.
    pub fn record_failure(&self, op: &PendingOperation, error: &str) -> QueueResult<Option<PendingOperation>> {
        let backoff = self.backoff;
        let updated = self.db.transaction(|tx| {
            match Self::get_in(tx, &op.entity_type, &op.entity_id)? {
                Some(current) if current.revision == op.revision => {
                    Self::mark_failed_in(tx, backoff, &op.entity_type, &op.entity_id, error)
                }
                other => Ok(other),
            }
        })?;
        Ok(updated)
    }

    fn mark_failed_in(
        conn: &Connection,
        backoff: BackoffPolicy,
        entity_type: &str,
        entity_id: &str,
        error: &str,
    ) -> DbResult<Option<PendingOperation>> {
        let Some(current) = Self::get_in(conn, entity_type, entity_id)? else {
            return Ok(None);
        };

        let attempt_count = current.attempt_count.saturating_add(1);
        let next_attempt_at = now_millis().saturating_add(backoff.delay_ms(attempt_count));

        conn.execute(
            r#"
            UPDATE pending_operations
            SET attempt_count = ?3, last_error = ?4, next_attempt_at = ?5
            WHERE entity_type = ?1 AND entity_id = ?2
            "#,
            params![entity_type, entity_id, attempt_count, error, next_attempt_at],
        )?;

        log::warn!(
            "Pending {} {}/{} failed (attempt {}): {}",
            current.kind, entity_type, entity_id, attempt_count, error
        );

        Self::get_in(conn, entity_type, entity_id)
    }

    /// Settle a sent operation after the remote store answered for it
    pub fn acknowledge(&self, op: &PendingOperation) -> QueueResult<Acknowledged> {
        let outcome = self.db.transaction(|tx| Self::acknowledge_in(tx, op))?;
        Ok(outcome)
    }

    pub fn acknowledge_in(conn: &Connection, op: &PendingOperation) -> DbResult<Acknowledged> {
        let Some(current) = Self::get_in(conn, &op.entity_type, &op.entity_id)? else {
            return Ok(Acknowledged::Resolved);
        };

        if current.revision == op.revision {
            conn.execute(
                "DELETE FROM pending_operations WHERE entity_type = ?1 AND entity_id = ?2",
                params![op.entity_type, op.entity_id],
            )?;
            return Ok(Acknowledged::Resolved);
        }

        if op.kind == OperationKind::Create && current.kind == OperationKind::Create {
            conn.execute(
                "UPDATE pending_operations SET kind = ?3 WHERE entity_type = ?1 AND entity_id = ?2",
                params![op.entity_type, op.entity_id, OperationKind::Update.as_str()],
            )?;
            return Ok(Acknowledged::ConvertedToUpdate);
        }

        Ok(Acknowledged::Superseded)
    }

    pub fn get(&self, entity_type: &str, entity_id: &str) -> QueueResult<Option<PendingOperation>> {
        let conn = self.db.get_conn()?;
        Ok(Self::get_in(&conn, entity_type, entity_id)?)
    }

    pub fn get_in(conn: &Connection, entity_type: &str, entity_id: &str) -> DbResult<Option<PendingOperation>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM pending_operations WHERE entity_type = ?1 AND entity_id = ?2",
                SELECT_COLUMNS
            ),
            params![entity_type, entity_id],
            row_to_operation,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn has_pending(&self, entity_type: &str, entity_id: &str) -> QueueResult<bool> {
        Ok(self.get(entity_type, entity_id)?.is_some())
    }

    pub fn has_pending_in(conn: &Connection, entity_type: &str, entity_id: &str) -> DbResult<bool> {
        Ok(Self::get_in(conn, entity_type, entity_id)?.is_some())
    }

    /// Make every entry due now (e.g. connectivity came back)
    pub fn reset_backoff(&self) -> QueueResult<usize> {
        let now = now_millis();
        let updated = self.db.execute(
            "UPDATE pending_operations SET next_attempt_at = ?1 WHERE next_attempt_at > ?1",
            params![now],
        )?;
        if updated > 0 {
            log::info!("Reset backoff for {} pending operations", updated);
        }
        Ok(updated)
    }

    /// Entity types with queued work, oldest work first
    pub fn pending_entity_types(&self) -> QueueResult<Vec<String>> {
        let types = self.db.query(
            "SELECT entity_type FROM pending_operations
             GROUP BY entity_type ORDER BY MIN(enqueued_at) ASC",
            [],
            |row| row.get(0),
        )?;
        Ok(types)
    }

    /// Move an entry to a server-assigned id
    pub fn rekey_in(conn: &Connection, entity_type: &str, old_id: &str, new_id: &str) -> DbResult<bool> {
        conn.execute(
            "DELETE FROM pending_operations WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, new_id],
        )?;
        let moved = conn.execute(
            "UPDATE pending_operations SET entity_id = ?3 WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type, old_id, new_id],
        )?;
        Ok(moved > 0)
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueResult<QueueStats> {
        let stats = self.db.query_row(
            r#"
            SELECT
                COUNT(*),
                SUM(CASE WHEN next_attempt_at <= ?1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN attempt_count > 0 THEN 1 ELSE 0 END),
                SUM(CASE WHEN kind = 'CREATE' THEN 1 ELSE 0 END),
                SUM(CASE WHEN kind = 'UPDATE' THEN 1 ELSE 0 END),
                SUM(CASE WHEN kind = 'DELETE' THEN 1 ELSE 0 END)
            FROM pending_operations
            "#,
            params![now_millis()],
            |row| {
                // SUM over zero rows is NULL
                let count = |idx: usize| -> rusqlite::Result<u64> {
                    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0).max(0) as u64)
                };
                Ok(QueueStats {
                    total: count(0)?,
                    due: count(1)?,
                    failing: count(2)?,
                    creates: count(3)?,
                    updates: count(4)?,
                    deletes: count(5)?,
                })
            },
        )?;
        Ok(stats)
    }
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOperation> {
    let kind: String = row.get(2)?;
    let kind = OperationKind::from_str(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown operation kind {:?}", kind).into(),
        )
    })?;

    Ok(PendingOperation {
        entity_type: row.get(0)?,
        entity_id: row.get(1)?,
        kind,
        payload: row.get(3)?,
        revision: row.get(4)?,
        enqueued_at: row.get(5)?,
        attempt_count: row.get(6)?,
        last_error: row.get(7)?,
        next_attempt_at: row.get(8)?,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::DatabaseError(DbError::from(err))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

// ============================================================================
// Tests
// ============================================================================

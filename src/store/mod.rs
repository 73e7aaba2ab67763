//! Local Store - durable record storage, source of truth for the UI
//!
//! Stores one row per entity in the `records` table and broadcasts the
//! entity type of every committed change so observers can re-query.
//!
//! The `*_in` functions take a connection so callers can combine a store
//! write with a queue write in a single transaction; the caller is then
//! responsible for calling [`LocalStore::notify_changed`] after commit.

use crate::db::{Database, DbError, DbResult};
use crate::mapper::LocalRecord;
use futures::stream::{self, Stream};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

const SELECT_COLUMNS: &str =
    "entity_type, id, owner_id, payload, created_at, updated_at";

/// Local record store with change notifications
pub struct LocalStore {
    db: Arc<Database>,
    changes: broadcast::Sender<String>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Get a record by id
    pub fn get(&self, entity_type: &str, id: &str) -> DbResult<Option<LocalRecord>> {
        let conn = self.db.get_conn()?;
        Self::get_in(&conn, entity_type, id)
    }

    /// Get all records of a type, oldest first
    pub fn get_all(&self, entity_type: &str) -> DbResult<Vec<LocalRecord>> {
        self.db.query(
            &format!(
                "SELECT {} FROM records WHERE entity_type = ?1 ORDER BY created_at ASC, id ASC",
                SELECT_COLUMNS
            ),
            params![entity_type],
            row_to_record,
        )
    }

    /// Get all records of a type owned by `owner_id`
    pub fn get_all_for_owner(&self, entity_type: &str, owner_id: &str) -> DbResult<Vec<LocalRecord>> {
        self.db.query(
            &format!(
                "SELECT {} FROM records WHERE entity_type = ?1 AND owner_id = ?2
                 ORDER BY created_at ASC, id ASC",
                SELECT_COLUMNS
            ),
            params![entity_type, owner_id],
            row_to_record,
        )
    }

    /// Count records of a type
    pub fn count(&self, entity_type: &str) -> DbResult<i64> {
        self.db.query_row(
            "SELECT COUNT(*) FROM records WHERE entity_type = ?1",
            params![entity_type],
            |row| row.get(0),
        )
    }

    // ========================================================================
    // Writes (auto-commit, notify immediately)
    // ========================================================================

    /// Insert or replace a record
    pub fn insert_or_replace(&self, record: &LocalRecord) -> DbResult<()> {
        {
            let conn = self.db.get_conn()?;
            Self::upsert_in(&conn, record)?;
        }
        self.notify_changed(&record.entity_type);
        Ok(())
    }

    /// Delete a record, returning whether it existed
    pub fn delete(&self, entity_type: &str, id: &str) -> DbResult<bool> {
        let removed = {
            let conn = self.db.get_conn()?;
            Self::delete_in(&conn, entity_type, id)?
        };
        if removed {
            self.notify_changed(entity_type);
        }
        Ok(removed)
    }

    // ========================================================================
    // Connection-level operations (for transactions)
    // ========================================================================

    pub fn get_in(conn: &Connection, entity_type: &str, id: &str) -> DbResult<Option<LocalRecord>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM records WHERE entity_type = ?1 AND id = ?2",
                SELECT_COLUMNS
            ),
            params![entity_type, id],
            row_to_record,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn upsert_in(conn: &Connection, record: &LocalRecord) -> DbResult<()> {
        let payload = record
            .payload_json()
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO records (entity_type, id, owner_id, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(entity_type, id) DO UPDATE SET
                owner_id = excluded.owner_id,
                payload = excluded.payload,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            params![
                record.entity_type,
                record.id,
                record.owner_id,
                payload,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_in(conn: &Connection, entity_type: &str, id: &str) -> DbResult<bool> {
        let affected = conn.execute(
            "DELETE FROM records WHERE entity_type = ?1 AND id = ?2",
            params![entity_type, id],
        )?;
        Ok(affected > 0)
    }

    /// Move a record to a server-assigned id
    pub fn rekey_in(conn: &Connection, entity_type: &str, old_id: &str, new_id: &str) -> DbResult<bool> {
        // A stale row under the new id would block the rename
        conn.execute(
            "DELETE FROM records WHERE entity_type = ?1 AND id = ?2",
            params![entity_type, new_id],
        )?;
        let affected = conn.execute(
            "UPDATE records SET id = ?3 WHERE entity_type = ?1 AND id = ?2",
            params![entity_type, old_id, new_id],
        )?;
        Ok(affected > 0)
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// Subscribe to change notifications (entity type of each change)
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    /// Announce that records of `entity_type` changed
    pub fn notify_changed(&self, entity_type: &str) {
        // No receivers is fine: nobody is observing yet
        let _ = self.changes.send(entity_type.to_string());
    }

    /// Live sequence of all records of a type.
    ///
    /// Emits the current snapshot first, then a fresh snapshot after every
    /// change to that type. Each call creates an independent subscription.
    pub fn observe(
        self: Arc<Self>,
        entity_type: &str,
    ) -> impl Stream<Item = DbResult<Vec<LocalRecord>>> + Send + 'static {
        let receiver = self.subscribe();
        let state = (self, receiver, entity_type.to_string(), true);

        stream::unfold(state, |(store, mut receiver, entity_type, first)| async move {
            if !first {
                loop {
                    match receiver.recv().await {
                        Ok(changed) if changed == entity_type => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::debug!("Observer for {} lagged by {} changes", entity_type, skipped);
                            break;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }

            let snapshot = store.get_all(&entity_type);
            Some((snapshot, (store, receiver, entity_type, false)))
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalRecord> {
    let payload: String = row.get(3)?;
    let payload = LocalRecord::parse_payload(&payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(LocalRecord {
        entity_type: row.get(0)?,
        id: row.get(1)?,
        owner_id: row.get(2)?,
        payload,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

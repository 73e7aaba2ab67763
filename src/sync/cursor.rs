//! Sync cursors - pull watermark per entity type and user
//!
//! Owned by the coordinator. `last_pulled_at` bounds incremental pulls;
//! `last_full_sync_at` records when a complete pass last finished. Each
//! signed-in user gets their own cursors, so a different account on the
//! same device starts with a full pull.

use crate::db::{Database, DbResult};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity_type: String,
    /// Empty when pulled without a signed-in user
    pub owner_id: String,
    /// Greatest remote `updated_at` seen by a pull (ms)
    pub last_pulled_at: Option<i64>,
    pub last_full_sync_at: Option<i64>,
}

pub struct CursorStore {
    db: Arc<Database>,
}

impl CursorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn get(&self, entity_type: &str, owner_id: &str) -> DbResult<SyncCursor> {
        let cursor = self.db.query_row_optional(
            "SELECT entity_type, owner_id, last_pulled_at, last_full_sync_at
             FROM sync_cursors WHERE entity_type = ?1 AND owner_id = ?2",
            params![entity_type, owner_id],
            |row| {
                Ok(SyncCursor {
                    entity_type: row.get(0)?,
                    owner_id: row.get(1)?,
                    last_pulled_at: row.get(2)?,
                    last_full_sync_at: row.get(3)?,
                })
            },
        )?;

        Ok(cursor.unwrap_or_else(|| SyncCursor {
            entity_type: entity_type.to_string(),
            owner_id: owner_id.to_string(),
            ..SyncCursor::default()
        }))
    }

    /// Advance the pull watermark; never moves it backwards
    pub fn advance_pulled(&self, entity_type: &str, owner_id: &str, pulled_at: i64) -> DbResult<()> {
        self.db.execute(
            r#"
            INSERT INTO sync_cursors (entity_type, owner_id, last_pulled_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_type, owner_id) DO UPDATE SET
                last_pulled_at = MAX(COALESCE(last_pulled_at, excluded.last_pulled_at), excluded.last_pulled_at)
            "#,
            params![entity_type, owner_id, pulled_at],
        )?;
        Ok(())
    }

    pub fn mark_full_sync(&self, entity_type: &str, owner_id: &str, at: i64) -> DbResult<()> {
        self.db.execute(
            r#"
            INSERT INTO sync_cursors (entity_type, owner_id, last_full_sync_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_type, owner_id) DO UPDATE SET last_full_sync_at = excluded.last_full_sync_at
            "#,
            params![entity_type, owner_id, at],
        )?;
        Ok(())
    }
}

//! Sync Diagnostics - non-blocking record of sync outcomes
//!
//! Sync failures never reach the caller that made the local write, so this
//! is where they become observable:
//! - Live [`SyncEvent`] broadcast for UI/telemetry subscribers
//! - Persistent log of retries, drops and applied pulls
//! - Retention policy to bound storage

use super::models::SyncEvent;
use super::now_millis;
use crate::db::{Database, DbError};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

// ============================================================================
// Types & Structures
// ============================================================================

/// Outcome stored with each diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticOutcome {
    Retrying,
    Dropped,
    Applied,
}

impl DiagnosticOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrying => "retrying",
            Self::Dropped => "dropped",
            Self::Applied => "applied",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "retrying" => Ok(Self::Retrying),
            "dropped" => Ok(Self::Dropped),
            "applied" => Ok(Self::Applied),
            _ => Err(format!("Invalid outcome: {}", s)),
        }
    }
}

/// A persisted diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    /// Operation kind (`CREATE`/`UPDATE`/`DELETE`) or `PULL`
    pub operation: String,
    pub outcome: DiagnosticOutcome,
    pub message: Option<String>,
    pub created_at: i64,
}

// ============================================================================
// Diagnostic Log
// ============================================================================

pub struct DiagnosticLog {
    db: Arc<Database>,
    events: broadcast::Sender<SyncEvent>,
}

impl DiagnosticLog {
    pub fn new(db: Arc<Database>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { db, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Publish an event and persist it if it is worth keeping.
    ///
    /// Never fails: a diagnostics problem must not disturb syncing.
    pub fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.persist(&event) {
            log::warn!("Failed to persist sync diagnostic: {}", e);
        }
        let _ = self.events.send(event);
    }

    fn persist(&self, event: &SyncEvent) -> Result<(), DiagnosticsError> {
        let (entity_type, entity_id, operation, outcome, message) = match event {
            SyncEvent::OperationRetrying {
                entity_type,
                entity_id,
                kind,
                error,
                ..
            } => (entity_type, entity_id, kind.as_str(), DiagnosticOutcome::Retrying, Some(error.as_str())),
            SyncEvent::OperationDropped {
                entity_type,
                entity_id,
                kind,
                error,
            } => (entity_type, entity_id, kind.as_str(), DiagnosticOutcome::Dropped, Some(error.as_str())),
            SyncEvent::RemoteApplied {
                entity_type,
                entity_id,
                ..
            } => (entity_type, entity_id, "PULL", DiagnosticOutcome::Applied, None),
            SyncEvent::OperationSynced { .. } | SyncEvent::PassCompleted(_) => return Ok(()),
        };

        self.db.execute(
            r#"
            INSERT INTO sync_diagnostics (entity_type, entity_id, operation, outcome, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![entity_type, entity_id, operation, outcome.as_str(), message, now_millis()],
        )?;
        Ok(())
    }

    /// Most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<DiagnosticEntry>, DiagnosticsError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = self.db.query(
            r#"
            SELECT id, entity_type, entity_id, operation, outcome, message, created_at
            FROM sync_diagnostics
            ORDER BY created_at DESC, id DESC
            LIMIT ?1
            "#,
            params![limit],
            |row| {
                let outcome: String = row.get(4)?;
                Ok(DiagnosticEntry {
                    id: row.get(0)?,
                    entity_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    operation: row.get(3)?,
                    outcome: DiagnosticOutcome::from_str(&outcome).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
                    })?,
                    message: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )?;
        Ok(entries)
    }

    /// Enforce retention policy - delete entries older than `retention_days`
    pub fn enforce_retention(&self, retention_days: i64) -> Result<usize, DiagnosticsError> {
        let cutoff = now_millis() - retention_days.saturating_mul(MS_PER_DAY);
        let deleted = self.db.execute(
            "DELETE FROM sync_diagnostics WHERE created_at < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            log::info!("Removed {} sync diagnostics older than {} days", deleted, retention_days);
        }
        Ok(deleted)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{OperationKind, SyncReport};

    fn create_test_log() -> DiagnosticLog {
        DiagnosticLog::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn dropped(id: &str) -> SyncEvent {
        SyncEvent::OperationDropped {
            entity_type: "tasks".into(),
            entity_id: id.into(),
            kind: OperationKind::Update,
            error: "Record not found".into(),
        }
    }

    #[test]
    fn test_persists_only_noteworthy_events() {
        let log = create_test_log();

        log.emit(SyncEvent::OperationSynced {
            entity_type: "tasks".into(),
            entity_id: "t0".into(),
            kind: OperationKind::Create,
        });
        log.emit(SyncEvent::PassCompleted(SyncReport::default()));
        log.emit(dropped("t1"));
        log.emit(SyncEvent::RemoteApplied {
            entity_type: "goals".into(),
            entity_id: "g1".into(),
            updated_at: 5,
        });

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entity_id, "g1");
        assert_eq!(entries[0].operation, "PULL");
        assert_eq!(entries[0].outcome, DiagnosticOutcome::Applied);
        assert_eq!(entries[1].outcome, DiagnosticOutcome::Dropped);
        assert_eq!(entries[1].message.as_deref(), Some("Record not found"));
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let log = create_test_log();
        let mut events = log.subscribe();

        log.emit(dropped("t1"));

        assert_eq!(events.recv().await.unwrap(), dropped("t1"));
    }

    #[test]
    fn test_retention_policy() {
        let log = create_test_log();
        log.emit(dropped("t1"));

        // Nothing is older than 30 days yet
        assert_eq!(log.enforce_retention(30).unwrap(), 0);
        assert_eq!(log.recent(10).unwrap().len(), 1);

        log.db
            .execute("UPDATE sync_diagnostics SET created_at = created_at - ?1", params![31 * MS_PER_DAY])
            .unwrap();
        assert_eq!(log.enforce_retention(30).unwrap(), 1);
        assert!(log.recent(10).unwrap().is_empty());
    }
}

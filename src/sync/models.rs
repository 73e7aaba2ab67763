//! Sync Data Models
//!
//! Shared types for the queue, coordinator and diagnostics:
//! - PendingOperation: one not-yet-confirmed mutation
//! - SyncTrigger / SyncState: what starts a pass and where it is
//! - SyncEvent: non-blocking outcome notifications
//! - Reports: per-pass counters

use crate::mapper::MapperError;
use crate::remote::{FailureClass, RemoteError};
use serde::{Deserialize, Serialize};

// ============================================================================
// Pending Operations
// ============================================================================

/// Kind of local mutation awaiting remote confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Net effect of `incoming` enqueued on top of `self` for the same key
    pub fn collapse(self, incoming: Self) -> Self {
        match (self, incoming) {
            (_, Self::Delete) => Self::Delete,
            // Never reached the server yet, so it is still a create
            (Self::Create, Self::Update) => Self::Create,
            // Existing remote row: upsert through update
            (Self::Update, Self::Create) => Self::Update,
            (_, incoming) => incoming,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue entry stored in `pending_operations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub entity_type: String,
    pub entity_id: String,
    pub kind: OperationKind,
    /// Snapshot of the record at enqueue time (JSON), informational only
    pub payload: Option<String>,
    /// Bumped each time a newer operation supersedes this entry
    pub revision: i64,
    pub enqueued_at: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
}

/// Queue totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    /// Entries eligible for the next drain
    pub due: u64,
    /// Entries that have failed at least once
    pub failing: u64,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
}

// ============================================================================
// Coordinator State
// ============================================================================

/// Reasons to run a sync pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// A repository committed a local write
    LocalMutation { entity_type: String },
    ConnectivityRestored,
    PeriodicTick,
    Manual,
}

/// Per-entity-type coordinator state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Draining,
    Pulling,
}

/// Failure of a single remote operation, classified for retry policy
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Transient sync error: {0}")]
    Transient(String),

    #[error("Permanent sync error: {0}")]
    Permanent(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err.class() {
            FailureClass::Transient => Self::Transient(err.to_string()),
            FailureClass::Permanent => Self::Permanent(err.to_string()),
        }
    }
}

impl From<MapperError> for SyncError {
    fn from(err: MapperError) -> Self {
        Self::Permanent(err.to_string())
    }
}

// ============================================================================
// Events & Reports
// ============================================================================

/// Non-blocking sync outcome notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    OperationSynced {
        entity_type: String,
        entity_id: String,
        kind: OperationKind,
    },
    OperationRetrying {
        entity_type: String,
        entity_id: String,
        kind: OperationKind,
        attempt_count: u32,
        next_attempt_at: i64,
        error: String,
    },
    OperationDropped {
        entity_type: String,
        entity_id: String,
        kind: OperationKind,
        error: String,
    },
    RemoteApplied {
        entity_type: String,
        entity_id: String,
        updated_at: i64,
    },
    PassCompleted(SyncReport),
}

/// Outcome of draining one entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub entity_type: String,
    pub attempted: usize,
    pub pushed: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Outcome of pulling one entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullReport {
    pub entity_type: String,
    pub fetched: usize,
    pub applied: usize,
    pub skipped_pending: usize,
    pub skipped_stale: usize,
    pub pruned: usize,
}

/// Outcome of a full pass (drain and pull)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub retried: usize,
    pub dropped: usize,
    pub pulled: usize,
    pub skipped_pending: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn add_drain(&mut self, drain: &DrainReport) {
        self.pushed += drain.pushed;
        self.retried += drain.retried;
        self.dropped += drain.dropped;
    }

    pub fn add_pull(&mut self, pull: &PullReport) {
        self.pulled += pull.applied;
        self.skipped_pending += pull.skipped_pending;
    }

    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.dropped == 0 && self.errors.is_empty()
    }
}

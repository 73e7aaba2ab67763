//! Sync Module - offline-first reconciliation with the remote store
//!
//! Provides:
//! - Pending-operation queue (durable, collapsing per entity key)
//! - Sync coordinator (drain, last-writer-wins pull, trigger loop)
//! - Connectivity monitor and periodic scheduler (trigger sources)
//! - Sync cursors and diagnostics
//!
//! Architecture:
//! - Local store is authoritative for the device; writes never wait on the network
//! - One coordinator per process drives every remote call
//! - Failures are data: transient ones back off, permanent ones are dropped and reported

pub mod connectivity;
pub mod coordinator;
pub mod cursor;
pub mod diagnostics;
pub mod models;
pub mod queue;
pub mod scheduler;


// Re-export commonly used types
pub use connectivity::ConnectivityMonitor;
pub use coordinator::{CoordinatorConfig, CoordinatorError, SyncCoordinator, SyncSignal};
pub use cursor::{CursorStore, SyncCursor};
pub use diagnostics::{DiagnosticEntry, DiagnosticLog, DiagnosticOutcome, DiagnosticsError};
pub use models::{
    DrainReport, OperationKind, PendingOperation, PullReport, QueueStats, SyncError, SyncEvent,
    SyncReport, SyncState, SyncTrigger,
};
pub use queue::{Acknowledged, BackoffPolicy, PendingQueue, QueueError};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

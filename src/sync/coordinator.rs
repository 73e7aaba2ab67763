//! Sync Coordinator - the single background worker that reconciles
//! the local store with the remote store
//!
//! Handles:
//! - Draining the pending-operation queue (push)
//! - Pulling remote changes with last-writer-wins
//! - Trigger handling (local mutation, connectivity restored, periodic tick)
//! - Retry policy (transient: backoff, permanent: drop with diagnostic)
//!
//! Per entity type the state machine is `Idle -> Draining -> Idle` (and
//! `Pulling` during a pull). Passes are serialized; a batch is a snapshot
//! taken at drain start, so work enqueued mid-drain waits for the next pass.

use super::connectivity::ConnectivityMonitor;
use super::cursor::CursorStore;
use super::diagnostics::DiagnosticLog;
use super::models::{
    DrainReport, OperationKind, PendingOperation, PullReport, QueueStats, SyncError, SyncEvent,
    SyncReport, SyncState, SyncTrigger,
};
use super::queue::{Acknowledged, PendingQueue, QueueError};
use super::now_millis;
use crate::auth::AuthContext;
use crate::db::DbError;
use crate::mapper::{EntityMapper, RemoteDto, SupabaseMapper};
use crate::models::ALL_ENTITY_TYPES;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::LocalStore;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Maximum operations taken per entity type per pass
    pub batch_size: usize,
    /// Bound on every remote call
    pub remote_timeout: Duration,
    /// Delete local rows missing from a full (cursor-less) pull
    pub prune_on_full_pull: bool,
    /// Entity types pulled on a full pass
    pub entity_types: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            remote_timeout: Duration::from_secs(30),
            prune_on_full_pull: false,
            entity_types: ALL_ENTITY_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

// ============================================================================
// Signal
// ============================================================================

/// Fire-and-forget handle for waking the coordinator
#[derive(Clone)]
pub struct SyncSignal {
    tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl SyncSignal {
    /// A signal and the receiving end it feeds
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncTrigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A signal connected to nothing; notifications are discarded
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn notify(&self, trigger: SyncTrigger) {
        if self.tx.send(trigger).is_err() {
            log::debug!("Sync coordinator is not listening; trigger dropped");
        }
    }

    pub fn local_mutation(&self, entity_type: &str) {
        self.notify(SyncTrigger::LocalMutation {
            entity_type: entity_type.to_string(),
        });
    }
}

/// Work requested by one or more coalesced triggers
#[derive(Debug, Default, PartialEq)]
struct PassPlan {
    full: bool,
    reset_backoff: bool,
    drain_types: BTreeSet<String>,
}

impl PassPlan {
    fn add(&mut self, trigger: SyncTrigger) {
        match trigger {
            SyncTrigger::LocalMutation { entity_type } => {
                self.drain_types.insert(entity_type);
            }
            SyncTrigger::ConnectivityRestored => {
                self.reset_backoff = true;
                self.full = true;
            }
            SyncTrigger::PeriodicTick | SyncTrigger::Manual => self.full = true,
        }
    }
}

enum Sent {
    Confirmed(RemoteDto),
    Deleted,
    /// Local record gone before it could be sent
    Missing,
}

enum PullOutcome {
    Applied,
    SkippedPending,
    SkippedStale,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    queue: Arc<PendingQueue>,
    cursors: CursorStore,
    remote: Arc<dyn RemoteStore>,
    mapper: Arc<dyn EntityMapper>,
    auth: Arc<dyn AuthContext>,
    connectivity: Arc<ConnectivityMonitor>,
    diagnostics: Arc<DiagnosticLog>,
    config: CoordinatorConfig,
    states: StdMutex<HashMap<String, SyncState>>,
    pass_lock: Mutex<()>,
    signal: SyncSignal,
    triggers: StdMutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<PendingQueue>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthContext>,
        connectivity: Arc<ConnectivityMonitor>,
        diagnostics: Arc<DiagnosticLog>,
        config: CoordinatorConfig,
    ) -> Self {
        let (signal, rx) = SyncSignal::channel();
        let cursors = CursorStore::new(Arc::clone(store.database()));

        Self {
            store,
            queue,
            cursors,
            remote,
            mapper: Arc::new(SupabaseMapper),
            auth,
            connectivity,
            diagnostics,
            config,
            states: StdMutex::new(HashMap::new()),
            pass_lock: Mutex::new(()),
            signal,
            triggers: StdMutex::new(Some(rx)),
        }
    }

    /// Replace the default Supabase mapper
    pub fn with_mapper(mut self, mapper: Arc<dyn EntityMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn signal(&self) -> SyncSignal {
        self.signal.clone()
    }

    pub fn queue(&self) -> &Arc<PendingQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticLog> {
        &self.diagnostics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.diagnostics.subscribe()
    }

    pub fn queue_stats(&self) -> Result<QueueStats, CoordinatorError> {
        Ok(self.queue.stats()?)
    }

    pub fn state(&self, entity_type: &str) -> SyncState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_type)
            .copied()
            .unwrap_or_default()
    }

    fn set_state(&self, entity_type: &str, state: SyncState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_type.to_string(), state);
    }

    // ========================================================================
    // Background Loop
    // ========================================================================

    /// Spawn the trigger loop on the current runtime
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                log::error!("Sync coordinator stopped: {}", e);
            }
        })
    }

    /// Consume triggers until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), CoordinatorError> {
        let mut triggers = self
            .triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(CoordinatorError::AlreadyRunning)?;

        // Transitions are buffered, so one that happens mid-pass is not lost
        let mut restored = self.connectivity.on_restored();
        let mut monitor_alive = true;

        log::info!("Sync coordinator started (online: {})", self.connectivity.is_online());

        loop {
            let plan = tokio::select! {
                _ = shutdown.cancelled() => break,
                trigger = triggers.recv() => {
                    let Some(trigger) = trigger else { break };
                    let mut plan = PassPlan::default();
                    plan.add(trigger);
                    // Coalesce whatever else is already waiting
                    while let Ok(next) = triggers.try_recv() {
                        plan.add(next);
                    }
                    plan
                }
                event = restored.recv(), if monitor_alive => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        monitor_alive = false;
                        continue;
                    }
                    let mut plan = PassPlan::default();
                    plan.add(SyncTrigger::ConnectivityRestored);
                    while restored.try_recv().is_ok() {}
                    while let Ok(next) = triggers.try_recv() {
                        plan.add(next);
                    }
                    plan
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.execute(plan) => {}
            }
        }

        // Hand the receiver back so the loop can be restarted
        *self.triggers.lock().unwrap_or_else(PoisonError::into_inner) = Some(triggers);
        log::info!("Sync coordinator stopped");
        Ok(())
    }

    async fn execute(&self, plan: PassPlan) {
        if !self.connectivity.is_online() {
            log::debug!("Offline; deferring sync pass ({} types queued)", plan.drain_types.len());
            return;
        }

        if plan.reset_backoff {
            if let Err(e) = self.queue.reset_backoff() {
                log::warn!("Failed to reset backoff: {}", e);
            }
        }

        if plan.full {
            if let Err(e) = self.sync_all().await {
                log::warn!("Sync pass failed: {}", e);
            }
            return;
        }

        for entity_type in &plan.drain_types {
            if let Err(e) = self.drain(entity_type).await {
                log::warn!("Drain of {} failed: {}", entity_type, e);
            }
        }
    }

    // ========================================================================
    // Passes
    // ========================================================================

    /// Drain every type with pending work, then pull every registered type
    pub async fn sync_all(&self) -> Result<SyncReport, CoordinatorError> {
        self.ensure_online()?;
        let _pass = self.pass_lock.lock().await;

        log::info!("Starting full sync pass");
        let mut report = SyncReport::default();

        for entity_type in self.queue.pending_entity_types()? {
            match self.drain_locked(&entity_type).await {
                Ok(drain) => report.add_drain(&drain),
                Err(e) => report.errors.push(format!("drain {}: {}", entity_type, e)),
            }
        }

        let owner_id = self.owner_key();
        let finished_at = now_millis();
        for entity_type in &self.config.entity_types {
            match self.pull_locked(entity_type, &owner_id).await {
                Ok(pull) => {
                    report.add_pull(&pull);
                    self.cursors.mark_full_sync(entity_type, &owner_id, finished_at)?;
                }
                Err(e) => report.errors.push(format!("pull {}: {}", entity_type, e)),
            }
        }

        log::info!(
            "Sync pass complete: {} pushed, {} retrying, {} dropped, {} pulled, {} errors",
            report.pushed,
            report.retried,
            report.dropped,
            report.pulled,
            report.errors.len()
        );
        self.diagnostics.emit(SyncEvent::PassCompleted(report.clone()));
        Ok(report)
    }

    /// Push due pending operations of one entity type
    pub async fn drain(&self, entity_type: &str) -> Result<DrainReport, CoordinatorError> {
        self.ensure_online()?;
        let _pass = self.pass_lock.lock().await;
        self.drain_locked(entity_type).await
    }

    /// Pull remote changes of one entity type
    pub async fn pull(&self, entity_type: &str) -> Result<PullReport, CoordinatorError> {
        self.ensure_online()?;
        let _pass = self.pass_lock.lock().await;
        self.pull_locked(entity_type, &self.owner_key()).await
    }

    /// Cursor key for the signed-in user; empty when signed out
    fn owner_key(&self) -> String {
        self.auth.current_owner_id().unwrap_or_default()
    }

    fn ensure_online(&self) -> Result<(), CoordinatorError> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(CoordinatorError::Offline)
        }
    }

    async fn drain_locked(&self, entity_type: &str) -> Result<DrainReport, CoordinatorError> {
        self.set_state(entity_type, SyncState::Draining);
        let result = self.drain_batch(entity_type).await;
        self.set_state(entity_type, SyncState::Idle);
        result
    }

    async fn drain_batch(&self, entity_type: &str) -> Result<DrainReport, CoordinatorError> {
        let batch = self.queue.peek_batch(entity_type, self.config.batch_size)?;
        let mut report = DrainReport {
            entity_type: entity_type.to_string(),
            ..DrainReport::default()
        };

        if batch.is_empty() {
            return Ok(report);
        }
        log::info!("Draining {} pending {} operations", batch.len(), entity_type);

        for op in &batch {
            report.attempted += 1;
            self.process(op, &mut report).await?;
        }

        Ok(report)
    }

    /// Send one operation and settle the queue entry from the outcome
    async fn process(&self, op: &PendingOperation, report: &mut DrainReport) -> Result<(), CoordinatorError> {
        match self.send(op).await {
            Ok(Sent::Confirmed(dto)) => {
                self.merge_confirmed(op, dto)?;
                log::info!("Synced {} {}/{}", op.kind, op.entity_type, op.entity_id);
                self.emit_synced(op);
                report.pushed += 1;
            }
            Ok(Sent::Deleted) => {
                self.queue.acknowledge(op)?;
                log::info!("Synced {} {}/{}", op.kind, op.entity_type, op.entity_id);
                self.emit_synced(op);
                report.pushed += 1;
            }
            Ok(Sent::Missing) => {
                log::debug!(
                    "{}/{} no longer exists locally; nothing to {}",
                    op.entity_type, op.entity_id, op.kind
                );
                self.queue.acknowledge(op)?;
            }
            Err(SyncError::Transient(message)) => {
                log::warn!(
                    "Retrying {} {}/{} later: {}",
                    op.kind, op.entity_type, op.entity_id, message
                );
                let (attempt_count, next_attempt_at) = match self.queue.record_failure(op, &message)? {
                    Some(current) => (current.attempt_count, current.next_attempt_at),
                    None => (op.attempt_count + 1, now_millis()),
                };
                self.diagnostics.emit(SyncEvent::OperationRetrying {
                    entity_type: op.entity_type.clone(),
                    entity_id: op.entity_id.clone(),
                    kind: op.kind,
                    attempt_count,
                    next_attempt_at,
                    error: message,
                });
                report.retried += 1;
            }
            Err(SyncError::Permanent(message)) => {
                log::error!(
                    "Dropping {} {}/{}: {}",
                    op.kind, op.entity_type, op.entity_id, message
                );
                if self.queue.acknowledge(op)? == Acknowledged::Superseded {
                    log::info!("Newer operation for {}/{} stays queued", op.entity_type, op.entity_id);
                }
                self.diagnostics.emit(SyncEvent::OperationDropped {
                    entity_type: op.entity_type.clone(),
                    entity_id: op.entity_id.clone(),
                    kind: op.kind,
                    error: message,
                });
                report.dropped += 1;
            }
        }
        Ok(())
    }

    fn emit_synced(&self, op: &PendingOperation) {
        self.diagnostics.emit(SyncEvent::OperationSynced {
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            kind: op.kind,
        });
    }

    /// Call the remote store with the record as it is locally right now
    async fn send(&self, op: &PendingOperation) -> Result<Sent, SyncError> {
        let entity_type = op.entity_type.as_str();

        if op.kind == OperationKind::Delete {
            return match self.call(self.remote.delete(entity_type, &op.entity_id)).await {
                Ok(existed) => {
                    if !existed {
                        log::debug!("{}/{} was already absent remotely", entity_type, op.entity_id);
                    }
                    Ok(Sent::Deleted)
                }
                Err(RemoteError::NotFound) => Ok(Sent::Deleted),
                Err(e) => Err(e.into()),
            };
        }

        let record = self
            .store
            .get(entity_type, &op.entity_id)
            .map_err(|e| SyncError::Transient(format!("local store: {}", e)))?;
        let Some(record) = record else {
            return Ok(Sent::Missing);
        };
        let dto = self.mapper.to_remote(&record)?;

        let confirmed = match op.kind {
            OperationKind::Create => match self.call(self.remote.create(entity_type, dto.clone())).await {
                Err(RemoteError::Conflict(reason)) => {
                    log::info!(
                        "{}/{} already exists remotely ({}); sending as update",
                        entity_type, op.entity_id, reason
                    );
                    self.call(self.remote.update(entity_type, dto)).await?
                }
                other => other?,
            },
            _ => self.call(self.remote.update(entity_type, dto)).await?,
        };

        Ok(Sent::Confirmed(confirmed))
    }

    /// Bound a remote call by the configured timeout
    async fn call<T, F>(&self, request: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.config.remote_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    /// Fold the server's canonical record back into the local store and
    /// settle the queue entry, atomically
    fn merge_confirmed(&self, op: &PendingOperation, dto: RemoteDto) -> Result<Acknowledged, CoordinatorError> {
        let server = match self.mapper.from_remote(&op.entity_type, dto) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!(
                    "Server representation of {}/{} unreadable ({}); keeping local copy",
                    op.entity_type, op.entity_id, e
                );
                None
            }
        };

        let outcome = self.store.database().transaction(|tx| {
            let mut sent = op.clone();

            if let Some(server) = &server {
                if server.id != op.entity_id {
                    log::info!(
                        "Server assigned id {} to {}/{}",
                        server.id, op.entity_type, op.entity_id
                    );
                    LocalStore::rekey_in(tx, &op.entity_type, &op.entity_id, &server.id)?;
                    PendingQueue::rekey_in(tx, &op.entity_type, &op.entity_id, &server.id)?;
                    sent.entity_id = server.id.clone();
                }
            }

            let superseded = matches!(
                PendingQueue::get_in(tx, &sent.entity_type, &sent.entity_id)?,
                Some(current) if current.revision != sent.revision
            );

            // A newer local edit wins over the echo of an older one
            if !superseded {
                if let (Some(mut server), Some(local)) =
                    (server.clone(), LocalStore::get_in(tx, &sent.entity_type, &sent.entity_id)?)
                {
                    server.updated_at = server.updated_at.max(local.updated_at);
                    server.created_at = local.created_at;
                    if server.owner_id.is_empty() {
                        server.owner_id = local.owner_id;
                    }
                    LocalStore::upsert_in(tx, &server)?;
                }
            }

            PendingQueue::acknowledge_in(tx, &sent)
        })?;

        self.store.notify_changed(&op.entity_type);
        Ok(outcome)
    }

    async fn pull_locked(&self, entity_type: &str, owner_id: &str) -> Result<PullReport, CoordinatorError> {
        self.set_state(entity_type, SyncState::Pulling);
        let result = self.pull_changes(entity_type, owner_id).await;
        self.set_state(entity_type, SyncState::Idle);
        result
    }

    /// Last-writer-wins pull: remote replaces local only when strictly newer
    /// and no local operation is pending for that id
    async fn pull_changes(&self, entity_type: &str, owner_id: &str) -> Result<PullReport, CoordinatorError> {
        let cursor = self.cursors.get(entity_type, owner_id)?;
        let full = cursor.last_pulled_at.is_none();

        let rows = self
            .call(self.remote.get_all(entity_type, cursor.last_pulled_at))
            .await
            .map_err(|e| CoordinatorError::Remote(e.into()))?;

        let mut report = PullReport {
            entity_type: entity_type.to_string(),
            ..PullReport::default()
        };
        let mut newest: Option<i64> = None;
        let mut seen = HashSet::new();

        for dto in rows {
            let record = match self.mapper.from_remote(entity_type, dto) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Skipping unreadable remote {} row: {}", entity_type, e);
                    continue;
                }
            };
            report.fetched += 1;
            newest = Some(newest.map_or(record.updated_at, |n| n.max(record.updated_at)));
            seen.insert(record.id.clone());

            let outcome = self.store.database().transaction(|tx| {
                if PendingQueue::has_pending_in(tx, entity_type, &record.id)? {
                    return Ok(PullOutcome::SkippedPending);
                }
                match LocalStore::get_in(tx, entity_type, &record.id)? {
                    Some(local) if record.updated_at <= local.updated_at => Ok(PullOutcome::SkippedStale),
                    _ => {
                        LocalStore::upsert_in(tx, &record)?;
                        Ok(PullOutcome::Applied)
                    }
                }
            })?;

            match outcome {
                PullOutcome::Applied => {
                    report.applied += 1;
                    self.diagnostics.emit(SyncEvent::RemoteApplied {
                        entity_type: entity_type.to_string(),
                        entity_id: record.id.clone(),
                        updated_at: record.updated_at,
                    });
                }
                PullOutcome::SkippedPending => {
                    log::debug!("Keeping local {}/{}: operation pending", entity_type, record.id);
                    report.skipped_pending += 1;
                }
                PullOutcome::SkippedStale => report.skipped_stale += 1,
            }
        }

        if full && self.config.prune_on_full_pull {
            report.pruned = self.prune_missing(entity_type, owner_id, &seen)?;
        }

        if let Some(newest) = newest {
            self.cursors.advance_pulled(entity_type, owner_id, newest)?;
        }

        if report.applied > 0 || report.pruned > 0 {
            self.store.notify_changed(entity_type);
        }

        log::info!(
            "Pulled {}: {} fetched, {} applied, {} kept (pending), {} pruned",
            entity_type, report.fetched, report.applied, report.skipped_pending, report.pruned
        );
        Ok(report)
    }

    /// Remove local rows of `owner_id` the server no longer has
    fn prune_missing(
        &self,
        entity_type: &str,
        owner_id: &str,
        seen: &HashSet<String>,
    ) -> Result<usize, CoordinatorError> {
        if owner_id.is_empty() {
            return Ok(0);
        }

        let mut pruned = 0;
        for local in self.store.get_all_for_owner(entity_type, owner_id)? {
            if seen.contains(&local.id) {
                continue;
            }
            let removed = self.store.database().transaction(|tx| {
                if PendingQueue::has_pending_in(tx, entity_type, &local.id)? {
                    return Ok(false);
                }
                LocalStore::delete_in(tx, entity_type, &local.id)
            })?;
            if removed {
                log::debug!("Pruned {}/{}: absent remotely", entity_type, local.id);
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Remote error: {0}")]
    Remote(SyncError),

    #[error("Offline - sync deferred until connectivity returns")]
    Offline,

    #[error("Sync coordinator is already running")]
    AlreadyRunning,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_coalesces_triggers() {
        let mut plan = PassPlan::default();
        plan.add(SyncTrigger::LocalMutation { entity_type: "tasks".into() });
        plan.add(SyncTrigger::LocalMutation { entity_type: "tasks".into() });
        plan.add(SyncTrigger::LocalMutation { entity_type: "goals".into() });

        assert!(!plan.full);
        assert_eq!(plan.drain_types.len(), 2);

        plan.add(SyncTrigger::ConnectivityRestored);
        assert!(plan.full);
        assert!(plan.reset_backoff);
    }

    #[test]
    fn test_detached_signal_discards_quietly() {
        let signal = SyncSignal::detached();
        signal.local_mutation("tasks");
        signal.notify(SyncTrigger::Manual);
    }

    #[test]
    fn test_default_config_pulls_every_entity_type() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.entity_types.len(), ALL_ENTITY_TYPES.len());
        assert!(config.entity_types.iter().any(|t| t == "tasks"));
    }
}

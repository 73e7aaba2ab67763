//! Sync Engine - wires storage, queue, coordinator and repositories together
//!
//! Provides:
//! - `SyncEngine::open` for the production HTTP stack built from configuration
//! - `SyncEngine::builder` for arbitrary collaborators (tests, other backends)
//! - Lifecycle: `start` spawns the coordinator loop, the connectivity probe
//!   and the periodic scheduler; `shutdown` cancels them. Pending work
//!   stays queued across restarts.

use crate::auth::AuthContext;
use crate::cache::{LookupCacheConfig, RemoteLookupCache};
use crate::config::{ConfigError, SyncEngineConfig};
use crate::db::{Database, DbError};
use crate::mapper::{EntityMapper, SupabaseMapper};
use crate::models::SyncEntity;
use crate::remote::{HttpRemoteStore, RemoteError, RemoteStore};
use crate::repository::{Repositories, Repository, RepositoryContext};
use crate::store::LocalStore;
use crate::sync::{
    BackgroundScheduler, BackoffPolicy, ConnectivityMonitor, CoordinatorConfig, CoordinatorError,
    DiagnosticLog, PendingQueue, QueueStats, SchedulerConfig, SchedulerError, SyncCoordinator,
    SyncEvent, SyncReport, SyncTrigger,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROBE_INTERVAL_SECS: u64 = 30;
const DIAGNOSTIC_RETENTION_DAYS: i64 = 30;

// ============================================================================
// Builder
// ============================================================================

pub struct SyncEngineBuilder {
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthContext>,
    mapper: Arc<dyn EntityMapper>,
    backoff: BackoffPolicy,
    coordinator: CoordinatorConfig,
    lookup_cache: LookupCacheConfig,
    scheduler: SchedulerConfig,
    initially_online: bool,
    probe: Option<(String, Duration)>,
}

impl SyncEngineBuilder {
    pub fn mapper(mut self, mapper: Arc<dyn EntityMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    pub fn lookup_cache(mut self, config: LookupCacheConfig) -> Self {
        self.lookup_cache = config;
        self
    }

    /// Defaults for the periodic scheduler; a configuration saved in the
    /// settings table takes precedence at start
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Probe `url` every `interval` to track connectivity
    pub fn connectivity_probe(mut self, url: impl Into<String>, interval: Duration) -> Self {
        self.probe = Some((url.into(), interval));
        self
    }

    pub fn build(self) -> SyncEngine {
        let store = Arc::new(LocalStore::new(Arc::clone(&self.db)));
        let queue = Arc::new(PendingQueue::new(Arc::clone(&self.db), self.backoff));
        let diagnostics = Arc::new(DiagnosticLog::new(Arc::clone(&self.db)));
        let connectivity = Arc::new(ConnectivityMonitor::new(self.initially_online));
        let remote_timeout = self.coordinator.remote_timeout;

        let coordinator = SyncCoordinator::new(
            Arc::clone(&store),
            queue,
            Arc::clone(&self.remote),
            Arc::clone(&self.auth),
            Arc::clone(&connectivity),
            diagnostics,
            self.coordinator,
        )
        .with_mapper(Arc::clone(&self.mapper));
        let coordinator = Arc::new(coordinator);

        let context = RepositoryContext {
            store,
            remote: self.remote,
            mapper: self.mapper,
            auth: self.auth,
            connectivity: Arc::clone(&connectivity),
            lookups: RemoteLookupCache::with_config(self.lookup_cache),
            signal: coordinator.signal(),
            remote_timeout,
        };
        let repositories = Repositories::new(&context);

        SyncEngine {
            scheduler: BackgroundScheduler::with_config(Arc::clone(&self.db), self.scheduler),
            db: self.db,
            coordinator,
            connectivity,
            context,
            repositories,
            probe: self.probe,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct SyncEngine {
    db: Arc<Database>,
    coordinator: Arc<SyncCoordinator>,
    connectivity: Arc<ConnectivityMonitor>,
    scheduler: BackgroundScheduler,
    context: RepositoryContext,
    repositories: Repositories,
    probe: Option<(String, Duration)>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn builder(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthContext>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            db,
            remote,
            auth,
            mapper: Arc::new(SupabaseMapper),
            backoff: BackoffPolicy::default(),
            coordinator: CoordinatorConfig::default(),
            lookup_cache: LookupCacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            initially_online: true,
            probe: None,
        }
    }

    /// Open the database at the configured path and connect to the
    /// configured remote over HTTP. Nothing runs until [`start`](Self::start).
    pub fn open(config: SyncEngineConfig, auth: Arc<dyn AuthContext>) -> Result<Self, EngineError> {
        config.validate()?;

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Arc::new(Database::new(&config.database_path)?);

        let remote = HttpRemoteStore::new(
            &config.remote_url,
            config.remote_api_key.clone(),
            config.remote_timeout,
            Arc::clone(&auth),
        )?;

        let engine = Self::builder(db, Arc::new(remote), auth)
            .backoff(BackoffPolicy {
                base_secs: config.backoff_base_secs,
                max_secs: config.backoff_max_secs,
            })
            .coordinator_config(CoordinatorConfig {
                batch_size: config.batch_size,
                remote_timeout: config.remote_timeout,
                prune_on_full_pull: config.prune_on_full_pull,
                ..CoordinatorConfig::default()
            })
            .lookup_cache(LookupCacheConfig {
                ttl_secs: config.lookup_cache_ttl_secs,
                ..LookupCacheConfig::default()
            })
            .scheduler(SchedulerConfig {
                interval_minutes: config.sync_interval_minutes,
                ..SchedulerConfig::default()
            })
            .connectivity_probe(config.remote_url, Duration::from_secs(PROBE_INTERVAL_SECS))
            .build();

        Ok(engine)
    }

    /// Spawn background work and request a startup sync
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let mut tasks = Vec::new();
        tasks.push(Arc::clone(&self.coordinator).spawn(self.shutdown.clone()));

        if let Some((url, interval)) = &self.probe {
            tasks.push(Arc::clone(&self.connectivity).spawn_probe(
                url.clone(),
                *interval,
                self.shutdown.clone(),
            )?);
        }
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);

        self.scheduler.load_config().await?;
        if self.scheduler.get_config().await.enabled {
            self.scheduler.start(self.coordinator.signal()).await?;
        }

        match self.coordinator.diagnostics().enforce_retention(DIAGNOSTIC_RETENTION_DAYS) {
            Ok(0) => {}
            Ok(removed) => log::info!("Removed {} expired diagnostic entries", removed),
            Err(e) => log::warn!("Failed to enforce diagnostics retention: {}", e),
        }

        self.coordinator.signal().notify(SyncTrigger::Manual);
        log::info!("Sync engine started");
        Ok(())
    }

    /// Stop background work. Queued operations are kept for the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if self.scheduler.is_running() {
            if let Err(e) = self.scheduler.stop().await {
                log::warn!("Failed to stop scheduler: {}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {}", e);
            }
        }

        log::info!("Sync engine stopped");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn repository<T: SyncEntity>(&self) -> Repository<T> {
        Repository::new(self.context.clone())
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    pub fn queue_stats(&self) -> Result<QueueStats, EngineError> {
        Ok(self.coordinator.queue_stats()?)
    }

    /// Run a full pass now and wait for it
    pub async fn sync_now(&self) -> Result<SyncReport, EngineError> {
        Ok(self.coordinator.sync_all().await?)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Connectivity probe error: {0}")]
    Probe(#[from] reqwest::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Sync error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Sync engine already started")]
    AlreadyStarted,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::mapper::RemoteDto;
    use crate::models::{Goal, Task};
    use crate::testing::MemoryRemote;
    use serde_json::json;

    fn engine_with(remote: Arc<MemoryRemote>) -> SyncEngine {
        let db = Arc::new(Database::in_memory().unwrap());
        SyncEngine::builder(db, remote, Arc::new(Session::signed_in("u1", None)))
            .scheduler(SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            })
            .build()
    }

    async fn wait_for_synced(events: &mut broadcast::Receiver<SyncEvent>, entity_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::OperationSynced { entity_id: id, .. }) if id == entity_id => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {}", e),
                }
            }
        })
        .await
        .expect("operation was not synced in time");
    }

    #[tokio::test]
    async fn test_mutation_is_pushed_in_background() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine_with(remote.clone());
        let mut events = engine.subscribe_events();
        engine.start().await.unwrap();

        let task = engine.repositories().tasks.create(Task::new("Ship it")).unwrap();
        wait_for_synced(&mut events, &task.meta.id).await;

        assert!(remote.row("tasks", &task.meta.id).is_some());
        assert_eq!(engine.queue_stats().unwrap().total, 0);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let engine = engine_with(Arc::new(MemoryRemote::new()));
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await.unwrap_err(), EngineError::AlreadyStarted));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_now_pulls_remote_rows() {
        let remote = Arc::new(MemoryRemote::new());
        remote.insert(
            "goals",
            RemoteDto::from_value(json!({
                "id": "g1",
                "user_id": "u1",
                "title": "Run a marathon",
                "updated_at": "2026-03-01T08:00:00Z"
            }))
            .unwrap(),
        );
        let engine = engine_with(remote);

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert!(report.is_clean());

        let goal: Goal = engine.repository::<Goal>().get_by_id("g1").await.unwrap();
        assert_eq!(goal.title, "Run a marathon");
    }

    #[tokio::test]
    async fn test_sync_now_offline_fails() {
        let engine = engine_with(Arc::new(MemoryRemote::new()));
        engine.connectivity().set_online(false);
        assert!(matches!(
            engine.sync_now().await.unwrap_err(),
            EngineError::Coordinator(CoordinatorError::Offline)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_pending_work() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = engine_with(remote.clone());
        engine.connectivity().set_online(false);
        engine.start().await.unwrap();

        engine.repositories().tasks.create(Task::new("Offline")).unwrap();
        engine.shutdown().await;

        assert_eq!(engine.queue_stats().unwrap().total, 1);
        assert_eq!(remote.call_count("create"), 0);
    }

    #[test]
    fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("taskhub.db");
        let config = SyncEngineConfig::new(&path, "http://127.0.0.1:9/");

        let engine = SyncEngine::open(config, Arc::new(Session::new())).unwrap();
        assert!(path.exists());
        assert_eq!(engine.queue_stats().unwrap().total, 0);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncEngineConfig::new(dir.path().join("taskhub.db"), "http://127.0.0.1:9/");
        config.batch_size = 0;

        assert!(matches!(
            SyncEngine::open(config, Arc::new(Session::new())),
            Err(EngineError::Config(_))
        ));
    }
}

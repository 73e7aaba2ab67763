//! Repository - the uniform offline-first façade over every entity type
//!
//! Reads come from the local store. Writes commit locally together with
//! their pending operation in one transaction, wake the coordinator and
//! return at once; the network is never on the caller's path except for
//! the one opportunistic fetch in [`Repository::get_by_id`].

use crate::auth::AuthContext;
use crate::cache::RemoteLookupCache;
use crate::db::{DbError, DbResult};
use crate::mapper::{EntityMapper, LocalRecord, MapperError};
use crate::models::{
    ActivityCategory, DailyCheckup, DayActivity, Goal, Notification, Sprint, SyncEntity, Tag, Task,
};
use crate::remote::RemoteStore;
use crate::store::LocalStore;
use crate::sync::{now_millis, ConnectivityMonitor, OperationKind, PendingQueue, SyncSignal};
use futures::{Stream, StreamExt};
use rusqlite::Connection;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators shared by every repository
#[derive(Clone)]
pub struct RepositoryContext {
    pub store: Arc<LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub mapper: Arc<dyn EntityMapper>,
    pub auth: Arc<dyn AuthContext>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub lookups: RemoteLookupCache,
    pub signal: SyncSignal,
    pub remote_timeout: Duration,
}

/// Repository for one entity type
#[derive(Clone)]
pub struct Repository<T: SyncEntity> {
    ctx: RepositoryContext,
    _entity: PhantomData<fn() -> T>,
}

impl<T: SyncEntity> Repository<T> {
    pub fn new(ctx: RepositoryContext) -> Self {
        Self {
            ctx,
            _entity: PhantomData,
        }
    }

    pub fn entity_type(&self) -> &'static str {
        T::ENTITY_TYPE
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Live list of all entities of this type.
    ///
    /// Emits the current list immediately and again after every local
    /// change. Each call is an independent subscription.
    pub fn observe_all(&self) -> impl Stream<Item = Result<Vec<T>, RepositoryError>> + Send + 'static {
        Arc::clone(&self.ctx.store)
            .observe(T::ENTITY_TYPE)
            .map(|snapshot| -> Result<Vec<T>, RepositoryError> { to_entities(snapshot?) })
    }

    /// One-shot snapshot of all entities of this type
    pub fn list(&self) -> Result<Vec<T>, RepositoryError> {
        to_entities(self.ctx.store.get_all(T::ENTITY_TYPE)?)
    }

    /// Local copy first, then one bounded remote fetch
    pub async fn get_by_id(&self, id: &str) -> Result<T, RepositoryError> {
        if let Some(record) = self.ctx.store.get(T::ENTITY_TYPE, id)? {
            return Ok(record.into_entity()?);
        }

        let not_found = || RepositoryError::NotFound {
            entity_type: T::ENTITY_TYPE.to_string(),
            id: id.to_string(),
        };

        if !self.ctx.connectivity.is_online() {
            return Err(not_found());
        }
        if self.ctx.lookups.is_known_missing(T::ENTITY_TYPE, id).await {
            return Err(not_found());
        }
        // The remote copy outlives a local delete until the delete drains
        if self
            .ctx
            .store
            .database()
            .transaction(|tx| delete_pending_in(tx, T::ENTITY_TYPE, id))?
        {
            return Err(not_found());
        }

        let fetched = tokio::time::timeout(
            self.ctx.remote_timeout,
            self.ctx.remote.get_by_id(T::ENTITY_TYPE, id),
        )
        .await;

        let dto = match fetched {
            Ok(Ok(Some(dto))) => dto,
            Ok(Ok(None)) => {
                self.ctx.lookups.remember_missing(T::ENTITY_TYPE, id).await;
                return Err(not_found());
            }
            Ok(Err(e)) => {
                log::warn!("Remote lookup of {}/{} failed: {}", T::ENTITY_TYPE, id, e);
                return Err(not_found());
            }
            Err(_) => {
                log::warn!("Remote lookup of {}/{} timed out", T::ENTITY_TYPE, id);
                return Err(not_found());
            }
        };

        let record = self.ctx.mapper.from_remote(T::ENTITY_TYPE, dto)?;
        let stored = self.ctx.store.database().transaction(|tx| {
            // A local write that landed meanwhile wins
            if let Some(local) = LocalStore::get_in(tx, T::ENTITY_TYPE, &record.id)? {
                return Ok(Some((local, false)));
            }
            if delete_pending_in(tx, T::ENTITY_TYPE, &record.id)? {
                return Ok(None);
            }
            LocalStore::upsert_in(tx, &record)?;
            Ok(Some((record, true)))
        })?;

        let Some((record, inserted)) = stored else {
            log::debug!("Ignoring remote {}/{}: deleted locally", T::ENTITY_TYPE, id);
            return Err(not_found());
        };
        if inserted {
            log::info!("Fetched {}/{} from remote", T::ENTITY_TYPE, record.id);
            self.ctx.store.notify_changed(T::ENTITY_TYPE);
        }
        Ok(record.into_entity()?)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create locally and queue the remote create.
    ///
    /// Assigns a UUID v4 if the entity has no id and stamps owner and
    /// timestamps. Fails with `Unauthenticated` without writing anything
    /// when no user is signed in.
    pub fn create(&self, entity: T) -> Result<T, RepositoryError> {
        let owner_id = self
            .ctx
            .auth
            .current_owner_id()
            .ok_or(RepositoryError::Unauthenticated)?;

        let mut entity = entity;
        let now = now_millis();
        let meta = entity.meta_mut();
        if meta.id.is_empty() {
            meta.id = uuid::Uuid::new_v4().to_string();
        }
        meta.owner_id = owner_id;
        meta.created_at = now;
        meta.updated_at = now;

        let record = LocalRecord::from_entity(&entity)?;
        let payload = record.payload_json()?;

        self.ctx.store.database().transaction(|tx| {
            LocalStore::upsert_in(tx, &record)?;
            PendingQueue::enqueue_in(tx, T::ENTITY_TYPE, &record.id, OperationKind::Create, Some(&payload))?;
            Ok(())
        })?;

        log::info!("Created {}/{}", T::ENTITY_TYPE, record.id);
        self.after_write();
        Ok(entity)
    }

    /// Update an existing local entity and queue the remote update.
    ///
    /// Owner and `created_at` are kept from the stored copy; `updated_at`
    /// never moves backwards.
    pub fn update(&self, entity: T) -> Result<T, RepositoryError> {
        let mut record = LocalRecord::from_entity(&entity)?;
        let now = now_millis();

        let updated = self.ctx.store.database().transaction(|tx| {
            let Some(existing) = LocalStore::get_in(tx, T::ENTITY_TYPE, &record.id)? else {
                return Ok(None);
            };

            record.owner_id = existing.owner_id;
            record.created_at = existing.created_at;
            record.updated_at = now.max(existing.updated_at + 1);
            let payload = record
                .payload_json()
                .map_err(|e| DbError::Serialization(e.to_string()))?;

            LocalStore::upsert_in(tx, &record)?;
            PendingQueue::enqueue_in(tx, T::ENTITY_TYPE, &record.id, OperationKind::Update, Some(&payload))?;
            Ok(Some(record))
        })?;

        let Some(record) = updated else {
            return Err(RepositoryError::NotFound {
                entity_type: T::ENTITY_TYPE.to_string(),
                id: entity.id().to_string(),
            });
        };

        log::info!("Updated {}/{}", T::ENTITY_TYPE, record.id);
        self.after_write();
        Ok(record.into_entity()?)
    }

    /// Delete locally and queue the remote delete.
    ///
    /// The delete is queued even when no local row existed, so a copy that
    /// reached the server through an earlier push is still cleaned up.
    /// Returns whether a local row was removed.
    pub fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let removed = self.ctx.store.database().transaction(|tx| {
            let removed = LocalStore::delete_in(tx, T::ENTITY_TYPE, id)?;
            PendingQueue::enqueue_in(tx, T::ENTITY_TYPE, id, OperationKind::Delete, None)?;
            Ok(removed)
        })?;

        log::info!("Deleted {}/{} (local row existed: {})", T::ENTITY_TYPE, id, removed);
        self.after_write();
        Ok(removed)
    }

    fn after_write(&self) {
        self.ctx.store.notify_changed(T::ENTITY_TYPE);
        self.ctx.signal.local_mutation(T::ENTITY_TYPE);
    }
}

fn delete_pending_in(conn: &Connection, entity_type: &str, id: &str) -> DbResult<bool> {
    Ok(matches!(
        PendingQueue::get_in(conn, entity_type, id)?,
        Some(op) if op.kind == OperationKind::Delete
    ))
}

fn to_entities<T: SyncEntity>(records: Vec<LocalRecord>) -> Result<Vec<T>, RepositoryError> {
    records
        .into_iter()
        .map(|record| record.into_entity::<T>().map_err(RepositoryError::from))
        .collect()
}

// ============================================================================
// Repository Bundle
// ============================================================================

/// One repository per entity type
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Repository<Task>,
    pub sprints: Repository<Sprint>,
    pub goals: Repository<Goal>,
    pub daily_checkups: Repository<DailyCheckup>,
    pub day_activities: Repository<DayActivity>,
    pub notifications: Repository<Notification>,
    pub activity_categories: Repository<ActivityCategory>,
    pub tags: Repository<Tag>,
}

impl Repositories {
    pub fn new(ctx: &RepositoryContext) -> Self {
        Self {
            tasks: Repository::new(ctx.clone()),
            sprints: Repository::new(ctx.clone()),
            goals: Repository::new(ctx.clone()),
            daily_checkups: Repository::new(ctx.clone()),
            day_activities: Repository::new(ctx.clone()),
            notifications: Repository::new(ctx.clone()),
            activity_categories: Repository::new(ctx.clone()),
            tags: Repository::new(ctx.clone()),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),

    #[error("{entity_type}/{id} not found")]
    NotFound { entity_type: String, id: String },

    #[error("No signed-in user")]
    Unauthenticated,

    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] MapperError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::db::Database;
    use crate::mapper::{RemoteDto, SupabaseMapper};
    use crate::models::TaskStatus;
    use crate::sync::{BackoffPolicy, SyncTrigger};
    use crate::testing::MemoryRemote;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        ctx: RepositoryContext,
        remote: Arc<MemoryRemote>,
        session: Arc<Session>,
        queue: PendingQueue,
        triggers: UnboundedReceiver<SyncTrigger>,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let session = Arc::new(Session::signed_in("u1", None));
        let (signal, triggers) = SyncSignal::channel();

        let ctx = RepositoryContext {
            store: Arc::new(LocalStore::new(Arc::clone(&db))),
            remote: remote.clone(),
            mapper: Arc::new(SupabaseMapper),
            auth: session.clone(),
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
            lookups: RemoteLookupCache::new(),
            signal,
            remote_timeout: Duration::from_secs(5),
        };

        Harness {
            ctx,
            remote,
            session,
            queue: PendingQueue::new(db, BackoffPolicy::default()),
            triggers,
        }
    }

    #[test]
    fn test_create_stamps_and_queues() {
        let mut h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        let task = tasks.create(Task::new("Write spec")).unwrap();
        assert!(uuid::Uuid::parse_str(&task.meta.id).is_ok());
        assert_eq!(task.meta.owner_id, "u1");
        assert!(task.meta.created_at > 0);
        assert_eq!(task.meta.created_at, task.meta.updated_at);

        let op = h.queue.get("tasks", &task.meta.id).unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Create);

        assert_eq!(
            h.triggers.try_recv().unwrap(),
            SyncTrigger::LocalMutation { entity_type: "tasks".into() }
        );
    }

    #[test]
    fn test_create_keeps_caller_id() {
        let h = harness();
        let tags: Repository<Tag> = Repository::new(h.ctx.clone());

        let mut tag = Tag::new("urgent");
        tag.meta.id = "tag-1".into();
        let created = tags.create(tag).unwrap();
        assert_eq!(created.meta.id, "tag-1");
    }

    #[test]
    fn test_create_requires_signed_in_user() {
        let h = harness();
        h.session.sign_out();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        let err = tasks.create(Task::new("Nope")).unwrap_err();
        assert!(matches!(err, RepositoryError::Unauthenticated));

        // Nothing written, nothing queued
        assert!(tasks.list().unwrap().is_empty());
        assert_eq!(h.queue.stats().unwrap().total, 0);
    }

    #[test]
    fn test_update_requires_existing_record() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        let mut ghost = Task::new("Ghost");
        ghost.meta.id = "missing".into();
        assert!(matches!(tasks.update(ghost).unwrap_err(), RepositoryError::NotFound { .. }));
        assert_eq!(h.queue.stats().unwrap().total, 0);
    }

    #[test]
    fn test_update_preserves_creation_and_advances_timestamp() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        let created = tasks.create(Task::new("Draft")).unwrap();
        let mut edit = created.clone();
        edit.title = "Final".into();
        edit.status = TaskStatus::InProgress;
        edit.meta.created_at = 0;
        edit.meta.owner_id = "someone-else".into();

        let updated = tasks.update(edit).unwrap();
        assert_eq!(updated.title, "Final");
        assert_eq!(updated.meta.created_at, created.meta.created_at);
        assert_eq!(updated.meta.owner_id, "u1");
        assert!(updated.meta.updated_at > created.meta.updated_at);

        // Create then update collapses to a single create
        let op = h.queue.get("tasks", &created.meta.id).unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(h.queue.stats().unwrap().total, 1);

        // The queued snapshot is the stored record's fields, not the caller's
        let payload: serde_json::Value = serde_json::from_str(op.payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["title"], "Final");
        assert!(payload.get("owner_id").is_none());
        assert!(payload.get("created_at").is_none());
    }

    #[test]
    fn test_delete_always_queues() {
        let h = harness();
        let goals: Repository<Goal> = Repository::new(h.ctx.clone());

        let goal = goals.create(Goal::new("Read 12 books")).unwrap();
        assert!(goals.delete(&goal.meta.id).unwrap());
        assert!(goals.list().unwrap().is_empty());
        assert_eq!(
            h.queue.get("goals", &goal.meta.id).unwrap().unwrap().kind,
            OperationKind::Delete
        );

        // No local row, but the delete is still queued
        assert!(!goals.delete("remote-only").unwrap());
        assert!(h.queue.has_pending("goals", "remote-only").unwrap());
    }

    #[tokio::test]
    async fn test_observe_all_sees_writes_immediately() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());
        let mut stream = Box::pin(tasks.observe_all());

        assert!(stream.next().await.unwrap().unwrap().is_empty());

        let created = tasks.create(Task::new("T1")).unwrap();
        let snapshot = stream.next().await.unwrap().unwrap();
        assert_eq!(snapshot, vec![created.clone()]);

        tasks.delete(&created.meta.id).unwrap();
        assert!(stream.next().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_by_id_prefers_local() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        let created = tasks.create(Task::new("Local")).unwrap();
        assert_eq!(tasks.get_by_id(&created.meta.id).await.unwrap(), created);
        assert_eq!(h.remote.call_count("get_by_id"), 0);
    }

    #[tokio::test]
    async fn test_get_by_id_fetches_and_persists_remote_copy() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());
        h.remote.insert(
            "tasks",
            RemoteDto::from_value(json!({
                "id": "t9",
                "user_id": "u1",
                "title": "From another device",
                "updated_at": "2026-01-02T00:00:00Z"
            }))
            .unwrap(),
        );

        let task = tasks.get_by_id("t9").await.unwrap();
        assert_eq!(task.title, "From another device");

        // Persisted: second read is local
        tasks.get_by_id("t9").await.unwrap();
        assert_eq!(h.remote.call_count("get_by_id"), 1);
        assert_eq!(tasks.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_by_id_does_not_revive_deleted_record() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        let task = tasks.create(Task::new("Short-lived")).unwrap();
        h.remote.insert(
            "tasks",
            RemoteDto::from_value(json!({
                "id": task.meta.id,
                "user_id": "u1",
                "title": "Short-lived",
                "updated_at": "2026-01-02T00:00:00Z"
            }))
            .unwrap(),
        );
        h.queue.mark_resolved("tasks", &task.meta.id).unwrap();

        tasks.delete(&task.meta.id).unwrap();
        assert!(matches!(
            tasks.get_by_id(&task.meta.id).await,
            Err(RepositoryError::NotFound { .. })
        ));
        assert!(tasks.list().unwrap().is_empty());
        assert_eq!(h.remote.call_count("get_by_id"), 0);
        assert!(h.queue.has_pending("tasks", &task.meta.id).unwrap());
    }

    #[tokio::test]
    async fn test_delete_during_remote_fetch_wins() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());
        h.remote.insert(
            "tasks",
            RemoteDto::from_value(json!({
                "id": "t7",
                "user_id": "u1",
                "title": "Elsewhere",
                "updated_at": "2026-01-02T00:00:00Z"
            }))
            .unwrap(),
        );
        h.remote.set_delay(Some(Duration::from_millis(200)));

        let lookup = {
            let tasks = tasks.clone();
            tokio::spawn(async move { tasks.get_by_id("t7").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.remote.call_count("get_by_id"), 1);

        tasks.delete("t7").unwrap();
        assert!(matches!(lookup.await.unwrap(), Err(RepositoryError::NotFound { .. })));
        assert!(tasks.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_by_id_remembers_remote_misses() {
        let h = harness();
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        assert!(matches!(tasks.get_by_id("nope").await, Err(RepositoryError::NotFound { .. })));
        assert!(matches!(tasks.get_by_id("nope").await, Err(RepositoryError::NotFound { .. })));
        assert_eq!(h.remote.call_count("get_by_id"), 1);
    }

    #[tokio::test]
    async fn test_get_by_id_offline_skips_remote() {
        let h = harness();
        h.ctx.connectivity.set_online(false);
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        assert!(matches!(tasks.get_by_id("t1").await, Err(RepositoryError::NotFound { .. })));
        assert_eq!(h.remote.call_count("get_by_id"), 0);
    }

    #[tokio::test]
    async fn test_get_by_id_remote_failure_is_not_found() {
        let h = harness();
        h.remote.fail_always(crate::remote::RemoteError::Timeout);
        let tasks: Repository<Task> = Repository::new(h.ctx.clone());

        assert!(matches!(tasks.get_by_id("t1").await, Err(RepositoryError::NotFound { .. })));
    }

    #[test]
    fn test_bundle_covers_every_entity_type() {
        let h = harness();
        let repos = Repositories::new(&h.ctx);

        let types = [
            repos.tasks.entity_type(),
            repos.sprints.entity_type(),
            repos.goals.entity_type(),
            repos.daily_checkups.entity_type(),
            repos.day_activities.entity_type(),
            repos.notifications.entity_type(),
            repos.activity_categories.entity_type(),
            repos.tags.entity_type(),
        ];
        for entity_type in crate::models::ALL_ENTITY_TYPES {
            assert!(types.contains(&entity_type));
        }
    }
}

// TaskHub Sync - offline-first data core for the TaskHub apps
//
// Every read is served from the local database and every write commits
// locally before anything touches the network; a single sync coordinator
// reconciles the pending-operation queue with the remote store.

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod mapper;
pub mod models;
pub mod remote;
pub mod repository;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthContext, Session, SessionInfo};
pub use config::{ConfigError, SyncEngineConfig};
pub use db::{Database, DbError};
pub use engine::{EngineError, SyncEngine, SyncEngineBuilder};
pub use mapper::{EntityMapper, LocalRecord, MapperError, RemoteDto, SupabaseMapper};
pub use models::{
    ActivityCategory, DailyCheckup, DayActivity, EntityMeta, Goal, Notification, Sprint, SyncEntity,
    Tag, Task,
};
pub use remote::{HttpRemoteStore, RemoteError, RemoteStore};
pub use repository::{Repositories, Repository, RepositoryError};
pub use sync::{OperationKind, SyncEvent, SyncReport, SyncTrigger};

/// Initialize logging from `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

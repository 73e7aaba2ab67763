//! Engine configuration
//!
//! Loaded from the process environment (and a `.env` file if present).
//! Every knob has a default except the remote URL.

use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DATABASE_PATH: &str = "TASKHUB_DATABASE_PATH";
pub const ENV_REMOTE_URL: &str = "TASKHUB_REMOTE_URL";
pub const ENV_REMOTE_API_KEY: &str = "TASKHUB_REMOTE_API_KEY";
pub const ENV_REMOTE_TIMEOUT_SECS: &str = "TASKHUB_REMOTE_TIMEOUT_SECS";
pub const ENV_SYNC_BATCH_SIZE: &str = "TASKHUB_SYNC_BATCH_SIZE";
pub const ENV_BACKOFF_BASE_SECS: &str = "TASKHUB_BACKOFF_BASE_SECS";
pub const ENV_BACKOFF_MAX_SECS: &str = "TASKHUB_BACKOFF_MAX_SECS";
pub const ENV_SYNC_INTERVAL_MINUTES: &str = "TASKHUB_SYNC_INTERVAL_MINUTES";
pub const ENV_PRUNE_ON_FULL_PULL: &str = "TASKHUB_PRUNE_ON_FULL_PULL";
pub const ENV_LOOKUP_CACHE_TTL_SECS: &str = "TASKHUB_LOOKUP_CACHE_TTL_SECS";

const DATABASE_FILE: &str = "taskhub.db";

/// Valid range for the periodic sync interval (1 minute to 24 hours)
pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncEngineConfig {
    pub database_path: PathBuf,
    pub remote_url: String,
    pub remote_api_key: Option<String>,
    pub remote_timeout: Duration,
    pub batch_size: usize,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub sync_interval_minutes: u32,
    pub prune_on_full_pull: bool,
    pub lookup_cache_ttl_secs: u64,
}

impl SyncEngineConfig {
    /// Config with defaults for everything but the remote URL
    pub fn new(database_path: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            remote_url: remote_url.into(),
            remote_api_key: None,
            remote_timeout: Duration::from_secs(30),
            batch_size: 50,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            sync_interval_minutes: 15,
            prune_on_full_pull: false,
            lookup_cache_ttl_secs: 60,
        }
    }

    /// Load from the environment, reading `.env` first
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let remote_url = get(ENV_REMOTE_URL).ok_or(ConfigError::Missing(ENV_REMOTE_URL))?;
        let database_path = match get(ENV_DATABASE_PATH) {
            Some(path) => PathBuf::from(path),
            None => default_database_path()?,
        };

        let mut config = Self::new(database_path, remote_url);
        config.remote_api_key = get(ENV_REMOTE_API_KEY);

        if let Some(secs) = parse(&get, ENV_REMOTE_TIMEOUT_SECS)? {
            config.remote_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = parse(&get, ENV_SYNC_BATCH_SIZE)? {
            config.batch_size = size;
        }
        if let Some(secs) = parse(&get, ENV_BACKOFF_BASE_SECS)? {
            config.backoff_base_secs = secs;
        }
        if let Some(secs) = parse(&get, ENV_BACKOFF_MAX_SECS)? {
            config.backoff_max_secs = secs;
        }
        if let Some(minutes) = parse(&get, ENV_SYNC_INTERVAL_MINUTES)? {
            config.sync_interval_minutes = minutes;
        }
        if let Some(prune) = parse(&get, ENV_PRUNE_ON_FULL_PULL)? {
            config.prune_on_full_pull = prune;
        }
        if let Some(secs) = parse(&get, ENV_LOOKUP_CACHE_TTL_SECS)? {
            config.lookup_cache_ttl_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_url.is_empty() {
            return Err(ConfigError::Missing(ENV_REMOTE_URL));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_SYNC_BATCH_SIZE,
                reason: "must be at least 1".into(),
            });
        }
        if self.remote_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: ENV_REMOTE_TIMEOUT_SECS,
                reason: "must be at least 1 second".into(),
            });
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(ConfigError::Invalid {
                key: ENV_BACKOFF_BASE_SECS,
                reason: format!("base {}s exceeds max {}s", self.backoff_base_secs, self.backoff_max_secs),
            });
        }
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&self.sync_interval_minutes) {
            return Err(ConfigError::Invalid {
                key: ENV_SYNC_INTERVAL_MINUTES,
                reason: format!(
                    "must be between {} and {} minutes",
                    MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES
                ),
            });
        }
        Ok(())
    }
}

/// Platform data directory location of the database file
pub fn default_database_path() -> Result<PathBuf, ConfigError> {
    let dirs = directories::ProjectDirs::from("com", "taskhub", "taskhub")
        .ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().join(DATABASE_FILE))
}

fn parse<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("{:?}: {}", raw, e),
            })
        })
        .transpose()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Could not determine the platform data directory")]
    NoDataDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SyncEngineConfig::from_lookup(lookup(&[
            (ENV_REMOTE_URL, "https://example.supabase.co"),
            (ENV_DATABASE_PATH, "/tmp/taskhub-test.db"),
        ]))
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/taskhub-test.db"));
        assert_eq!(config.remote_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.backoff_base_secs, 30);
        assert_eq!(config.backoff_max_secs, 3600);
        assert_eq!(config.sync_interval_minutes, 15);
        assert!(!config.prune_on_full_pull);
        assert!(config.remote_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = SyncEngineConfig::from_lookup(lookup(&[
            (ENV_REMOTE_URL, "https://example.supabase.co"),
            (ENV_DATABASE_PATH, "/tmp/taskhub-test.db"),
            (ENV_REMOTE_API_KEY, "anon"),
            (ENV_REMOTE_TIMEOUT_SECS, "5"),
            (ENV_SYNC_BATCH_SIZE, "10"),
            (ENV_SYNC_INTERVAL_MINUTES, "60"),
            (ENV_PRUNE_ON_FULL_PULL, "true"),
        ]))
        .unwrap();

        assert_eq!(config.remote_api_key.as_deref(), Some("anon"));
        assert_eq!(config.remote_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.sync_interval_minutes, 60);
        assert!(config.prune_on_full_pull);
    }

    #[test]
    fn test_remote_url_required() {
        let err = SyncEngineConfig::from_lookup(lookup(&[(ENV_DATABASE_PATH, "/tmp/x.db")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_REMOTE_URL));
    }

    #[test]
    fn test_rejects_bad_values() {
        let base = [
            (ENV_REMOTE_URL, "https://example.supabase.co"),
            (ENV_DATABASE_PATH, "/tmp/x.db"),
        ];

        let err = SyncEngineConfig::from_lookup(lookup(&[base[0], base[1], (ENV_SYNC_BATCH_SIZE, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_SYNC_BATCH_SIZE, .. }));

        let err = SyncEngineConfig::from_lookup(lookup(&[base[0], base[1], (ENV_SYNC_INTERVAL_MINUTES, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_SYNC_INTERVAL_MINUTES, .. }));

        let err = SyncEngineConfig::from_lookup(lookup(&[
            base[0],
            base[1],
            (ENV_BACKOFF_BASE_SECS, "120"),
            (ENV_BACKOFF_MAX_SECS, "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_BACKOFF_BASE_SECS, .. }));
    }
}

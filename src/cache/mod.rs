//! Remote lookup cache - remembers ids the backend does not have
//!
//! `getById` falls back to the remote store on a local miss. Repeated
//! lookups of an id the server also lacks would each cost a round trip, so
//! misses are remembered for a short TTL:
//! - Keyed by `(entity_type, id)`
//! - TTL expiration plus capacity bound
//! - Only consulted after a local miss, so a record written locally is
//!   served from the local store regardless of what is remembered here

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Lookup cache configuration
#[derive(Debug, Clone)]
pub struct LookupCacheConfig {
    /// Maximum number of remembered misses
    pub max_capacity: u64,

    /// How long a miss is trusted (in seconds)
    pub ttl_secs: u64,
}

impl Default for LookupCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1_000,
            ttl_secs: 60,
        }
    }
}

/// Negative cache for remote `get_by_id` lookups
#[derive(Clone)]
pub struct RemoteLookupCache {
    missing: Arc<Cache<(String, String), ()>>,
}

impl RemoteLookupCache {
    pub fn new() -> Self {
        Self::with_config(LookupCacheConfig::default())
    }

    pub fn with_config(config: LookupCacheConfig) -> Self {
        let missing = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();

        Self {
            missing: Arc::new(missing),
        }
    }

    /// Whether the remote store recently reported this record as absent
    pub async fn is_known_missing(&self, entity_type: &str, id: &str) -> bool {
        self.missing
            .get(&(entity_type.to_string(), id.to_string()))
            .await
            .is_some()
    }

    /// Record that the remote store has no such record
    pub async fn remember_missing(&self, entity_type: &str, id: &str) {
        self.missing
            .insert((entity_type.to_string(), id.to_string()), ())
            .await;
    }
}

impl Default for RemoteLookupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remember_missing() {
        let cache = RemoteLookupCache::new();

        assert!(!cache.is_known_missing("tasks", "t1").await);
        cache.remember_missing("tasks", "t1").await;
        assert!(cache.is_known_missing("tasks", "t1").await);

        // Keys are per entity type
        assert!(!cache.is_known_missing("goals", "t1").await);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = RemoteLookupCache::with_config(LookupCacheConfig {
            max_capacity: 10,
            ttl_secs: 1,
        });
        cache.remember_missing("tasks", "t1").await;

        std::thread::sleep(Duration::from_millis(1_100));
        assert!(!cache.is_known_missing("tasks", "t1").await);
    }
}

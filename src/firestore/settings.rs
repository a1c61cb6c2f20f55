use std::path::PathBuf;
use std::time::Duration;

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::lru_garbage_collector::LruParams;
use crate::firestore::model::DatabaseId;
use crate::util::BackoffConfig;

/// Cache size value that disables LRU garbage collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;

/// Where durable state lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceSettings {
    /// Nothing survives the process.
    Memory,
    /// An append-only JSON lines journal at `path`, compacted into a snapshot periodically.
    Journal { path: PathBuf },
}

/// Tunables for the sync engine and its local and remote stores.
#[derive(Clone, Debug)]
pub struct FirestoreSettings {
    pub database_id: DatabaseId,
    pub persistence: PersistenceSettings,
    /// Number of journal entries after which the journal is compacted.
    pub journal_compaction_threshold: usize,
    pub lru: LruParams,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
    pub max_concurrent_limbo_resolutions: usize,
    pub index_auto_creation_enabled: bool,
    pub index_auto_creation_min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
    pub index_backfill_initial_delay: Duration,
    pub index_backfill_regular_delay: Duration,
    pub index_backfill_max_documents: usize,
    pub stream_backoff: BackoffConfig,
    pub online_state_timeout: Duration,
    pub primary_lease_duration: Duration,
    pub primary_lease_refresh_interval: Duration,
    pub max_pending_writes: usize,
    /// Stable id for this client; generated when absent.
    pub client_id: Option<String>,
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            persistence: PersistenceSettings::Memory,
            journal_compaction_threshold: 1_000,
            lru: LruParams::with_cache_size(DEFAULT_CACHE_SIZE_BYTES),
            gc_initial_delay: Duration::from_secs(60),
            gc_regular_delay: Duration::from_secs(5 * 60),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            index_auto_creation_enabled: false,
            index_auto_creation_min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
            index_backfill_initial_delay: Duration::from_secs(15),
            index_backfill_regular_delay: Duration::from_secs(60),
            index_backfill_max_documents: 50,
            stream_backoff: BackoffConfig::default(),
            online_state_timeout: Duration::from_secs(10),
            primary_lease_duration: Duration::from_secs(5),
            primary_lease_refresh_interval: Duration::from_secs(4),
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            client_id: None,
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_journal_compaction_threshold(mut self, threshold: usize) -> Self {
        self.journal_compaction_threshold = threshold.max(1);
        self
    }

    /// Sets the cache size threshold in bytes; [`CACHE_SIZE_UNLIMITED`] disables collection.
    pub fn with_cache_size_bytes(mut self, bytes: i64) -> Self {
        self.lru = LruParams {
            cache_size_collection_threshold: bytes,
            ..self.lru
        };
        self
    }

    pub fn with_gc_delays(mut self, initial: Duration, regular: Duration) -> Self {
        self.gc_initial_delay = initial;
        self.gc_regular_delay = regular;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_index_auto_creation(mut self, enabled: bool) -> Self {
        self.index_auto_creation_enabled = enabled;
        self
    }

    pub fn with_index_auto_creation_thresholds(mut self, min_collection_size: usize, relative_cost: f64) -> Self {
        self.index_auto_creation_min_collection_size = min_collection_size;
        self.relative_index_read_cost_per_document = relative_cost;
        self
    }

    pub fn with_stream_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.stream_backoff = backoff;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_primary_lease(mut self, duration: Duration, refresh_interval: Duration) -> Self {
        self.primary_lease_duration = duration;
        self.primary_lease_refresh_interval = refresh_interval;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        let size = self.lru.cache_size_collection_threshold;
        if size != CACHE_SIZE_UNLIMITED && size < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache size must be set to at least {MINIMUM_CACHE_SIZE_BYTES} bytes"
            )));
        }
        if self.primary_lease_refresh_interval >= self.primary_lease_duration {
            return Err(invalid_argument(
                "primary lease refresh interval must be shorter than the lease duration",
            ));
        }
        if self.max_pending_writes == 0 {
            return Err(invalid_argument("max pending writes must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FirestoreSettings {
        FirestoreSettings::new(DatabaseId::default("project"))
    }

    #[test]
    fn defaults_validate() {
        let settings = settings();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.lru.cache_size_collection_threshold, DEFAULT_CACHE_SIZE_BYTES);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
    }

    #[test]
    fn rejects_tiny_cache() {
        let err = settings().with_cache_size_bytes(10).validate().unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(settings().with_cache_size_bytes(CACHE_SIZE_UNLIMITED).validate().is_ok());
    }
}

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::firestore::core::listen_sequence::INVALID_SEQUENCE_NUMBER;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{ListenSequenceNumber, TargetId};
use crate::platform::runtime::{sleep, spawn_detached};

/// Threshold value that turns collection off.
pub const GC_DISABLED: i64 = -1;

const DEFAULT_PERCENTILE_TO_COLLECT: i32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: i32 = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size in bytes above which a collection pass does work. Negative disables.
    pub cache_size_collection_threshold: i64,
    /// Share of sequence numbers to collect per pass.
    pub percentile_to_collect: i32,
    /// Upper bound on sequence numbers collected per pass.
    pub maximum_sequence_numbers_to_collect: i32,
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(GC_DISABLED)
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold < 0
    }
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Removes the least recently used targets and the documents only they referenced.
#[derive(Clone, Copy, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: TargetCache,
    remote_documents: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self {
            params,
            target_cache: TargetCache::new(),
            remote_documents: RemoteDocumentCache::new(),
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Number of sequence numbers making up `percentile` percent of all tracked ones.
    pub fn calculate_target_count(&self, txn: &PersistenceTransaction<'_>, percentile: i32) -> FirestoreResult<usize> {
        let count = self.sequence_numbers(txn)?.len();
        Ok(count * percentile.clamp(0, 100) as usize / 100)
    }

    /// The `n`th smallest tracked sequence number, or the invalid marker when `n` is zero.
    pub fn nth_sequence_number(&self, txn: &PersistenceTransaction<'_>, n: usize) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut sequence_numbers = self.sequence_numbers(txn)?;
        sequence_numbers.sort_unstable();
        Ok(sequence_numbers
            .get(n - 1)
            .or(sequence_numbers.last())
            .copied()
            .unwrap_or(INVALID_SEQUENCE_NUMBER))
    }

    /// Sequence numbers of every target and of every document no target references.
    fn sequence_numbers(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<ListenSequenceNumber>> {
        let mut numbers: Vec<ListenSequenceNumber> = self
            .target_cache
            .get_all_targets(txn)?
            .into_iter()
            .map(|target| target.sequence_number)
            .collect();
        numbers.extend(
            self.target_cache
                .orphaned_documents(txn)?
                .into_iter()
                .map(|(_, sequence_number)| sequence_number),
        );
        Ok(numbers)
    }

    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        self.target_cache.remove_targets(txn, upper_bound, active_target_ids)
    }

    /// Drops unreferenced documents last touched at or before `upper_bound`.
    ///
    /// Documents pinned in memory or written by a pending mutation of any user survive.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        pins: &ReferenceSet,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in self.target_cache.orphaned_documents(txn)? {
            if sequence_number > upper_bound || pins.contains_key(&key) {
                continue;
            }
            if MutationQueue::any_queue_contains_key(txn, &key)? {
                continue;
            }
            self.remote_documents.remove_entry(txn, &key)?;
            self.target_cache.remove_sentinel(txn, &key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Runs one pass if the cache outgrew the configured threshold.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pins: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if self.params.is_disabled() {
            log::debug!("Garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }
        let cache_size = self.remote_documents.get_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "Garbage collection skipped; cache size {} is lower than threshold {}",
                cache_size,
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_target_ids, pins)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pins: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        let mut sequence_numbers = self.calculate_target_count(txn, self.params.percentile_to_collect)?;
        let maximum = self.params.maximum_sequence_numbers_to_collect.max(0) as usize;
        if sequence_numbers > maximum {
            log::debug!("Capping sequence numbers to collect down to the maximum of {maximum} from {sequence_numbers}");
            sequence_numbers = maximum;
        }

        let upper_bound = self.nth_sequence_number(txn, sequence_numbers)?;
        let targets_removed = self.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, pins)?;

        log::debug!(
            "LRU garbage collection: counted {} sequence numbers up to {}, removed {} targets and {} documents",
            sequence_numbers,
            upper_bound,
            targets_removed,
            documents_removed
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers,
            targets_removed,
            documents_removed,
        })
    }
}

/// Periodically runs garbage collection on a local store while this client is primary.
pub struct LruScheduler {
    initial_delay: Duration,
    regular_delay: Duration,
    stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl LruScheduler {
    pub fn new(initial_delay: Duration, regular_delay: Duration) -> Self {
        Self {
            initial_delay,
            regular_delay,
            stop: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.stop.lock().unwrap().is_some()
    }

    /// Starts the collection loop. Does nothing when collection is disabled or already running.
    pub fn start(&self, local_store: Weak<LocalStore>) {
        let Some(store) = local_store.upgrade() else {
            return;
        };
        if store.lru_params().is_disabled() {
            log::debug!("LRU garbage collection disabled; not scheduling");
            return;
        }
        drop(store);

        let mut guard = self.stop.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        *guard = Some(stop.clone());

        let initial_delay = self.initial_delay;
        let regular_delay = self.regular_delay;
        spawn_detached(async move {
            sleep(initial_delay).await;
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let Some(store) = local_store.upgrade() else {
                    break;
                };
                if store.is_primary() {
                    match store.collect_garbage().await {
                        Ok(results) => log::debug!("Garbage collection finished: {results:?}"),
                        // The next cycle runs regardless.
                        Err(err) => log::warn!("Ignoring storage error during garbage collection: {err}"),
                    }
                }
                drop(store);
                sleep(regular_delay).await;
            }
        });
    }

    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for LruScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

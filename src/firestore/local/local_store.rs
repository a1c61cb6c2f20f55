use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_lock::Mutex;

use crate::firestore::core::query::Query;
use crate::firestore::core::target::{Target, TargetData, TargetPurpose};
use crate::firestore::core::user::User;
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::{FieldIndex, IndexBackfiller, IndexKind, IndexManager};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{
    BatchId, Document, DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    ResourcePath, SnapshotVersion, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::settings::FirestoreSettings;
use crate::util::{fail, hard_assert};

/// Resume tokens older than this are rewritten even when nothing else changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Outcome of queueing a batch of local writes.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// New local view of every written document.
    pub changes: BTreeMap<DocumentKey, Document>,
}

/// Documents a view added and removed for one target in one snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Documents matching a query from the local view, plus the keys the server last reported.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, Document>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// A field index to keep, as configured by the application.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldIndexDefinition {
    pub collection_group: String,
    pub field: FieldPath,
    pub kind: IndexKind,
}

struct LocalStoreState {
    user: User,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    /// Documents referenced by live views; garbage collection never removes these.
    local_view_references: ReferenceSet,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: HashMap<String, TargetId>,
    last_document_change_read_time: SnapshotVersion,
}

impl LocalStoreState {
    fn cached_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
    }
}

/// Durable client state: the mutation queue, cached server documents and listen targets.
///
/// Every operation is one storage transaction; in-memory bookkeeping is only updated once that
/// transaction committed.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    settings: FirestoreSettings,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    index_manager: IndexManager,
    bundle_cache: BundleCache,
    garbage_collector: LruGarbageCollector,
    state: Mutex<LocalStoreState>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

fn local_documents_for(user: &User) -> LocalDocumentsView {
    LocalDocumentsView::new(
        RemoteDocumentCache::new(),
        MutationQueue::for_user(user),
        DocumentOverlayCache::for_user(user),
    )
}

/// Whether the new target data differs enough from the persisted copy to be written.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if new.resume_token.is_empty() {
        return false;
    }
    if old.resume_token.is_empty() {
        return true;
    }
    let age = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.has_document_changes()
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, settings: FirestoreSettings, user: User) -> Arc<Self> {
        let index_manager = IndexManager::new();
        let local_documents = local_documents_for(&user);
        let query_engine = QueryEngine::new(local_documents.clone(), index_manager).with_settings(&settings);
        Arc::new(Self {
            garbage_collector: LruGarbageCollector::new(settings.lru),
            persistence,
            settings,
            remote_documents: RemoteDocumentCache::new(),
            target_cache: TargetCache::new(),
            index_manager,
            bundle_cache: BundleCache::new(),
            state: Mutex::new(LocalStoreState {
                user,
                local_documents,
                query_engine,
                local_view_references: ReferenceSet::new(),
                target_data_by_target: BTreeMap::new(),
                target_ids_by_canonical_id: HashMap::new(),
                last_document_change_read_time: SnapshotVersion::min(),
            }),
        })
    }

    /// Checks queue consistency and records where change tracking for secondaries starts.
    pub async fn start(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let local_documents = state.local_documents.clone();
        let latest = self
            .persistence
            .run_transaction("Start LocalStore", TransactionMode::ReadOnly, |txn| {
                local_documents.mutation_queue().perform_consistency_check(txn)?;
                let (_, latest) = self
                    .remote_documents
                    .get_new_document_changes(txn, SnapshotVersion::min())?;
                Ok(latest)
            })
            .await?;
        state.last_document_change_read_time = latest;
        Ok(())
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn is_primary(&self) -> bool {
        self.persistence.is_primary()
    }

    pub fn lru_params(&self) -> LruParams {
        *self.garbage_collector.params()
    }

    pub async fn current_user(&self) -> User {
        self.state.lock().await.user.clone()
    }

    /// Switches to `user`'s mutation queue and reports every document whose local view changed.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let mut state = self.state.lock().await;
        let old_documents = state.local_documents.clone();
        let new_documents = local_documents_for(&user);
        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadWrite, |txn| {
                let old_batches = old_documents.mutation_queue().get_all_mutation_batches(txn)?;
                let new_batches = new_documents.mutation_queue().get_all_mutation_batches(txn)?;

                let mut changed_keys = BTreeSet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    changed_keys.extend(batch.keys());
                }
                Ok(UserChangeResult {
                    affected_documents: new_documents.get_documents(txn, changed_keys.iter())?,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            })
            .await?;

        log::debug!(
            "Switched local store from '{}' to '{}'",
            state.user.storage_key(),
            user.storage_key()
        );
        state.query_engine = QueryEngine::new(new_documents.clone(), self.index_manager).with_settings(&self.settings);
        state.local_documents = new_documents;
        state.user = user;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the resulting local view.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key.clone()).collect();
        let state = self.state.lock().await;
        let view = &state.local_documents;
        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote = self.remote_documents.get_entries(txn, keys.iter())?;
                let documents_without_remote_version: BTreeSet<DocumentKey> = remote
                    .values()
                    .filter(|document| !document.is_valid_document())
                    .map(|document| document.key().clone())
                    .collect();
                let mut overlayed = view.get_overlayed_documents(txn, remote)?;

                // Transforms such as increments must be replayed on top of the value the user saw
                // when writing, so that value is captured as an idempotent base patch.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let document = &overlayed.get(&mutation.key)?.overlayed_document;
                        let base_value = mutation.extract_transform_base_value(document)?;
                        let mask = FieldMask::new(base_value.field_paths());
                        Some(Mutation::patch(mutation.key.clone(), base_value, mask))
                    })
                    .collect();

                let batch = view.mutation_queue().add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
                view.document_overlay_cache()
                    .save_overlays(txn, batch.batch_id, &overlays)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.overlayed_document))
                        .collect(),
                })
            })
            .await
    }

    /// Applies the server's acknowledgement of a batch to the remote cache and drops the batch.
    ///
    /// Acknowledging a batch that is no longer queued is a no-op that still reports the current
    /// local view of its documents.
    pub async fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let state = self.state.lock().await;
        let view = &state.local_documents;
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &result.batch;
                let affected = batch.keys();
                let queue = view.mutation_queue();
                if queue.lookup_mutation_batch(txn, batch.batch_id)?.is_none() {
                    log::debug!("Batch {} was already acknowledged", batch.batch_id);
                    return view.get_documents(txn, affected.iter());
                }

                let mut buffer = self.remote_documents.new_change_buffer();
                self.apply_write_to_remote_documents(txn, &mut buffer, result)?;
                queue.acknowledge_batch(txn, batch, &result.stream_token)?;
                queue.remove_mutation_batch(txn, batch)?;
                self.release_mutation_references(txn, &affected)?;
                buffer.apply(txn)?;
                queue.perform_consistency_check(txn)?;
                view.document_overlay_cache()
                    .remove_overlays_for_batch_id(txn, &affected, batch.batch_id)?;
                view.recalculate_and_save_overlays_for_document_keys(txn, &result.keys_with_transform_results())?;
                view.get_documents(txn, affected.iter())
            })
            .await
    }

    /// Documents a removed batch wrote become GC candidates once no target holds them.
    fn release_mutation_references(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        for key in keys {
            self.target_cache.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &PersistenceTransaction<'_>,
        buffer: &mut RemoteDocumentChangeBuffer,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for key in result.batch.keys() {
            let mut document = buffer.get_entry(txn, &key)?;
            let Some(ack_version) = result.doc_versions.get(&key).copied() else {
                fail(0xde03, "doc_versions should contain every doc in the write");
            };
            if document.version() < ack_version {
                result.batch.apply_to_remote_document(&mut document, result);
                if document.is_valid_document() {
                    document.set_read_time(result.commit_version);
                    buffer.add_entry(document);
                }
            }
        }
        Ok(())
    }

    /// Removes a batch the server refused and returns the reverted local view.
    ///
    /// Unknown batch ids yield an empty result.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let state = self.state.lock().await;
        let view = &state.local_documents;
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let queue = view.mutation_queue();
                let Some(batch) = queue.lookup_mutation_batch(txn, batch_id)? else {
                    log::debug!("Ignoring rejection of unknown batch {batch_id}");
                    return Ok(BTreeMap::new());
                };
                let affected = batch.keys();
                queue.remove_mutation_batch(txn, &batch)?;
                self.release_mutation_references(txn, &affected)?;
                queue.perform_consistency_check(txn)?;
                view.document_overlay_cache()
                    .remove_overlays_for_batch_id(txn, &affected, batch_id)?;
                view.recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                view.get_documents(txn, affected.iter())
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let state = self.state.lock().await;
        let queue = state.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                queue.get_highest_unacknowledged_batch_id(txn)
            })
            .await
    }

    /// The first queued batch after `after_batch_id`, or the first one at all.
    pub async fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.state.lock().await;
        let queue = state.local_documents.mutation_queue();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.get_next_mutation_batch_after_batch_id(txn, after)
            })
            .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let state = self.state.lock().await;
        let queue = state.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                queue.get_last_stream_token(txn)
            })
            .await
    }

    pub async fn set_last_stream_token(&self, stream_token: &[u8]) -> FirestoreResult<()> {
        let state = self.state.lock().await;
        let queue = state.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                queue.set_last_stream_token(txn, stream_token)
            })
            .await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_last_remote_snapshot_version(txn)
            })
            .await
    }

    /// Applies one consistent snapshot from the watch stream and returns the changed local views.
    pub async fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut state = self.state.lock().await;
        let remote_version = event.snapshot_version;
        let (changes, target_data_by_target) = {
            let state = &*state;
            self.persistence
                .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                    let mut target_data_by_target = state.target_data_by_target.clone();
                    for (target_id, change) in &event.target_changes {
                        let Some(old_target_data) = state.target_data_by_target.get(target_id) else {
                            continue;
                        };
                        self.target_cache
                            .remove_matching_keys(txn, change.removed_documents.iter(), *target_id)?;
                        self.target_cache
                            .add_matching_keys(txn, change.added_documents.iter(), *target_id)?;

                        let mut new_target_data = old_target_data.with_sequence_number(txn.current_sequence_number());
                        if event.target_mismatches.contains_key(target_id) {
                            new_target_data = new_target_data
                                .with_resume_token(Vec::new(), SnapshotVersion::min())
                                .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                        } else if !change.resume_token.is_empty() {
                            new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                        }
                        if should_persist_target_data(old_target_data, &new_target_data, change) {
                            self.target_cache.update_target_data(txn, &new_target_data)?;
                        }
                        target_data_by_target.insert(*target_id, new_target_data);
                    }

                    for key in event.document_updates.keys() {
                        if event.resolved_limbo_documents.contains(key) {
                            self.target_cache.update_sentinel(txn, key)?;
                        }
                    }

                    let mut buffer = self.remote_documents.new_change_buffer();
                    let (changed, existence_changed) =
                        self.populate_document_change_buffer(txn, &mut buffer, &event.document_updates, remote_version)?;

                    if !remote_version.is_min() {
                        let last = self.target_cache.get_last_remote_snapshot_version(txn)?;
                        hard_assert(
                            remote_version >= last,
                            0x3989,
                            format!("Watch stream reverted to previous snapshot? {remote_version:?} < {last:?}"),
                        );
                        let sequence_number = txn.current_sequence_number();
                        self.target_cache
                            .set_target_versions(txn, sequence_number, Some(remote_version))?;
                    }
                    buffer.apply(txn)?;

                    let changes = state
                        .local_documents
                        .get_local_view_of_documents(txn, changed, &existence_changed)?;
                    Ok((changes, target_data_by_target))
                })
                .await?
        };
        state.target_data_by_target = target_data_by_target;
        Ok(changes)
    }

    /// Buffers every update newer than the cached copy.
    ///
    /// Returns the documents that changed and the keys whose existence flipped.
    fn populate_document_change_buffer(
        &self,
        txn: &PersistenceTransaction<'_>,
        buffer: &mut RemoteDocumentChangeBuffer,
        updates: &BTreeMap<DocumentKey, MutableDocument>,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<(BTreeMap<DocumentKey, MutableDocument>, BTreeSet<DocumentKey>)> {
        let existing = buffer.get_entries(txn, updates.keys())?;
        let mut changed = BTreeMap::new();
        let mut existence_changed = BTreeSet::new();
        for (key, update) in updates {
            let mut document = update.clone();
            let cached = existing
                .get(key)
                .cloned()
                .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));
            if document.is_found_document() != cached.is_found_document() {
                existence_changed.insert(key.clone());
            }

            // A missing document at version zero is a synthesized deletion, e.g. a limbo target
            // the server rejected.
            if document.is_no_document() && document.version().is_min() {
                buffer.remove_entry(key.clone(), document.read_time());
                changed.insert(key.clone(), document);
            } else if !cached.is_valid_document()
                || document.version() > cached.version()
                || (document.version() == cached.version() && cached.has_unconfirmed_writes())
            {
                if document.read_time().is_min() {
                    document.set_read_time(read_time);
                }
                hard_assert(
                    !document.read_time().is_min(),
                    0xbd9d,
                    "Cannot add a document when the remote version is zero",
                );
                buffer.add_entry(document.clone());
                changed.insert(key.clone(), document);
            } else {
                log::debug!(
                    "Ignoring outdated watch update for {}. Current version: {:?} Watch version: {:?}",
                    key.path().canonical_string(),
                    cached.version(),
                    document.version()
                );
            }
        }
        Ok((changed, existence_changed))
    }

    /// Records which documents each view holds so they stay pinned against garbage collection.
    pub async fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for change in view_changes {
                    for key in change.added_keys.iter().chain(change.removed_keys.iter()) {
                        self.target_cache.update_sentinel(txn, key)?;
                    }
                }
                Ok(())
            })
            .await?;

        for change in view_changes {
            state
                .local_view_references
                .add_references(change.added_keys.iter().cloned(), change.target_id);
            state
                .local_view_references
                .remove_references(change.removed_keys.iter(), change.target_id);

            if !change.from_cache {
                if let Some(target_data) = state.target_data_by_target.get(&change.target_id) {
                    let updated = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                    state.target_data_by_target.insert(change.target_id, updated);
                }
            }
        }
        Ok(())
    }

    /// The local view of a single document; missing documents are invalid placeholders.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let state = self.state.lock().await;
        let view = &state.local_documents;
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| view.get_document(txn, key))
            .await
    }

    /// Returns the target data for `target`, persisting a new target when none exists yet.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.state.lock().await;
        if let Some(cached) = state.cached_target_data(&target) {
            return Ok(cached.clone());
        }
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(existing) = self.target_cache.get_target_data(txn, &target)? {
                    return Ok(existing);
                }
                let target_id = self.target_cache.allocate_target_id(txn)?;
                let target_data =
                    TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.current_sequence_number());
                self.target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })
            .await?;

        let newer = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |current| target_data.snapshot_version > current.snapshot_version);
        if newer {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_ids_by_canonical_id
                .insert(target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Target data for `target` if it is active or persisted.
    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let state = self.state.lock().await;
        if let Some(cached) = state.cached_target_data(target) {
            return Ok(Some(cached.clone()));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_target_data(txn, target)
            })
            .await
    }

    /// Stops tracking an active target.
    ///
    /// Unless `keep_persisted_target_data` is set, the target's sequence number is bumped so
    /// garbage collection considers it recently used.
    pub async fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            return Err(failed_precondition(format!("Tried to release nonexistent target {target_id}")));
        };
        if !keep_persisted_target_data {
            self.persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    let updated = target_data.with_sequence_number(txn.current_sequence_number());
                    self.target_cache.update_target_data(txn, &updated)
                })
                .await?;
        }
        state.target_data_by_target.remove(&target_id);
        state
            .target_ids_by_canonical_id
            .remove(&target_data.target.canonical_id());
        state.local_view_references.remove_references_for_id(target_id);
        Ok(())
    }

    /// Runs `query` against the local cache.
    ///
    /// With `use_previous_results` the query engine may reuse the target's last synced result.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let state = self.state.lock().await;
        let target = query.to_target();
        let cached = state.cached_target_data(&target).cloned();
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let target_data = match &cached {
                    Some(target_data) => Some(target_data.clone()),
                    None => self.target_cache.get_target_data(txn, &target)?,
                };
                let mut last_limbo_free = SnapshotVersion::min();
                let mut remote_keys = BTreeSet::new();
                if let Some(target_data) = target_data {
                    last_limbo_free = target_data.last_limbo_free_snapshot_version;
                    remote_keys = self
                        .target_cache
                        .get_matching_keys_for_target_id(txn, target_data.target_id)?;
                }
                let documents = if use_previous_results {
                    state
                        .query_engine
                        .get_documents_matching_query(txn, query, last_limbo_free, &remote_keys)?
                } else {
                    state
                        .query_engine
                        .get_documents_matching_query(txn, query, SnapshotVersion::min(), &BTreeSet::new())?
                };
                Ok(QueryResult { documents, remote_keys })
            })
            .await
    }

    pub async fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Get remote document keys", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
            .await
    }

    /// Local views of documents written to the remote cache since the previous call.
    ///
    /// Secondary clients use this to catch up with changes the primary committed.
    pub async fn get_new_document_changes(&self) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut state = self.state.lock().await;
        let since = state.last_document_change_read_time;
        let (changes, latest) = {
            let view = &state.local_documents;
            self.persistence
                .run_transaction("Get new document changes", TransactionMode::ReadOnly, |txn| {
                    let (documents, latest) = self.remote_documents.get_new_document_changes(txn, since)?;
                    Ok((view.get_local_view_of_documents(txn, documents, &BTreeSet::new())?, latest))
                })
                .await?
        };
        state.last_document_change_read_time = latest;
        Ok(changes)
    }

    /// Runs one garbage collection pass over inactive targets and unreferenced documents.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let state = self.state.lock().await;
        let active_target_ids: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
        let pins = &state.local_view_references;
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                self.garbage_collector.collect(txn, &active_target_ids, pins)
            })
            .await
    }

    /// Replaces the configured field indexes, keeping entries of indexes that survive.
    pub async fn configure_field_indexes(&self, definitions: &[FieldIndexDefinition]) -> FirestoreResult<Vec<FieldIndex>> {
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                for existing in self.index_manager.get_field_indexes(txn, None)? {
                    let keep = definitions.iter().any(|definition| {
                        definition.collection_group == existing.collection_group
                            && definition.field == existing.field
                            && definition.kind == existing.kind
                    });
                    if !keep {
                        self.index_manager.delete_field_index(txn, existing.index_id)?;
                    }
                }
                definitions
                    .iter()
                    .map(|definition| {
                        self.index_manager.add_field_index(
                            txn,
                            &definition.collection_group,
                            &definition.field,
                            definition.kind,
                        )
                    })
                    .collect()
            })
            .await
    }

    pub async fn get_field_indexes(&self) -> FirestoreResult<Vec<FieldIndex>> {
        self.persistence
            .run_transaction("Get field indexes", TransactionMode::ReadOnly, |txn| {
                self.index_manager.get_field_indexes(txn, None)
            })
            .await
    }

    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Delete all indexes", TransactionMode::ReadWrite, |txn| {
                for index in self.index_manager.get_field_indexes(txn, None)? {
                    self.index_manager.delete_field_index(txn, index.index_id)?;
                }
                Ok(())
            })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        let settings = self.settings.clone().with_index_auto_creation(enabled);
        state.query_engine = QueryEngine::new(state.local_documents.clone(), self.index_manager).with_settings(&settings);
    }

    /// Writes index entries for up to `max_documents` cached documents.
    pub async fn backfill_indexes(&self, max_documents: usize) -> FirestoreResult<usize> {
        let backfiller = IndexBackfiller::new(self.index_manager, self.remote_documents);
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
                backfiller.backfill(txn, max_documents)
            })
            .await
    }

    pub fn index_backfill_max_documents(&self) -> usize {
        self.settings.index_backfill_max_documents
    }

    /// Whether a bundle with the same id and an equal or newer create time was already loaded.
    pub async fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence
            .run_transaction("Has newer bundle", TransactionMode::ReadOnly, |txn| {
                Ok(self
                    .bundle_cache
                    .get_bundle_metadata(txn, &metadata.id)?
                    .is_some_and(|cached| cached.create_time >= metadata.create_time))
            })
            .await
    }

    pub async fn save_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", TransactionMode::ReadWrite, |txn| {
                self.bundle_cache.save_bundle_metadata(txn, metadata)
            })
            .await
    }

    pub async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.persistence
            .run_transaction("Get named query", TransactionMode::ReadOnly, |txn| {
                self.bundle_cache.get_named_query(txn, name)
            })
            .await
    }

    /// Saves a bundled query and, when the bundle is newer than the cached target, seeds the
    /// target's result with `documents` as of the bundle's read time.
    pub async fn save_named_query(&self, named_query: &NamedQuery, documents: &BTreeSet<DocumentKey>) -> FirestoreResult<()> {
        let target = named_query.query.to_target();
        let was_active = self.state.lock().await.cached_target_data(&target).is_some();
        let allocated = self.allocate_target(target.clone()).await?;

        let mut state = self.state.lock().await;
        let updated = self
            .persistence
            .run_transaction("Save named query", TransactionMode::ReadWrite, |txn| {
                if allocated.snapshot_version >= named_query.read_time {
                    self.bundle_cache.save_named_query(txn, named_query)?;
                    return Ok(None);
                }
                let updated = allocated.with_resume_token(Vec::new(), named_query.read_time);
                self.target_cache.update_target_data(txn, &updated)?;
                self.target_cache
                    .remove_matching_keys_for_target_id(txn, allocated.target_id)?;
                self.target_cache
                    .add_matching_keys(txn, documents.iter(), allocated.target_id)?;
                self.bundle_cache.save_named_query(txn, named_query)?;
                Ok(Some(updated))
            })
            .await?;

        if was_active {
            if let Some(updated) = updated {
                state.target_data_by_target.insert(updated.target_id, updated);
            }
        } else {
            state.target_data_by_target.remove(&allocated.target_id);
            state.target_ids_by_canonical_id.remove(&target.canonical_id());
        }
        Ok(())
    }

    /// Stores documents from bundle `bundle_id` in the remote cache and returns their local views.
    ///
    /// The documents are tied to a per-bundle umbrella target so they are not collected before
    /// any query uses them.
    pub async fn apply_bundle_documents(
        &self,
        bundle_id: &str,
        documents: Vec<MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let umbrella = Query::at_path(ResourcePath::from_segments(["__bundle__", "docs", bundle_id])).to_target();
        let umbrella_data = self.allocate_target(umbrella).await?;
        let keys: BTreeSet<DocumentKey> = documents.iter().map(|document| document.key().clone()).collect();
        let updates: BTreeMap<DocumentKey, MutableDocument> = documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();

        let state = self.state.lock().await;
        let view = &state.local_documents;
        self.persistence
            .run_transaction("Apply bundle documents", TransactionMode::ReadWrite, |txn| {
                let mut buffer = self.remote_documents.new_change_buffer();
                let (changed, existence_changed) =
                    self.populate_document_change_buffer(txn, &mut buffer, &updates, SnapshotVersion::min())?;
                buffer.apply(txn)?;
                self.target_cache
                    .remove_matching_keys_for_target_id(txn, umbrella_data.target_id)?;
                self.target_cache
                    .add_matching_keys(txn, keys.iter(), umbrella_data.target_id)?;
                view.get_local_view_of_documents(txn, changed, &existence_changed)
            })
            .await
    }

    /// Active target ids and their data.
    pub async fn active_targets(&self) -> BTreeMap<TargetId, TargetData> {
        self.state.lock().await.target_data_by_target.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::lru_garbage_collector::LruParams;
    use crate::firestore::model::MutationResult;
    use crate::firestore::test_support::{
        deleted_doc, doc, field, key, memory_persistence, patch_mutation, query, set_mutation, test_settings, version,
    };
    use serde_json::json;

    async fn local_store() -> Arc<LocalStore> {
        local_store_with(test_settings()).await
    }

    async fn local_store_with(settings: FirestoreSettings) -> Arc<LocalStore> {
        let store = LocalStore::new(memory_persistence().await, settings, User::unauthenticated());
        store.start().await.unwrap();
        store
    }

    fn ack(batch: MutationBatch, commit_seconds: i64) -> MutationBatchResult {
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult {
                version: version(commit_seconds),
                transform_results: Vec::new(),
            })
            .collect();
        MutationBatchResult::from(batch, version(commit_seconds), results, b"token".to_vec()).unwrap()
    }

    fn event_for(target_id: TargetId, snapshot_seconds: i64, documents: Vec<MutableDocument>) -> RemoteEvent {
        let mut event = RemoteEvent::empty(version(snapshot_seconds));
        let mut change = TargetChange {
            resume_token: format!("resume-{snapshot_seconds}").into_bytes(),
            current: true,
            ..TargetChange::default()
        };
        for document in documents {
            if document.is_found_document() {
                change.added_documents.insert(document.key().clone());
            } else {
                change.removed_documents.insert(document.key().clone());
            }
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn local_writes_are_visible_until_acknowledged() {
        let store = local_store().await;
        let result = store
            .write_locally(vec![set_mutation("rooms/a", json!({"name": "lobby"}))])
            .await
            .unwrap();
        let written = &result.changes[&key("rooms/a")];
        assert!(written.has_local_mutations());
        assert_eq!(store.get_highest_unacknowledged_batch_id().await.unwrap(), result.batch_id);

        let batch = store.next_mutation_batch(None).await.unwrap().expect("queued batch");
        assert_eq!(batch.batch_id, result.batch_id);

        let changes = store.acknowledge_batch(&ack(batch.clone(), 10)).await.unwrap();
        let acknowledged = &changes[&key("rooms/a")];
        assert!(!acknowledged.has_local_mutations());
        assert!(acknowledged.has_committed_mutations());
        assert_eq!(acknowledged.version(), version(10));
        assert_eq!(store.get_last_stream_token().await.unwrap(), b"token".to_vec());
        assert!(store.next_mutation_batch(None).await.unwrap().is_none());

        // A second acknowledgement of the same batch changes nothing.
        let again = store.acknowledge_batch(&ack(batch, 10)).await.unwrap();
        assert_eq!(again[&key("rooms/a")].version(), version(10));
    }

    #[tokio::test]
    async fn rejected_batches_revert_to_remote_state() {
        let store = local_store().await;
        let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![doc("rooms/a", 5, json!({"n": 1}))]))
            .await
            .unwrap();

        let write = store
            .write_locally(vec![patch_mutation("rooms/a", json!({"n": 2}))])
            .await
            .unwrap();
        assert_eq!(
            write.changes[&key("rooms/a")].field(&field("n")),
            Some(&crate::firestore::test_support::value(json!(2)))
        );

        let reverted = store.reject_batch(write.batch_id).await.unwrap();
        let document = &reverted[&key("rooms/a")];
        assert!(!document.has_local_mutations());
        assert_eq!(document.field(&field("n")), Some(&crate::firestore::test_support::value(json!(1))));
        assert!(store.reject_batch(write.batch_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_patch_does_not_revive_remotely_deleted_document() {
        let store = local_store().await;
        let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![doc("rooms/a", 5, json!({"n": 1}))]))
            .await
            .unwrap();
        store
            .write_locally(vec![patch_mutation("rooms/a", json!({"n": 2}))])
            .await
            .unwrap();

        let changes = store
            .apply_remote_event(&event_for(target.target_id, 6, vec![deleted_doc("rooms/a", 6)]))
            .await
            .unwrap();
        assert!(changes[&key("rooms/a")].is_no_document());

        let read_back = store.read_document(&key("rooms/a")).await.unwrap();
        assert!(!read_back.is_found_document());
        assert_eq!(read_back.field(&field("n")), None);

        // The document comes back with the patch applied once the server recreates it.
        store
            .apply_remote_event(&event_for(target.target_id, 7, vec![doc("rooms/a", 7, json!({"n": 5, "m": 1}))]))
            .await
            .unwrap();
        let recreated = store.read_document(&key("rooms/a")).await.unwrap();
        assert!(recreated.is_found_document());
        assert_eq!(recreated.field(&field("n")), Some(&crate::firestore::test_support::value(json!(2))));
    }

    #[tokio::test]
    async fn remote_events_ignore_outdated_documents() {
        let store = local_store().await;
        let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![doc("rooms/a", 5, json!({"n": 1}))]))
            .await
            .unwrap();
        let stale = store
            .apply_remote_event(&event_for(target.target_id, 6, vec![doc("rooms/a", 3, json!({"n": 0}))]))
            .await
            .unwrap();
        assert!(stale.is_empty());
        assert_eq!(store.get_last_remote_snapshot_version().await.unwrap(), version(6));

        let deleted = store
            .apply_remote_event(&event_for(target.target_id, 7, vec![deleted_doc("rooms/a", 7)]))
            .await
            .unwrap();
        assert!(deleted[&key("rooms/a")].is_no_document());
        assert!(store.get_remote_document_keys(target.target_id).await.unwrap().is_empty());

        let active = store.active_targets().await;
        assert_eq!(active[&target.target_id].resume_token, b"resume-7".to_vec());
        assert_eq!(active[&target.target_id].snapshot_version, version(7));
    }

    #[tokio::test]
    async fn targets_are_shared_and_released() {
        let store = local_store().await;
        let first = store.allocate_target(query("rooms").to_target()).await.unwrap();
        let second = store.allocate_target(query("rooms").to_target()).await.unwrap();
        assert_eq!(first.target_id, second.target_id);
        let other = store.allocate_target(query("users").to_target()).await.unwrap();
        assert_ne!(first.target_id, other.target_id);

        store.release_target(first.target_id, false).await.unwrap();
        assert!(!store.active_targets().await.contains_key(&first.target_id));
        assert!(store.release_target(first.target_id, false).await.is_err());

        // Persisted data is found again and keeps its id.
        let persisted = store.get_target_data(&query("rooms").to_target()).await.unwrap().unwrap();
        assert_eq!(persisted.target_id, first.target_id);
        assert!(persisted.sequence_number > first.sequence_number);
    }

    #[tokio::test]
    async fn queries_merge_pending_writes_with_cached_documents() {
        let store = local_store().await;
        let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
        store
            .apply_remote_event(&event_for(
                target.target_id,
                5,
                vec![doc("rooms/a", 5, json!({"n": 1})), doc("rooms/b", 5, json!({"n": 2}))],
            ))
            .await
            .unwrap();
        store
            .write_locally(vec![set_mutation("rooms/c", json!({"n": 3}))])
            .await
            .unwrap();

        let result = store.execute_query(&query("rooms"), true).await.unwrap();
        let keys: Vec<_> = result.documents.keys().cloned().collect();
        assert_eq!(keys, vec![key("rooms/a"), key("rooms/b"), key("rooms/c")]);
        assert_eq!(result.remote_keys, [key("rooms/a"), key("rooms/b")].into_iter().collect());
    }

    #[tokio::test]
    async fn user_change_swaps_mutation_queues() {
        let store = local_store().await;
        let write = store
            .write_locally(vec![set_mutation("rooms/a", json!({"owner": "anonymous"}))])
            .await
            .unwrap();

        let change = store.handle_user_change(User::authenticated("alice")).await.unwrap();
        assert_eq!(change.removed_batch_ids, vec![write.batch_id]);
        assert!(change.added_batch_ids.is_empty());
        assert!(!change.affected_documents[&key("rooms/a")].is_valid_document());
        assert!(store.next_mutation_batch(None).await.unwrap().is_none());

        let back = store.handle_user_change(User::unauthenticated()).await.unwrap();
        assert_eq!(back.added_batch_ids, vec![write.batch_id]);
        assert!(back.affected_documents[&key("rooms/a")].has_local_mutations());
    }

    #[tokio::test]
    async fn garbage_collection_spares_documents_in_live_views() {
        let mut settings = test_settings();
        settings.lru = LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            ..settings.lru
        };
        let store = local_store_with(settings).await;
        let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![doc("rooms/a", 5, json!({"n": 1}))]))
            .await
            .unwrap();
        store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id: target.target_id,
                from_cache: false,
                added_keys: [key("rooms/a")].into_iter().collect(),
                removed_keys: BTreeSet::new(),
            }])
            .await
            .unwrap();

        let results = store.collect_garbage().await.unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 0);
        assert_eq!(results.documents_removed, 0);

        store.release_target(target.target_id, false).await.unwrap();
        let results = store.collect_garbage().await.unwrap();
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
        assert!(!store.read_document(&key("rooms/a")).await.unwrap().is_valid_document());
    }

    #[tokio::test]
    async fn garbage_collection_reclaims_acknowledged_unlistened_documents() {
        let mut settings = test_settings();
        settings.lru = LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            ..settings.lru
        };
        let store = local_store_with(settings).await;
        store
            .write_locally(vec![set_mutation("rooms/x", json!({"n": 1}))])
            .await
            .unwrap();
        store
            .write_locally(vec![set_mutation("rooms/y", json!({"n": 2}))])
            .await
            .unwrap();

        let first = store.next_mutation_batch(None).await.unwrap().expect("first batch");
        store.acknowledge_batch(&ack(first, 10)).await.unwrap();
        assert!(store.read_document(&key("rooms/x")).await.unwrap().is_found_document());

        let results = store.collect_garbage().await.unwrap();
        assert!(results.did_run);
        assert_eq!(results.documents_removed, 1);
        assert!(!store.read_document(&key("rooms/x")).await.unwrap().is_valid_document());
        // Still queued, so never collected.
        assert!(store.read_document(&key("rooms/y")).await.unwrap().has_local_mutations());
    }

    #[tokio::test]
    async fn limbo_free_version_advances_for_synced_views() {
        let store = local_store().await;
        let target = store.allocate_target(query("rooms").to_target()).await.unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![doc("rooms/a", 5, json!({}))]))
            .await
            .unwrap();
        store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id: target.target_id,
                from_cache: false,
                ..LocalViewChanges::default()
            }])
            .await
            .unwrap();
        let active = store.active_targets().await;
        assert_eq!(active[&target.target_id].last_limbo_free_snapshot_version, version(5));
    }

    #[tokio::test]
    async fn bundles_seed_named_queries() {
        let store = local_store().await;
        let metadata = BundleMetadata {
            id: "b1".to_string(),
            version: 1,
            create_time: version(20),
            total_documents: 1,
            total_bytes: 64,
        };
        assert!(!store.has_newer_bundle(&metadata).await.unwrap());

        let mut bundled = doc("rooms/a", 15, json!({"n": 1}));
        bundled.set_read_time(version(20));
        let changes = store.apply_bundle_documents("b1", vec![bundled]).await.unwrap();
        assert!(changes[&key("rooms/a")].is_found_document());

        let named = NamedQuery {
            name: "all-rooms".to_string(),
            query: query("rooms"),
            read_time: version(20),
        };
        store
            .save_named_query(&named, &[key("rooms/a")].into_iter().collect())
            .await
            .unwrap();
        store.save_bundle(&metadata).await.unwrap();

        assert!(store.has_newer_bundle(&metadata).await.unwrap());
        assert_eq!(store.get_named_query("all-rooms").await.unwrap(), Some(named));
        let target = store.get_target_data(&query("rooms").to_target()).await.unwrap().unwrap();
        assert_eq!(target.snapshot_version, version(20));
        assert_eq!(
            store.get_remote_document_keys(target.target_id).await.unwrap(),
            [key("rooms/a")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn configured_indexes_replace_previous_ones() {
        let store = local_store().await;
        let rooms = FieldIndexDefinition {
            collection_group: "rooms".to_string(),
            field: field("n"),
            kind: IndexKind::Ascending,
        };
        let users = FieldIndexDefinition {
            collection_group: "users".to_string(),
            field: field("age"),
            kind: IndexKind::Ascending,
        };
        store.configure_field_indexes(&[rooms.clone(), users]).await.unwrap();
        assert_eq!(store.get_field_indexes().await.unwrap().len(), 2);

        let kept = store.configure_field_indexes(&[rooms]).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(store.get_field_indexes().await.unwrap(), kept);

        store.delete_all_field_indexes().await.unwrap();
        assert!(store.get_field_indexes().await.unwrap().is_empty());
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::oneshot;

use crate::firestore::core::event_manager::{QueryEventSource, SyncEngineListener};
use crate::firestore::core::listen_sequence::INVALID_SEQUENCE_NUMBER;
use crate::firestore::core::query::Query;
use crate::firestore::core::target::{TargetData, TargetPurpose};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::user::User;
use crate::firestore::core::view::{ChangeType, LimboDocumentChange, View, ViewSnapshot};
use crate::firestore::error::{cancelled, FirestoreError, FirestoreResult};
use crate::firestore::local::bundle_cache::{BundleMetadata, NamedQuery};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::{LocalStore, LocalViewChanges};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::FirestoreSettings;
use crate::util::hard_assert;

type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Settles once the backend acknowledged or rejected a write.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub async fn wait(self) -> FirestoreResult<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("The client shut down before the write was acknowledged")),
        }
    }
}

/// Settles once every write queued before the call has been acknowledged or rejected.
#[derive(Debug)]
pub struct PendingWritesWaiter {
    receiver: oneshot::Receiver<FirestoreResult<()>>,
}

impl PendingWritesWaiter {
    pub async fn wait(self) -> FirestoreResult<()> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(cancelled("The client shut down before pending writes completed")),
        }
    }
}

/// A parsed data bundle: its header, the documents it carries and its named queries with the
/// keys each query matched when the bundle was built.
#[derive(Clone, Debug)]
pub struct LoadedBundle {
    pub metadata: BundleMetadata,
    pub documents: Vec<MutableDocument>,
    pub named_queries: Vec<(NamedQuery, BTreeSet<DocumentKey>)>,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A single-document target listened to until the backend confirms or denies the document.
#[derive(Clone, Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the target has seen the document. An ack without it means the document is gone.
    received_document: bool,
}

struct SyncEngineState {
    current_user: User,
    online_state: OnlineState,
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo keys waiting for a free resolution slot, in arrival order.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets consider each key to be in limbo.
    limbo_document_refs: ReferenceSet,
    limbo_target_ids: TargetIdGenerator,
    /// Write callbacks by user storage key, then batch id.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
}

/// Orchestrates listens, writes and limbo resolution between the local store, the remote
/// store and the views handed to the event manager.
///
/// All state changes run under one async lock, so remote events, writes and listens are
/// applied one at a time and views never regress. Remote keys per target are mirrored in a
/// plain mutex because the watch aggregator reads them synchronously.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
    remote_keys: StdMutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
    listener: StdMutex<Option<Weak<dyn SyncEngineListener>>>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
        settings: &FirestoreSettings,
        user: User,
    ) -> Arc<Self> {
        Arc::new_cyclic(|engine: &Weak<SyncEngine>| {
            let syncer: Weak<dyn RemoteSyncer> = engine.clone();
            let remote_store = RemoteStore::new(network_layer, serializer, settings, syncer);
            Self {
                local_store,
                remote_store,
                max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions.max(1),
                state: Mutex::new(SyncEngineState {
                    current_user: user,
                    online_state: OnlineState::Unknown,
                    query_views: HashMap::new(),
                    queries_by_target: BTreeMap::new(),
                    enqueued_limbo_resolutions: VecDeque::new(),
                    active_limbo_targets_by_key: BTreeMap::new(),
                    active_limbo_resolutions_by_target: BTreeMap::new(),
                    limbo_document_refs: ReferenceSet::new(),
                    limbo_target_ids: TargetIdGenerator::for_sync_engine(),
                    mutation_user_callbacks: HashMap::new(),
                    pending_writes_callbacks: BTreeMap::new(),
                }),
                remote_keys: StdMutex::new(BTreeMap::new()),
                listener: StdMutex::new(None),
            }
        })
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    /// Registers the receiver of view snapshots, normally the event manager.
    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Starts tracking `query` and returns its first snapshot, computed from the cache.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let mut state = self.state.lock().await;
        if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                &mut state,
                query,
                target_data.target_id,
                false,
                target_data.resume_token.clone(),
            )
            .await?;
        self.remote_store.listen(target_data).await?;
        self.refresh_remote_keys(&state);
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = TargetChange::synthesized_for_current_change(
            current && state.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
            .await?;

        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    /// Stops tracking `query`. The target is released once no query uses it.
    pub async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(query_view) = state.query_views.remove(&query.canonical_id()) else {
            return Ok(());
        };
        let target_id = query_view.target_id;
        if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
            queries.retain(|candidate| candidate.canonical_id() != query_view.query.canonical_id());
            if !queries.is_empty() {
                return Ok(());
            }
        }

        if let Err(err) = self.local_store.release_target(target_id, false).await {
            log::warn!(target: "firestore::sync_engine", "failed to release target {target_id}: {err}");
        }
        self.remove_and_clean_up_target(&mut state, target_id, None).await?;
        self.remote_store.unlisten(target_id).await?;
        self.refresh_remote_keys(&state);
        Ok(())
    }

    /// Queues `mutations` as one batch, updates affected views and hands the batch to the
    /// remote store.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let mut state = self.state.lock().await;
        let result = self.local_store.write_locally(mutations).await?;
        let (sender, receiver) = oneshot::channel();
        let user_key = state.current_user.storage_key().to_string();
        state
            .mutation_user_callbacks
            .entry(user_key)
            .or_default()
            .insert(result.batch_id, sender);

        self.emit_new_snaps_and_notify_local_store(&mut state, &result.changes, None)
            .await?;
        drop(state);

        if let Err(err) = self.remote_store.fill_write_pipeline().await {
            log::warn!(target: "firestore::sync_engine", "failed to hand batch {} to the write stream: {err}", result.batch_id);
        }
        Ok(PendingWrite {
            batch_id: result.batch_id,
            receiver,
        })
    }

    /// Resolves once every currently queued write was acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<PendingWritesWaiter> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                target: "firestore::sync_engine",
                "the network is disabled; waiting for pending writes will not finish until it is enabled"
            );
        }
        let mut state = self.state.lock().await;
        let (sender, receiver) = oneshot::channel();
        let highest = self.local_store.get_highest_unacknowledged_batch_id().await?;
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            state
                .pending_writes_callbacks
                .entry(highest)
                .or_default()
                .push(sender);
        }
        Ok(PendingWritesWaiter { receiver })
    }

    /// Keys currently being resolved, with their limbo target ids.
    pub async fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state.lock().await.active_limbo_targets_by_key.clone()
    }

    /// Keys waiting for a free limbo resolution slot.
    pub async fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state
            .lock()
            .await
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    /// Folds documents another client wrote to the shared cache into the views.
    pub async fn synchronize_with_changed_documents(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let changes = self.local_store.get_new_document_changes().await?;
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await?;
        self.refresh_remote_keys(&state);
        Ok(())
    }

    /// Applies a bundle to the cache and raises snapshots for the views it touches. Returns
    /// `false` when an equal or newer copy of the bundle was already loaded.
    pub async fn load_bundle(&self, bundle: LoadedBundle) -> FirestoreResult<bool> {
        let mut state = self.state.lock().await;
        if self.local_store.has_newer_bundle(&bundle.metadata).await? {
            log::debug!(target: "firestore::sync_engine", "bundle {} already loaded", bundle.metadata.id);
            return Ok(false);
        }
        let create_time = bundle.metadata.create_time;
        let documents = bundle
            .documents
            .into_iter()
            .map(|mut document| {
                if document.read_time().is_min() {
                    document.set_read_time(create_time);
                }
                document
            })
            .collect();
        let changes = self
            .local_store
            .apply_bundle_documents(&bundle.metadata.id, documents)
            .await?;
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await?;
        for (named_query, documents) in &bundle.named_queries {
            self.local_store.save_named_query(named_query, documents).await?;
        }
        self.local_store.save_bundle(&bundle.metadata).await?;
        self.refresh_remote_keys(&state);
        Ok(true)
    }

    pub async fn current_user(&self) -> User {
        self.state.lock().await.current_user.clone()
    }

    async fn apply_remote_event_locked(&self, state: &mut SyncEngineState, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let touched =
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
            hard_assert(touched <= 1, 0x5858, "Limbo resolution for a single document contains multiple changes");
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    0x390f,
                    "Received change for limbo target document without add",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    0xa4f3,
                    "Received remove for limbo target document without add",
                );
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event).await?;
        self.emit_new_snaps_and_notify_local_store(state, &changes, Some(&event))
            .await?;
        self.refresh_remote_keys(state);
        Ok(())
    }

    /// Recomputes every view for `changes`, raises the resulting snapshots and tells the local
    /// store which documents the views now reference.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: &BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();

        let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // A limit query lost a document at its edge: rerun it over the whole cache.
                let query_result = self.local_store.execute_query(&query_view.query, false).await?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(doc_changes, true, target_change, target_is_pending_reset);

            self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
                .await?;
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        if !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                listener.on_watch_change(snapshots);
            }
        }
        self.local_store.notify_local_view_changes(&view_changes).await
    }

    async fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) -> FirestoreResult<()> {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, key).await?;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!(target: "firestore::sync_engine", "document no longer in limbo: {key}");
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn track_limbo_change(&self, state: &mut SyncEngineState, key: DocumentKey) -> FirestoreResult<()> {
        if !state.active_limbo_targets_by_key.contains_key(&key) && !state.enqueued_limbo_resolutions.contains(&key) {
            log::debug!(target: "firestore::sync_engine", "new document in limbo: {key}");
            state.enqueued_limbo_resolutions.push_back(key);
            self.pump_enqueued_limbo_resolutions(state).await?;
        }
        Ok(())
    }

    /// Starts resolutions for queued keys while slots are free.
    async fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState) -> FirestoreResult<()> {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = state.limbo_target_ids.next_id();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            let target = Query::at_path(key.path().clone()).to_target();
            self.remote_store
                .listen(TargetData::new(
                    target,
                    limbo_target_id,
                    TargetPurpose::LimboResolution,
                    INVALID_SEQUENCE_NUMBER,
                ))
                .await?;
        }
        Ok(())
    }

    async fn remove_limbo_target(&self, state: &mut SyncEngineState, key: &DocumentKey) -> FirestoreResult<()> {
        state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) {
            state.active_limbo_resolutions_by_target.remove(&limbo_target_id);
            self.remote_store.unlisten(limbo_target_id).await?;
            self.pump_enqueued_limbo_resolutions(state).await?;
        }
        Ok(())
    }

    /// Drops every view on `target_id` and the limbo resolutions only it needed. With an
    /// error, listeners of those views are told the listen failed.
    async fn remove_and_clean_up_target(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
        let listener = self.listener();
        for query in queries {
            state.query_views.remove(&query.canonical_id());
            if let (Some(error), Some(listener)) = (&error, &listener) {
                listener.on_watch_error(&query, error.clone());
            }
        }

        let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !state.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(state, &key).await?;
            }
        }
        Ok(())
    }

    fn settle_user_callback(state: &mut SyncEngineState, batch_id: BatchId, result: FirestoreResult<()>) {
        let user_key = state.current_user.storage_key().to_string();
        let callback = state
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(state: &mut SyncEngineState, batch_id: BatchId) {
        for callback in state.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    /// Mirrors the keys each target is known to contain for the watch aggregator.
    fn refresh_remote_keys(&self, state: &SyncEngineState) {
        let mut remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for (target_id, resolution) in &state.active_limbo_resolutions_by_target {
            let keys = remote_keys.entry(*target_id).or_default();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
        }
        for (target_id, queries) in &state.queries_by_target {
            let keys = remote_keys.entry(*target_id).or_default();
            for query in queries {
                if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                    keys.extend(query_view.view.synced_documents().iter().cloned());
                }
            }
        }
        *self.remote_keys.lock().unwrap() = remote_keys;
    }

    async fn handle_user_change_locked(&self, state: &mut SyncEngineState, user: User) -> FirestoreResult<()> {
        if state.current_user == user {
            return Ok(());
        }
        log::debug!(target: "firestore::sync_engine", "user changed from {} to {user}", state.current_user);
        let result = self.local_store.handle_user_change(user.clone()).await?;

        for (_, callbacks) in state.mutation_user_callbacks.drain() {
            for (_, callback) in callbacks {
                let _ = callback.send(Err(cancelled("User changed before the write was acknowledged")));
            }
        }
        for (_, callbacks) in std::mem::take(&mut state.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(cancelled(
                    "Waiting for pending writes was cancelled because the user changed",
                )));
            }
        }
        state.current_user = user;

        self.emit_new_snaps_and_notify_local_store(state, &result.affected_documents, None)
            .await?;
        self.refresh_remote_keys(state);
        Ok(())
    }
}

/// Keys a snapshot added to and removed from the view, for reference tracking.
fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.doc.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.doc.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            self.apply_remote_event_locked(&mut state, event).await
        })
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            let limbo_key = state
                .active_limbo_resolutions_by_target
                .get(&target_id)
                .map(|resolution| resolution.key.clone());

            match limbo_key {
                Some(key) => {
                    // The backend refuses to tell us about the document, most likely because
                    // it is not readable: treat it as deleted.
                    log::debug!(target: "firestore::sync_engine", "limbo resolution for {key} rejected: {error}");
                    state.active_limbo_resolutions_by_target.remove(&target_id);
                    state.active_limbo_targets_by_key.remove(&key);
                    self.pump_enqueued_limbo_resolutions(&mut state).await?;

                    let mut event = RemoteEvent::empty(SnapshotVersion::min());
                    event.document_updates.insert(
                        key.clone(),
                        MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()),
                    );
                    event.resolved_limbo_documents.insert(key);
                    self.apply_remote_event_locked(&mut state, event).await
                }
                None => {
                    if let Err(err) = self.local_store.release_target(target_id, false).await {
                        log::warn!(target: "firestore::sync_engine", "failed to release rejected target {target_id}: {err}");
                    }
                    self.remove_and_clean_up_target(&mut state, target_id, Some(error))
                        .await?;
                    self.refresh_remote_keys(&state);
                    Ok(())
                }
            }
        })
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            let batch_id = result.batch.batch_id;
            let changes = self.local_store.acknowledge_batch(&result).await?;
            Self::settle_user_callback(&mut state, batch_id, Ok(()));
            Self::trigger_pending_writes_callbacks(&mut state, batch_id);
            self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
                .await
        })
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            log::debug!(target: "firestore::sync_engine", "write batch {batch_id} rejected: {error}");
            let changes = self.local_store.reject_batch(batch_id).await?;
            Self::settle_user_callback(&mut state, batch_id, Err(error));
            Self::trigger_pending_writes_callbacks(&mut state, batch_id);
            self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
                .await
        })
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.remote_keys
            .lock()
            .unwrap()
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        box_remote_store_future(async move { self.local_store.next_mutation_batch(after_batch_id).await })
    }

    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move { self.local_store.set_last_stream_token(&token).await })
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            self.handle_user_change_locked(&mut state, user).await
        })
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(async move {
            let mut state = self.state.lock().await;
            state.online_state = online_state;
            let mut snapshots = Vec::new();
            for query_view in state.query_views.values_mut() {
                let view_change = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    view_change.limbo_changes.is_empty(),
                    0x4c92,
                    "Online state changes must not produce limbo changes",
                );
                snapshots.extend(view_change.snapshot);
            }
            if let Some(listener) = self.listener() {
                if !snapshots.is_empty() {
                    listener.on_watch_change(snapshots);
                }
                listener.on_online_state_change(online_state);
            }
        })
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl QueryEventSource for SyncEngine {
    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        SyncEngine::listen(self, query).await
    }

    async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        SyncEngine::unlisten(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream};
    use crate::firestore::test_support::{
        doc, document_frame, eventually, global_snapshot, key, loopback_network, memory_persistence, next_json, order_by,
        query, send_json, set_mutation, target_added, target_current, test_settings, version,
    };
    use serde_json::json;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<(String, FirestoreErrorCode)>>,
        online_states: StdMutex<Vec<OnlineState>>,
    }

    impl RecordingListener {
        fn latest_for(&self, query: &Query) -> Option<ViewSnapshot> {
            self.snapshots
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|snapshot| snapshot.query.canonical_id() == query.canonical_id())
                .cloned()
        }
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        engine: Arc<SyncEngine>,
        listener: Arc<RecordingListener>,
        server: MultiplexedConnection,
    }

    async fn harness_with(settings: FirestoreSettings) -> Harness {
        let persistence = memory_persistence().await;
        let local_store = LocalStore::new(persistence, settings.clone(), User::unauthenticated());
        local_store.start().await.expect("local store starts");
        let (layer, server) = loopback_network();
        let engine = SyncEngine::new(
            local_store,
            layer,
            JsonProtoSerializer::new(settings.database_id.clone()),
            &settings,
            User::unauthenticated(),
        );
        let listener = Arc::new(RecordingListener::default());
        engine.set_listener(Arc::downgrade(&listener) as Weak<dyn SyncEngineListener>);
        Harness {
            engine,
            listener,
            server,
        }
    }

    async fn harness() -> Harness {
        harness_with(test_settings()).await
    }

    fn target_id_of(frame: &serde_json::Value) -> TargetId {
        frame["addTarget"]["targetId"].as_i64().expect("target id") as TargetId
    }

    /// Accepts streams until one on `suffix` shows up, keeping the others open.
    async fn accept_stream(
        server: &MultiplexedConnection,
        parked: &mut Vec<MultiplexedStream>,
        suffix: &str,
    ) -> MultiplexedStream {
        loop {
            let (channel, stream) = server.accept().await.expect("stream");
            if channel.ends_with(suffix) {
                return stream;
            }
            parked.push(stream);
        }
    }

    /// Listens to `rooms` and lets the backend deliver `paths` before marking it current.
    async fn synced_rooms(h: &Harness, paths: &[&str]) -> (MultiplexedStream, TargetId) {
        h.engine.listen(query("rooms")).await.expect("listen");
        let (_, watch) = h.server.accept().await.expect("watch stream");
        let target_id = target_id_of(&next_json(&watch).await);
        send_json(&watch, target_added(&[target_id])).await;
        for path in paths {
            send_json(&watch, document_frame(path, 3, json!({ "n": 1 }), &[target_id])).await;
        }
        send_json(&watch, target_current(&[target_id], "AQ==")).await;
        send_json(&watch, global_snapshot(5)).await;
        let expected = paths.len();
        eventually(|| {
            h.listener
                .latest_for(&query("rooms"))
                .is_some_and(|snapshot| !snapshot.from_cache && snapshot.docs.len() == expected)
        })
        .await;
        (watch, target_id)
    }

    /// Listens to an ordered variant of `rooms` that the backend reports as empty, leaving
    /// every cached room in limbo.
    async fn listen_with_empty_result(h: &Harness, watch: &MultiplexedStream) -> Query {
        let ordered = query("rooms").with_order_by(order_by("n", "asc"));
        let initial = h.engine.listen(ordered.clone()).await.expect("listen");
        assert!(initial.from_cache);
        let target_id = target_id_of(&next_json(watch).await);
        send_json(watch, target_added(&[target_id])).await;
        send_json(watch, target_current(&[target_id], "Ag==")).await;
        send_json(watch, global_snapshot(6)).await;
        ordered
    }

    #[tokio::test]
    async fn listen_reports_cache_then_backend_results() {
        let h = harness().await;
        let (_watch, target_id) = synced_rooms(&h, &["rooms/a", "rooms/b"]).await;
        assert_eq!(target_id % 2, 0);

        // A second listen on the same query reuses the view.
        let again = h.engine.listen(query("rooms")).await.expect("listen again");
        assert_eq!(again.docs.len(), 2);
        assert!(!again.from_cache);
        assert!(h.engine.get_remote_keys_for_target(target_id).contains(&key("rooms/a")));
    }

    #[tokio::test]
    async fn write_is_visible_before_and_after_acknowledgement() {
        let h = harness().await;
        let mut parked = Vec::new();
        let (watch, target_id) = synced_rooms(&h, &[]).await;
        let pending = h
            .engine
            .write(vec![set_mutation("rooms/a", json!({ "n": 1 }))])
            .await
            .expect("write");

        let optimistic = h.listener.latest_for(&query("rooms")).expect("optimistic snapshot");
        assert_eq!(optimistic.docs.len(), 1);
        assert!(optimistic.has_pending_writes());

        let write = accept_stream(&h.server, &mut parked, "/Write").await;
        next_json(&write).await;
        send_json(&write, json!({ "streamToken": "AQ==" })).await;
        let request = next_json(&write).await;
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
        send_json(
            &write,
            json!({
                "streamToken": "Ag==",
                "commitTime": "1970-01-01T00:00:07Z",
                "writeResults": [{ "updateTime": "1970-01-01T00:00:07Z" }]
            }),
        )
        .await;

        pending.wait().await.expect("write acknowledged");
        let acknowledged = h.listener.latest_for(&query("rooms")).expect("acknowledged snapshot");
        let doc = acknowledged.docs.get(&key("rooms/a")).expect("acknowledged document");
        assert!(!doc.has_local_mutations());
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), version(7));
        // Still pending until watch reports the committed version.
        assert!(acknowledged.has_pending_writes());

        send_json(&watch, document_frame("rooms/a", 7, json!({ "n": 1 }), &[target_id])).await;
        send_json(&watch, global_snapshot(8)).await;
        eventually(|| {
            h.listener
                .latest_for(&query("rooms"))
                .is_some_and(|snapshot| snapshot.docs.len() == 1 && !snapshot.has_pending_writes())
        })
        .await;
        let settled = h.listener.latest_for(&query("rooms")).expect("settled snapshot");
        assert!(!settled.docs.get(&key("rooms/a")).expect("settled document").has_committed_mutations());
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_concurrency_cap() {
        let h = harness_with(test_settings().with_max_concurrent_limbo_resolutions(1)).await;
        let (watch, _) = synced_rooms(&h, &["rooms/a", "rooms/b", "rooms/c"]).await;
        listen_with_empty_result(&h, &watch).await;

        let limbo_request = next_json(&watch).await;
        let limbo_target = target_id_of(&limbo_request);
        assert_eq!(limbo_target % 2, 1);
        let active = h.engine.active_limbo_document_resolutions().await;
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec![(key("rooms/a"), limbo_target)]);
        assert_eq!(
            h.engine.enqueued_limbo_document_resolutions().await,
            vec![key("rooms/b"), key("rooms/c")]
        );

        // The backend confirms rooms/a is gone, which frees the slot for rooms/b.
        send_json(&watch, target_added(&[limbo_target])).await;
        send_json(&watch, target_current(&[limbo_target], "Aw==")).await;
        send_json(&watch, global_snapshot(7)).await;

        let mut next_limbo = None;
        for _ in 0..3 {
            let frame = next_json(&watch).await;
            if frame.get("addTarget").is_some() {
                next_limbo = Some(target_id_of(&frame));
                break;
            }
        }
        let next_limbo = next_limbo.expect("next limbo listen");
        assert_ne!(next_limbo, limbo_target);
        let active = h.engine.active_limbo_document_resolutions().await;
        assert_eq!(active.get(&key("rooms/b")), Some(&next_limbo));
        assert_eq!(h.engine.enqueued_limbo_document_resolutions().await, vec![key("rooms/c")]);
        let rooms = h.listener.latest_for(&query("rooms")).expect("rooms snapshot");
        assert!(!rooms.docs.contains(&key("rooms/a")));
    }

    #[tokio::test]
    async fn rejected_limbo_listen_treats_document_as_deleted() {
        let h = harness().await;
        let (watch, _) = synced_rooms(&h, &["rooms/a"]).await;
        let ordered = listen_with_empty_result(&h, &watch).await;
        let limbo_target = target_id_of(&next_json(&watch).await);

        send_json(
            &watch,
            json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [limbo_target],
                    "cause": { "code": 7, "message": "denied" }
                }
            }),
        )
        .await;

        eventually(|| {
            h.listener
                .latest_for(&ordered)
                .is_some_and(|snapshot| snapshot.docs.is_empty() && !snapshot.from_cache)
        })
        .await;
        assert!(h.engine.active_limbo_document_resolutions().await.is_empty());
        assert!(h.listener.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_query_listen_reports_error_and_drops_view() {
        let h = harness().await;
        h.engine.listen(query("rooms")).await.expect("listen");
        let (_, watch) = h.server.accept().await.expect("watch stream");
        let target_id = target_id_of(&next_json(&watch).await);
        send_json(
            &watch,
            json!({
                "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [target_id],
                    "cause": { "code": 7, "message": "denied" }
                }
            }),
        )
        .await;

        eventually(|| !h.listener.errors.lock().unwrap().is_empty()).await;
        assert_eq!(
            *h.listener.errors.lock().unwrap(),
            vec![(query("rooms").canonical_id(), FirestoreErrorCode::PermissionDenied)]
        );
        assert!(h.engine.state.lock().await.query_views.is_empty());
    }

    #[tokio::test]
    async fn user_change_cancels_outstanding_writes() {
        let h = harness().await;
        let pending = h
            .engine
            .write(vec![set_mutation("rooms/a", json!({ "n": 1 }))])
            .await
            .expect("write");
        let waiter = h.engine.wait_for_pending_writes().await.expect("waiter");

        RemoteSyncer::handle_credential_change(h.engine.as_ref(), User::authenticated("alice"))
            .await
            .expect("user change");

        let err = pending.wait().await.expect_err("write cancelled");
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        let err = waiter.wait().await.expect_err("waiter cancelled");
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        assert_eq!(h.engine.current_user().await, User::authenticated("alice"));
    }

    #[tokio::test]
    async fn waiting_without_pending_writes_resolves_immediately() {
        let h = harness().await;
        let waiter = h.engine.wait_for_pending_writes().await.expect("waiter");
        waiter.wait().await.expect("nothing pending");
    }

    #[tokio::test]
    async fn bundle_documents_reach_views_once() {
        let h = harness().await;
        h.engine.listen(query("rooms")).await.expect("listen");
        let bundle = LoadedBundle {
            metadata: BundleMetadata {
                id: "rooms-bundle".to_string(),
                version: 1,
                create_time: version(10),
                total_documents: 1,
                total_bytes: 64,
            },
            documents: vec![doc("rooms/a", 9, json!({ "n": 1 }))],
            named_queries: Vec::new(),
        };

        assert!(h.engine.load_bundle(bundle.clone()).await.expect("load"));
        let snapshot = h.listener.latest_for(&query("rooms")).expect("snapshot");
        assert!(snapshot.docs.contains(&key("rooms/a")));
        assert!(!h.engine.load_bundle(bundle).await.expect("reload"));
    }
}

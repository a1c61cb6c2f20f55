use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::target::TargetData;
use crate::firestore::core::user::User;
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::rpc_error::{is_permanent_error, is_permanent_write_error};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::streams::{
    ListenStream, ListenStreamDelegate, WriteResponse, WriteStream, WriteStreamDelegate,
};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::settings::FirestoreSettings;
use crate::platform::runtime;

/// Reasons the remote store keeps its streams down. The network is usable only when none
/// are present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    /// Another client sharing the database holds the primary lease.
    IsSecondary,
    Shutdown,
}

struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: Option<Arc<ListenStream<RemoteListenDelegate>>>,
    write_stream: Option<Arc<WriteStream<RemoteWriteDelegate>>>,
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Set once the open watch stream has been sent every listen target.
    watch_stream_open: bool,
    write_handshake_complete: bool,
    /// Batches sent (or waiting for the handshake) and not yet acknowledged, in batch order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl Default for RemoteStoreState {
    fn default() -> Self {
        Self {
            listen_targets: BTreeMap::new(),
            watch_stream: None,
            write_stream: None,
            watch_aggregator: None,
            watch_stream_open: false,
            write_handshake_complete: false,
            write_pipeline: VecDeque::new(),
            offline_causes: BTreeSet::new(),
        }
    }
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && self.watch_stream.is_none() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && self.write_stream.is_none() && !self.write_pipeline.is_empty()
    }

    fn last_batch_id(&self) -> Option<BatchId> {
        self.write_pipeline.back().map(|batch| batch.batch_id)
    }
}

/// The aggregator's view of target metadata: targets come from the remote store, remote keys
/// from the syncer.
struct ListenTargetsView<'a> {
    targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetsView<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }
}

/// Owns the watch and write streams and translates their traffic into calls on a
/// [`RemoteSyncer`].
///
/// Listen targets survive reconnects: every time the watch stream opens, all of them are
/// sent again with their latest resume token. Up to `max_pending_writes` batches are kept in
/// flight on the write stream and acknowledged strictly in order.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
        settings: &FirestoreSettings,
        remote_syncer: Weak<dyn RemoteSyncer>,
    ) -> Self {
        let (online_state, changes) = OnlineStateTracker::new(settings.online_state_timeout);
        let inner = Arc::new(RemoteStoreInner {
            state: Mutex::new(RemoteStoreState::default()),
            write_send_lock: Mutex::new(()),
            network_layer,
            serializer,
            remote_syncer: remote_syncer.clone(),
            online_state,
            max_pending_writes: settings.max_pending_writes.max(1),
        });

        runtime::spawn_detached(async move {
            while let Ok(state) = changes.recv().await {
                let Some(syncer) = remote_syncer.upgrade() else {
                    break;
                };
                log::debug!(target: "firestore::remote_store", "online state changed to {state:?}");
                syncer.apply_online_state_change(state).await;
            }
        });

        Self { inner }
    }

    /// Starts the streams that have work to do. The store begins with the network enabled.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.inner.enable_network_internal().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Stops both streams and reports `Offline`. Listen targets are kept and sent again by
    /// [`RemoteStore::enable_network`].
    pub async fn disable_network(&self) {
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Offline);
    }

    /// Only the primary client talks to the backend. Losing the lease stops both streams;
    /// regaining it restarts them.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.inner.state.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal().await
        } else {
            let newly_secondary = self.inner.state.lock().await.offline_causes.insert(OfflineCause::IsSecondary);
            if newly_secondary {
                log::debug!(target: "firestore::remote_store", "lost the primary lease; stopping streams");
                self.inner.disable_network_internal().await;
                self.inner.online_state.set(OnlineState::Unknown);
            }
            Ok(())
        }
    }

    pub async fn shutdown(&self) {
        log::debug!(target: "firestore::remote_store", "shutting down");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.online_state.set(OnlineState::Unknown);
    }

    /// Starts listening to `target_data`, opening the watch stream if needed.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Pulls batches from the syncer until the pipeline is full or the queue is drained.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams under the new user's credentials. Listen targets are kept.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state.state()
    }

    pub async fn is_listening(&self, target_id: TargetId) -> bool {
        self.inner.state.lock().await.listen_targets.contains_key(&target_id)
    }

    /// Number of batches sent but not yet acknowledged.
    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    /// Held while deciding and sending write requests so batches reach the stream in order.
    write_send_lock: Mutex<()>,
    network_layer: NetworkLayer,
    serializer: JsonProtoSerializer,
    remote_syncer: Weak<dyn RemoteSyncer>,
    online_state: OnlineStateTracker,
    max_pending_writes: usize,
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.remote_syncer.upgrade()
    }

    async fn enable_network_internal(self: &Arc<Self>) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if !state.can_use_network() {
                return Ok(());
            }
            if state.should_start_watch_stream() {
                self.start_watch_stream_locked(&mut state);
            } else if state.listen_targets.is_empty() {
                self.online_state.set(OnlineState::Unknown);
            }
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        let (watch, write) = {
            let mut state = self.state.lock().await;
            state.watch_aggregator = None;
            state.watch_stream_open = false;
            state.write_handshake_complete = false;
            // Batches stay in the mutation queue and are read again once the network returns.
            state.write_pipeline.clear();
            (state.watch_stream.take(), state.write_stream.take())
        };
        if let Some(stream) = watch {
            stream.stop();
        }
        if let Some(stream) = write {
            stream.stop();
        }
    }

    async fn handle_credential_change(self: &Arc<Self>, user: User) -> FirestoreResult<()> {
        let restart = {
            let mut state = self.state.lock().await;
            let usable = state.can_use_network();
            if usable {
                state.offline_causes.insert(OfflineCause::CredentialChange);
            }
            usable
        };
        if restart {
            log::debug!(target: "firestore::remote_store", "restarting streams for {user}");
            self.disable_network_internal().await;
            self.online_state.set(OnlineState::Unknown);
        }

        if let Some(syncer) = self.syncer() {
            syncer.handle_credential_change(user).await?;
        }

        if restart {
            self.state.lock().await.offline_causes.remove(&OfflineCause::CredentialChange);
            self.enable_network_internal().await?;
        }
        Ok(())
    }

    fn start_watch_stream_locked(self: &Arc<Self>, state: &mut RemoteStoreState) {
        let delegate = Arc::new(RemoteListenDelegate {
            inner: Arc::downgrade(self),
        });
        let stream = ListenStream::new(self.network_layer.clone(), self.serializer.clone(), delegate);
        state.watch_stream = Some(Arc::new(stream));
        state.watch_stream_open = false;
        state.watch_aggregator = Some(WatchChangeAggregator::new(self.serializer.database_id().clone()));
        self.online_state.handle_watch_stream_start();
    }

    fn start_write_stream_locked(self: &Arc<Self>, state: &mut RemoteStoreState) {
        let delegate = Arc::new(RemoteWriteDelegate {
            inner: Arc::downgrade(self),
        });
        let stream = WriteStream::new(self.network_layer.clone(), self.serializer.clone(), delegate);
        state.write_stream = Some(Arc::new(stream));
        state.write_handshake_complete = false;
    }

    async fn listen(self: &Arc<Self>, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        let stream = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return Ok(());
            }
            state.listen_targets.insert(target_id, target_data.clone());

            if state.should_start_watch_stream() {
                // The new target is sent together with the others once the stream opens.
                self.start_watch_stream_locked(&mut state);
                None
            } else if state.watch_stream_open {
                if let Some(aggregator) = state.watch_aggregator.as_mut() {
                    aggregator.record_pending_target_request(target_id);
                }
                state.watch_stream.clone()
            } else {
                None
            }
        };

        if let Some(stream) = stream {
            self.send_watch_request(&stream, target_data).await;
        }
        Ok(())
    }

    async fn unlisten(self: &Arc<Self>, target_id: TargetId) -> FirestoreResult<()> {
        let (stream, stop_stream) = {
            let mut state = self.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                return Ok(());
            }
            let stream = if state.watch_stream_open {
                if let Some(aggregator) = state.watch_aggregator.as_mut() {
                    aggregator.record_pending_target_request(target_id);
                }
                state.watch_stream.clone()
            } else {
                None
            };
            let stop_stream = if state.listen_targets.is_empty() {
                state.watch_aggregator = None;
                state.watch_stream_open = false;
                state.watch_stream.take()
            } else {
                None
            };
            if stop_stream.is_some() && state.can_use_network() {
                // Nothing to watch: the backend's silence says nothing about connectivity.
                self.online_state.set(OnlineState::Unknown);
            }
            (stream, stop_stream)
        };

        if let Some(stream) = stream {
            if let Err(err) = stream.unwatch(target_id).await {
                log::debug!(target: "firestore::remote_store", "failed to unwatch target {target_id}: {err}");
            }
        }
        if let Some(stream) = stop_stream {
            stream.stop();
        }
        Ok(())
    }

    /// Sends `addTarget`, attaching the expected document count when the target resumes.
    /// Send failures are left to the stream: the target goes out again on reconnect.
    async fn send_watch_request(&self, stream: &ListenStream<RemoteListenDelegate>, target_data: TargetData) {
        let target_id = target_data.target_id;
        let resuming = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min();
        let request = match self.syncer() {
            Some(syncer) if resuming => {
                let count = syncer.get_remote_keys_for_target(target_id).len();
                target_data.with_expected_count(count as i32)
            }
            _ => target_data,
        };
        if let Err(err) = stream.watch(&request).await {
            log::debug!(target: "firestore::remote_store", "failed to watch target {target_id}: {err}");
        }
    }

    async fn on_watch_stream_open(self: &Arc<Self>) -> FirestoreResult<()> {
        let (stream, targets) = {
            let mut state = self.state.lock().await;
            let Some(stream) = state.watch_stream.clone() else {
                return Ok(());
            };
            let mut aggregator = WatchChangeAggregator::new(self.serializer.database_id().clone());
            for target_id in state.listen_targets.keys() {
                aggregator.record_pending_target_request(*target_id);
            }
            state.watch_aggregator = Some(aggregator);
            state.watch_stream_open = true;
            (stream, state.listen_targets.values().cloned().collect::<Vec<_>>())
        };

        log::debug!(target: "firestore::remote_store", "watch stream open, sending {} targets", targets.len());
        for target_data in targets {
            self.send_watch_request(&stream, target_data).await;
        }
        Ok(())
    }

    async fn on_watch_change(self: &Arc<Self>, change: WatchChange) -> FirestoreResult<()> {
        self.online_state.set(OnlineState::Online);
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };

        if let WatchChange::TargetChange(target_change) = &change {
            if let Some(error) = target_change.cause.clone() {
                return self.handle_target_error(syncer.as_ref(), target_change, error).await;
            }
        }

        let (event, resets, stream) = {
            let mut state = self.state.lock().await;
            let stream = state.watch_stream.clone();
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };

            let snapshot_version = {
                let view = ListenTargetsView {
                    targets: listen_targets,
                    syncer: syncer.as_ref(),
                };
                match change {
                    WatchChange::DocumentChange(document_change) => {
                        aggregator.handle_document_change(&view, document_change);
                        None
                    }
                    WatchChange::ExistenceFilter(filter) => {
                        aggregator.handle_existence_filter(&view, &filter);
                        None
                    }
                    WatchChange::TargetChange(target_change) => {
                        aggregator.handle_target_change(&view, &target_change);
                        global_snapshot_version(&target_change)
                    }
                }
            };

            match snapshot_version {
                Some(version) => {
                    let (event, resets) = Self::raise_watch_snapshot(listen_targets, aggregator, syncer.as_ref(), version);
                    (Some(event), resets, stream)
                }
                None => (None, Vec::new(), stream),
            }
        };

        if let Some(stream) = stream.filter(|stream| stream.is_open()) {
            for target_data in resets {
                log::debug!(
                    target: "firestore::remote_store",
                    "re-listening to target {} after an existence filter mismatch",
                    target_data.target_id
                );
                if let Err(err) = stream.unwatch(target_data.target_id).await {
                    log::debug!(target: "firestore::remote_store", "failed to reset target: {err}");
                }
                self.send_watch_request(&stream, target_data).await;
            }
        }

        match event {
            Some(event) => syncer.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    /// Builds the event for a consistent snapshot and updates the stored resume tokens.
    /// Returns the targets that must be re-listened to from scratch.
    fn raise_watch_snapshot(
        listen_targets: &mut BTreeMap<TargetId, TargetData>,
        aggregator: &mut WatchChangeAggregator,
        syncer: &dyn RemoteSyncer,
        snapshot_version: SnapshotVersion,
    ) -> (RemoteEvent, Vec<TargetData>) {
        let event = {
            let view = ListenTargetsView {
                targets: listen_targets,
                syncer,
            };
            aggregator.create_remote_event(&view, snapshot_version)
        };

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        let mut resets = Vec::new();
        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = listen_targets.get_mut(target_id) else {
                continue;
            };
            // Forget the resume token so the re-listen gets a full result set.
            *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
            // One pending ack for the removal and one for the new add.
            aggregator.record_pending_target_request(*target_id);
            aggregator.record_pending_target_request(*target_id);
            resets.push(TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            ));
        }
        (event, resets)
    }

    async fn handle_target_error(
        &self,
        syncer: &dyn RemoteSyncer,
        change: &WatchTargetChange,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let rejected = {
            let mut state = self.state.lock().await;
            let mut rejected = Vec::new();
            for target_id in &change.target_ids {
                if state.listen_targets.remove(target_id).is_some() {
                    if let Some(aggregator) = state.watch_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                    rejected.push(*target_id);
                }
            }
            rejected
        };

        for target_id in rejected {
            log::debug!(target: "firestore::remote_store", "listen for target {target_id} rejected: {error}");
            syncer.reject_listen(target_id, error.clone()).await?;
        }
        Ok(())
    }

    async fn on_watch_stream_error(&self, error: FirestoreError) {
        let retrying = {
            let mut state = self.state.lock().await;
            if !state.can_use_network() {
                return;
            }
            state.watch_aggregator = None;
            state.watch_stream_open = false;
            state.watch_stream.is_some() && !state.listen_targets.is_empty()
        };
        log::debug!(target: "firestore::remote_store", "watch stream error: {error}");
        if retrying {
            self.online_state.handle_watch_stream_failure(&error);
        } else {
            self.online_state.set(OnlineState::Unknown);
        }
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        loop {
            let last_batch_id = {
                let state = self.state.lock().await;
                if !state.can_use_network() || state.write_pipeline.len() >= self.max_pending_writes {
                    break;
                }
                state.last_batch_id()
            };
            let Some(syncer) = self.syncer() else {
                break;
            };
            match syncer.next_mutation_batch(last_batch_id).await? {
                Some(batch) => self.add_to_write_pipeline(batch).await,
                None => break,
            }
        }

        let mut state = self.state.lock().await;
        if state.should_start_write_stream() {
            self.start_write_stream_locked(&mut state);
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) {
        let _send = self.write_send_lock.lock().await;
        let stream = {
            let mut state = self.state.lock().await;
            state.write_pipeline.push_back(batch.clone());
            if state.write_handshake_complete {
                state.write_stream.clone()
            } else {
                None
            }
        };
        if let Some(stream) = stream {
            if let Err(err) = stream.write_mutations(&batch.mutations).await {
                log::debug!(target: "firestore::remote_store", "failed to send batch {}: {err}", batch.batch_id);
            }
        }
    }

    async fn on_write_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        if let Some(syncer) = self.syncer() {
            syncer.set_last_stream_token(stream_token).await?;
        }

        let _send = self.write_send_lock.lock().await;
        let (stream, batches) = {
            let mut state = self.state.lock().await;
            state.write_handshake_complete = true;
            (state.write_stream.clone(), state.write_pipeline.iter().cloned().collect::<Vec<_>>())
        };
        let Some(stream) = stream else {
            return Ok(());
        };
        log::debug!(target: "firestore::remote_store", "write handshake complete, sending {} batches", batches.len());
        for batch in batches {
            stream.write_mutations(&batch.mutations).await?;
        }
        Ok(())
    }

    async fn on_write_response(self: &Arc<Self>, response: WriteResponse) -> FirestoreResult<()> {
        let batch = self
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("Received a write response with an empty pipeline"))?;

        let result = MutationBatchResult::from(batch, response.commit_version, response.results, response.stream_token)?;
        if let Some(syncer) = self.syncer() {
            syncer.apply_successful_write(result).await?;
        }
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_error(self: &Arc<Self>, error: FirestoreError, handshake_complete: bool) {
        let stream = {
            let mut state = self.state.lock().await;
            state.write_handshake_complete = false;
            if !state.can_use_network() {
                return;
            }
            state.write_stream.clone()
        };
        let Some(stream) = stream else {
            return;
        };

        if !handshake_complete {
            if is_permanent_error(error.code) {
                log::debug!(
                    target: "firestore::remote_store",
                    "write handshake failed permanently, clearing the stream token: {error}"
                );
                stream.set_last_stream_token(Vec::new()).await;
                if let Some(syncer) = self.syncer() {
                    if let Err(err) = syncer.set_last_stream_token(Vec::new()).await {
                        log::warn!(target: "firestore::remote_store", "failed to clear stream token: {err}");
                    }
                }
            }
            return;
        }

        if !is_permanent_write_error(error.code) {
            return;
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return;
        };
        log::debug!(target: "firestore::remote_store", "batch {} rejected: {error}", batch.batch_id);
        // The batch is gone, so reconnect without waiting.
        stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.reject_failed_write(batch.batch_id, error).await {
                log::warn!(target: "firestore::remote_store", "failed to reject batch {}: {err}", batch.batch_id);
            }
        }
        if let Err(err) = self.fill_write_pipeline().await {
            log::warn!(target: "firestore::remote_store", "failed to refill the write pipeline: {err}");
        }
    }
}

/// The read time of a global snapshot, i.e. a consistent point for every active target.
fn global_snapshot_version(change: &WatchTargetChange) -> Option<SnapshotVersion> {
    if !change.is_global_snapshot() {
        return None;
    }
    change.read_time.filter(|version| !version.is_min())
}

struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ListenStreamDelegate for RemoteListenDelegate {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_watch_change(change).await,
            None => Ok(()),
        }
    }

    async fn on_stream_error(&self, error: FirestoreError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_stream_error(error).await;
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_handshake_complete(stream_token).await,
            None => Ok(()),
        }
    }

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.on_write_response(response).await,
            None => Ok(()),
        }
    }

    async fn on_stream_error(&self, error: FirestoreError, handshake_complete: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_stream_error(error, handshake_complete).await;
        }
    }
}

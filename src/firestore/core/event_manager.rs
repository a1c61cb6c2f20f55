use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::core::view::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::online_state_tracker::OnlineState;

/// Identifies one registered query listener.
pub type ListenerId = u64;

/// The component that turns queries into views, i.e. the sync engine.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait QueryEventSource: Send + Sync + 'static {
    /// Starts tracking `query` and returns its first snapshot.
    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot>;
    async fn unlisten(&self, query: Query) -> FirestoreResult<()>;
}

/// Receives view updates from the sync engine.
///
/// Calls happen while the sync engine holds its own lock, so implementations must not block
/// or call back into the sync engine.
pub trait SyncEngineListener: Send + Sync + 'static {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);
    fn on_watch_error(&self, query: &Query, error: FirestoreError);
    fn on_online_state_change(&self, online_state: OnlineState);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots when only metadata (pending writes, `from_cache`) changed.
    pub include_metadata_changes: bool,
    /// Hold back the first cached snapshot while the client may still be online.
    pub wait_for_sync_when_online: bool,
}

/// One application listener: filters view snapshots according to its options and delivers
/// them on a channel.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    sender: Sender<FirestoreResult<ViewSnapshot>>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions) -> (Self, Receiver<FirestoreResult<ViewSnapshot>>) {
        let (sender, receiver) = async_channel::unbounded();
        let listener = Self {
            query,
            options,
            sender,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        };
        (listener, receiver)
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether a snapshot was raised.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let doc_changes = snapshot
                .doc_changes
                .into_iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .collect();
            ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.emit(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&mut self, error: FirestoreError) {
        self.emit(Err(error));
        self.sender.close();
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Raise cached results right away, and an empty result only once we know we are offline.
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.emit(Ok(initial));
    }

    fn emit(&self, event: FirestoreResult<ViewSnapshot>) {
        if self.sender.try_send(event).is_err() {
            log::debug!(target: "firestore::event_manager", "dropping snapshot for a closed listener");
        }
    }
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

struct EventManagerState {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    next_listener_id: ListenerId,
    snapshots_in_sync_listeners: Vec<Sender<()>>,
}

/// Fans view snapshots out to query listeners, sharing one view between listeners of the
/// same query.
pub struct EventManager {
    source: Arc<dyn QueryEventSource>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(source: Arc<dyn QueryEventSource>) -> Self {
        Self {
            source,
            state: Mutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
                next_listener_id: 1,
                snapshots_in_sync_listeners: Vec::new(),
            }),
        }
    }

    /// Registers a listener for `query`. The first listener of a query starts listening in the
    /// sync engine; later ones immediately receive the current view.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
    ) -> FirestoreResult<(ListenerId, Receiver<FirestoreResult<ViewSnapshot>>)> {
        let canonical_id = query.canonical_id();
        let (mut listener, receiver) = QueryListener::new(query.clone(), options);
        let (listener_id, first) = {
            let mut state = self.state.lock().unwrap();
            let listener_id = state.next_listener_id;
            state.next_listener_id += 1;
            let online_state = state.online_state;

            let mut first = false;
            let info = state.queries.entry(canonical_id.clone()).or_insert_with(|| {
                first = true;
                QueryListenersInfo {
                    view_snapshot: None,
                    listeners: Vec::new(),
                }
            });
            listener.apply_online_state_change(online_state);
            let raised = match &info.view_snapshot {
                Some(snapshot) => listener.on_view_snapshot(snapshot.clone()),
                None => false,
            };
            info.listeners.push((listener_id, listener));
            if raised {
                Self::raise_snapshots_in_sync(&mut state);
            }
            (listener_id, first)
        };

        if first {
            match self.source.listen(query.clone()).await {
                Ok(snapshot) => {
                    let still_listening = self.apply_initial_snapshot(&canonical_id, snapshot);
                    if !still_listening {
                        self.source.unlisten(query).await?;
                    }
                }
                Err(error) => {
                    self.fail_query(&canonical_id, error.clone());
                    return Err(error);
                }
            }
        }
        Ok((listener_id, receiver))
    }

    /// Removes a listener. The sync engine stops listening once the last listener is gone.
    pub async fn unlisten(&self, listener_id: ListenerId, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let last = {
            let mut state = self.state.lock().unwrap();
            match state.queries.get_mut(&canonical_id) {
                Some(info) => {
                    info.listeners.retain(|(id, _)| *id != listener_id);
                    if info.listeners.is_empty() {
                        state.queries.remove(&canonical_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            self.source.unlisten(query.clone()).await?;
        }
        Ok(())
    }

    /// Returns a channel that ticks whenever all listeners have seen a consistent set of
    /// snapshots, starting with one tick right away.
    pub fn add_snapshots_in_sync_listener(&self) -> Receiver<()> {
        let (sender, receiver) = async_channel::unbounded();
        let _ = sender.try_send(());
        self.state.lock().unwrap().snapshots_in_sync_listeners.push(sender);
        receiver
    }

    pub fn listener_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .queries
            .values()
            .map(|info| info.listeners.len())
            .sum()
    }

    /// Delivers the snapshot returned by the first listen unless a newer one arrived first.
    /// Returns false when every listener left while the listen was in flight.
    fn apply_initial_snapshot(&self, canonical_id: &str, snapshot: ViewSnapshot) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(info) = state.queries.get_mut(canonical_id) else {
            return false;
        };
        if info.view_snapshot.is_some() {
            return true;
        }
        let mut raised = false;
        for (_, listener) in info.listeners.iter_mut() {
            raised |= listener.on_view_snapshot(snapshot.clone());
        }
        info.view_snapshot = Some(snapshot);
        if raised {
            Self::raise_snapshots_in_sync(&mut state);
        }
        true
    }

    fn fail_query(&self, canonical_id: &str, error: FirestoreError) {
        let info = self.state.lock().unwrap().queries.remove(canonical_id);
        if let Some(mut info) = info {
            for (_, listener) in info.listeners.iter_mut() {
                listener.on_error(error.clone());
            }
        }
    }

    fn raise_snapshots_in_sync(state: &mut EventManagerState) {
        state
            .snapshots_in_sync_listeners
            .retain(|sender| sender.try_send(()).is_ok());
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut state = self.state.lock().unwrap();
        let mut raised = false;
        for snapshot in snapshots {
            let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in info.listeners.iter_mut() {
                raised |= listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
        if raised {
            Self::raise_snapshots_in_sync(&mut state);
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        log::debug!(target: "firestore::event_manager", "listen for {} failed: {error}", query.canonical_id());
        self.fail_query(&query.canonical_id(), error);
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let mut state = self.state.lock().unwrap();
        state.online_state = online_state;
        let mut raised = false;
        for info in state.queries.values_mut() {
            for (_, listener) in info.listeners.iter_mut() {
                raised |= listener.apply_online_state_change(online_state);
            }
        }
        if raised {
            Self::raise_snapshots_in_sync(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::core::view::DocumentViewChange;
    use crate::firestore::error::permission_denied;
    use crate::firestore::test_support::{doc, query};
    use serde_json::json;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingSource {
        listens: Mutex<Vec<String>>,
        unlistens: Mutex<Vec<String>>,
        initial_from_cache: bool,
        fail: bool,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl QueryEventSource for RecordingSource {
        async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
            if self.fail {
                return Err(permission_denied("no access"));
            }
            self.listens.lock().unwrap().push(query.canonical_id());
            Ok(snapshot_with(&query, &["rooms/a"], self.initial_from_cache))
        }

        async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
            self.unlistens.lock().unwrap().push(query.canonical_id());
            Ok(())
        }
    }

    fn snapshot_with(query: &Query, paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut docs = DocumentSet::new(Arc::new(query.clone()));
        for path in paths {
            docs.add(doc(path, 1, json!({})));
        }
        ViewSnapshot::from_initial_documents(query.clone(), docs, BTreeSet::new(), from_cache, false)
    }

    #[tokio::test]
    async fn listeners_share_one_view() {
        let source = Arc::new(RecordingSource::default());
        let manager = EventManager::new(Arc::clone(&source) as Arc<dyn QueryEventSource>);

        let (first_id, first) = manager.listen(query("rooms"), ListenOptions::default()).await.expect("listen");
        let (second_id, second) = manager.listen(query("rooms"), ListenOptions::default()).await.expect("listen");
        assert_eq!(source.listens.lock().unwrap().len(), 1);
        assert_eq!(first.try_recv().expect("snapshot").expect("ok").docs.len(), 1);
        assert_eq!(second.try_recv().expect("snapshot").expect("ok").docs.len(), 1);

        manager.unlisten(first_id, &query("rooms")).await.expect("unlisten");
        assert!(source.unlistens.lock().unwrap().is_empty());
        manager.unlisten(second_id, &query("rooms")).await.expect("unlisten");
        assert_eq!(source.unlistens.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metadata_only_changes_are_filtered() {
        let source = Arc::new(RecordingSource::default());
        let manager = EventManager::new(Arc::clone(&source) as Arc<dyn QueryEventSource>);
        let (_, plain) = manager.listen(query("rooms"), ListenOptions::default()).await.expect("listen");
        let (_, verbose) = manager
            .listen(
                query("rooms"),
                ListenOptions {
                    include_metadata_changes: true,
                    ..ListenOptions::default()
                },
            )
            .await
            .expect("listen");
        plain.try_recv().expect("initial").expect("ok");
        verbose.try_recv().expect("initial").expect("ok");

        let mut update = snapshot_with(&query("rooms"), &["rooms/a"], false);
        update.doc_changes = vec![DocumentViewChange {
            change_type: ChangeType::Metadata,
            doc: doc("rooms/a", 1, json!({})),
        }];
        update.sync_state_changed = false;
        manager.on_watch_change(vec![update]);

        assert!(plain.try_recv().is_err());
        let snapshot = verbose.try_recv().expect("metadata snapshot").expect("ok");
        assert_eq!(snapshot.doc_changes.len(), 1);
    }

    #[tokio::test]
    async fn empty_cached_result_waits_for_offline() {
        let source = Arc::new(RecordingSource {
            initial_from_cache: true,
            ..RecordingSource::default()
        });
        let manager = EventManager::new(Arc::clone(&source) as Arc<dyn QueryEventSource>);
        let (_, receiver) = manager
            .listen(
                query("rooms"),
                ListenOptions {
                    wait_for_sync_when_online: true,
                    ..ListenOptions::default()
                },
            )
            .await
            .expect("listen");
        assert!(receiver.try_recv().is_err());

        manager.on_online_state_change(OnlineState::Offline);
        let snapshot = receiver.try_recv().expect("raised when offline").expect("ok");
        assert!(snapshot.from_cache);
    }

    #[tokio::test]
    async fn listen_failure_reaches_listener() {
        let source = Arc::new(RecordingSource {
            fail: true,
            ..RecordingSource::default()
        });
        let manager = EventManager::new(Arc::clone(&source) as Arc<dyn QueryEventSource>);
        let error = manager
            .listen(query("rooms"), ListenOptions::default())
            .await
            .err()
            .expect("listen fails");
        assert_eq!(error.code, crate::firestore::error::FirestoreErrorCode::PermissionDenied);
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test]
    async fn snapshots_in_sync_ticks_after_raise() {
        let source = Arc::new(RecordingSource::default());
        let manager = EventManager::new(Arc::clone(&source) as Arc<dyn QueryEventSource>);
        let ticks = manager.add_snapshots_in_sync_listener();
        assert!(ticks.try_recv().is_ok());
        manager.listen(query("rooms"), ListenOptions::default()).await.expect("listen");
        assert!(ticks.try_recv().is_ok());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_channel::Receiver;

use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, ListenerId, QueryEventSource, SyncEngineListener,
};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{LoadedBundle, PendingWrite, PendingWritesWaiter, SyncEngine};
use crate::firestore::core::user::User;
use crate::firestore::core::view::{View, ViewSnapshot};
use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::index_manager::IndexBackfillScheduler;
use crate::firestore::local::lru_garbage_collector::LruScheduler;
use crate::firestore::local::{FieldIndexDefinition, LocalStore, Persistence};
use crate::firestore::model::{Document, DocumentKey, Mutation};
use crate::firestore::remote::datastore::{StreamingDatastore, TokenProviderArc};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::FirestoreSettings;
use crate::platform::runtime;

/// Collaborators a [`FirestoreClient`] is assembled from.
pub struct FirestoreClientBuilder {
    settings: FirestoreSettings,
    datastore: Arc<dyn StreamingDatastore>,
    auth_provider: TokenProviderArc,
    app_check_provider: Option<TokenProviderArc>,
    persistence: Option<Arc<Persistence>>,
}

impl FirestoreClientBuilder {
    pub fn new(settings: FirestoreSettings, datastore: Arc<dyn StreamingDatastore>, auth_provider: TokenProviderArc) -> Self {
        Self {
            settings,
            datastore,
            auth_provider,
            app_check_provider: None,
            persistence: None,
        }
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = Some(provider);
        self
    }

    /// Attaches to storage opened elsewhere, e.g. a database shared with another client.
    pub fn with_persistence(mut self, persistence: Arc<Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Opens storage, starts the local store and connects the remote store.
    pub async fn build(self) -> FirestoreResult<Arc<FirestoreClient>> {
        self.settings.validate()?;
        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => Persistence::open(&self.settings)?,
        };
        let is_primary = persistence.start().await?;

        // Auth providers report the current user as soon as a listener is registered.
        let (user_sender, user_changes) = async_channel::unbounded::<User>();
        self.auth_provider.add_user_listener(Arc::new(move |user| {
            let _ = user_sender.try_send(user);
        }));
        let initial_user = user_changes.try_recv().unwrap_or_else(|_| User::unauthenticated());

        let local_store = LocalStore::new(Arc::clone(&persistence), self.settings.clone(), initial_user.clone());
        local_store.start().await?;

        let mut network = NetworkLayer::builder(self.datastore, self.auth_provider)
            .with_backoff(self.settings.stream_backoff);
        if let Some(provider) = self.app_check_provider {
            network = network.with_app_check_provider(provider);
        }
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            network.build(),
            JsonProtoSerializer::new(self.settings.database_id.clone()),
            &self.settings,
            initial_user,
        );
        let event_manager = Arc::new(EventManager::new(
            Arc::clone(&sync_engine) as Arc<dyn QueryEventSource>
        ));
        sync_engine.set_listener(Arc::downgrade(&event_manager) as Weak<dyn SyncEngineListener>);

        let client = Arc::new(FirestoreClient {
            settings: self.settings.clone(),
            local_store: Arc::clone(&local_store),
            sync_engine,
            event_manager,
            lru_scheduler: LruScheduler::new(self.settings.gc_initial_delay, self.settings.gc_regular_delay),
            index_backfill_scheduler: IndexBackfillScheduler::new(
                self.settings.index_backfill_initial_delay,
                self.settings.index_backfill_regular_delay,
            ),
            terminated: Arc::new(AtomicBool::new(false)),
        });

        client.remote_store_apply_primary_state(is_primary).await?;
        client.sync_engine.remote_store().start().await?;
        client.lru_scheduler.start(Arc::downgrade(&local_store));
        client.index_backfill_scheduler.start(Arc::downgrade(&local_store));
        client.spawn_user_change_loop(user_changes);
        client.spawn_lease_loop();
        client.spawn_shared_change_loop();
        log::debug!(
            target: "firestore::client",
            "client {} started as {}",
            persistence.client_id(),
            if is_primary { "primary" } else { "secondary" }
        );
        Ok(client)
    }
}

/// Receives the snapshots of one query listen. Dropping it stops the listen.
pub struct ListenerRegistration {
    id: ListenerId,
    query: Query,
    receiver: Receiver<FirestoreResult<ViewSnapshot>>,
    event_manager: Weak<EventManager>,
    removed: bool,
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Waits for the next snapshot. `None` once the listen ended; an error is always the
    /// last item.
    pub async fn next(&self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.recv().await.ok()
    }

    /// Snapshot already delivered and not yet consumed, if any.
    pub fn try_next(&self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.try_recv().ok()
    }

    pub async fn remove(mut self) -> FirestoreResult<()> {
        self.removed = true;
        match self.event_manager.upgrade() {
            Some(event_manager) => event_manager.unlisten(self.id, &self.query).await,
            None => Ok(()),
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let Some(event_manager) = self.event_manager.upgrade() else {
            return;
        };
        let id = self.id;
        let query = self.query.clone();
        runtime::spawn_detached(async move {
            if let Err(err) = event_manager.unlisten(id, &query).await {
                log::warn!(target: "firestore::client", "failed to stop listen {id}: {err}");
            }
        });
    }
}

/// Entry point of the engine: owns every component and exposes the listen, write and
/// network controls applications use.
pub struct FirestoreClient {
    settings: FirestoreSettings,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lru_scheduler: LruScheduler,
    index_backfill_scheduler: IndexBackfillScheduler,
    terminated: Arc<AtomicBool>,
}

impl FirestoreClient {
    pub fn builder(
        settings: FirestoreSettings,
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
    ) -> FirestoreClientBuilder {
        FirestoreClientBuilder::new(settings, datastore, auth_provider)
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            Err(failed_precondition("The client has already been terminated."))
        } else {
            Ok(())
        }
    }

    pub async fn listen(&self, query: Query, options: ListenOptions) -> FirestoreResult<ListenerRegistration> {
        self.verify_not_terminated()?;
        let (id, receiver) = self.event_manager.listen(query.clone(), options).await?;
        Ok(ListenerRegistration {
            id,
            query,
            receiver,
            event_manager: Arc::downgrade(&self.event_manager),
            removed: false,
        })
    }

    /// Queues `mutations` as one atomic batch. The returned handle settles when the backend
    /// accepts or rejects it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        self.verify_not_terminated()?;
        self.sync_engine.write(mutations).await
    }

    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<PendingWritesWaiter> {
        self.verify_not_terminated()?;
        self.sync_engine.wait_for_pending_writes().await
    }

    /// The cached document, including pending local writes.
    pub async fn get_document_from_local_cache(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        self.verify_not_terminated()?;
        self.local_store.read_document(key).await
    }

    /// Runs `query` against the cache only and returns the result as a one-off snapshot.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        let result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query, result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None);
        let view_change = view.apply_changes(changes, false, None, false);
        Ok(view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    pub async fn load_bundle(&self, bundle: LoadedBundle) -> FirestoreResult<bool> {
        self.verify_not_terminated()?;
        self.sync_engine.load_bundle(bundle).await
    }

    pub async fn configure_field_indexes(&self, definitions: &[FieldIndexDefinition]) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        self.local_store.configure_field_indexes(definitions).await.map(|_| ())
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        self.local_store.set_index_auto_creation_enabled(enabled).await;
        Ok(())
    }

    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        self.local_store.delete_all_field_indexes().await
    }

    /// Ticks once now and again every time all active listeners have caught up.
    pub fn snapshots_in_sync(&self) -> Receiver<()> {
        self.event_manager.add_snapshots_in_sync_listener()
    }

    pub fn online_state(&self) -> OnlineState {
        self.sync_engine.remote_store().online_state()
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        self.sync_engine.remote_store().enable_network().await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        self.sync_engine.remote_store().disable_network().await;
        Ok(())
    }

    /// Stops the streams and background tasks and gives up the primary lease. Later calls
    /// fail with `FailedPrecondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!(target: "firestore::client", "terminating");
        self.lru_scheduler.stop();
        self.index_backfill_scheduler.stop();
        self.sync_engine.remote_store().shutdown().await;
        self.local_store.persistence().release_lease().await
    }

    async fn remote_store_apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        self.sync_engine.remote_store().apply_primary_state(is_primary).await
    }

    fn spawn_user_change_loop(self: &Arc<Self>, user_changes: Receiver<User>) {
        let client = Arc::downgrade(self);
        runtime::spawn_detached(async move {
            while let Ok(user) = user_changes.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                if client.is_terminated() {
                    break;
                }
                if let Err(err) = client
                    .sync_engine
                    .remote_store()
                    .handle_credential_change(user)
                    .await
                {
                    log::warn!(target: "firestore::client", "failed to switch user: {err}");
                }
            }
        });
    }

    /// Renews the primary lease and hands the network to whichever client holds it.
    fn spawn_lease_loop(self: &Arc<Self>) {
        let client = Arc::downgrade(self);
        let interval = self.settings.primary_lease_refresh_interval;
        let terminated = Arc::clone(&self.terminated);
        runtime::spawn_detached(async move {
            loop {
                runtime::sleep(interval).await;
                if terminated.load(Ordering::SeqCst) {
                    break;
                }
                let Some(client) = client.upgrade() else {
                    break;
                };
                let result = match client.local_store.persistence().refresh_lease().await {
                    Ok(is_primary) => client.remote_store_apply_primary_state(is_primary).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    log::warn!(target: "firestore::client", "failed to refresh the primary lease: {err}");
                }
            }
        });
    }

    /// Follows commits made by other clients sharing the database. The primary picks up
    /// their queued writes; secondaries fold new remote documents into their views.
    fn spawn_shared_change_loop(self: &Arc<Self>) {
        let changes = self.local_store.persistence().subscribe_changes();
        let own_id = self.local_store.persistence().client_id().to_string();
        let client = Arc::downgrade(self);
        runtime::spawn_detached(async move {
            while let Ok(change) = changes.recv().await {
                if change.origin == own_id {
                    continue;
                }
                let Some(client) = client.upgrade() else {
                    break;
                };
                if client.is_terminated() {
                    break;
                }
                let result = if client.local_store.is_primary() {
                    client.sync_engine.remote_store().fill_write_pipeline().await
                } else {
                    client.sync_engine.synchronize_with_changed_documents().await
                };
                if let Err(err) = result {
                    log::warn!(target: "firestore::client", "failed to apply changes from client {}: {err}", change.origin);
                }
            }
        });
    }
}

impl Drop for FirestoreClient {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::local::simple_db::SimpleDb;
    use crate::firestore::local::schema::{LocalSchema, SCHEMA_VERSION};
    use crate::firestore::remote::datastore::{NoopTokenProvider, StaticTokenProvider};
    use crate::firestore::test_support::{
        document_frame, fast_backoff, global_snapshot, key, loopback_datastore as loopback, next_json, query,
        send_json, set_mutation, target_added, target_current, test_settings,
    };
    use serde_json::json;
    use std::time::Duration;

    fn settings() -> FirestoreSettings {
        test_settings().with_stream_backoff(fast_backoff())
    }

    #[tokio::test]
    async fn local_write_reaches_listener_before_backend() {
        let (datastore, _server) = loopback();
        let client = FirestoreClient::builder(settings(), datastore, Arc::new(NoopTokenProvider) as TokenProviderArc)
            .build()
            .await
            .expect("client");

        let registration = client
            .listen(query("rooms"), ListenOptions::default())
            .await
            .expect("listen");
        client
            .write(vec![set_mutation("rooms/a", json!({ "n": 1 }))])
            .await
            .expect("write");

        let mut latest = None;
        for _ in 0..2 {
            let snapshot = registration.next().await.expect("snapshot").expect("no error");
            let done = snapshot.docs.contains(&key("rooms/a"));
            latest = Some(snapshot);
            if done {
                break;
            }
        }
        let snapshot = latest.expect("snapshot");
        assert!(snapshot.docs.contains(&key("rooms/a")));
        assert!(snapshot.has_pending_writes());

        let cached = client
            .get_document_from_local_cache(&key("rooms/a"))
            .await
            .expect("cached");
        assert!(cached.has_local_mutations());
        let local = client
            .get_documents_from_local_cache(query("rooms"))
            .await
            .expect("local query");
        assert_eq!(local.docs.len(), 1);
        assert!(local.from_cache);
    }

    #[tokio::test]
    async fn listen_delivers_backend_snapshot() {
        let (datastore, server) = loopback();
        let client = FirestoreClient::builder(settings(), datastore, Arc::new(NoopTokenProvider) as TokenProviderArc)
            .build()
            .await
            .expect("client");
        let registration = client
            .listen(query("rooms"), ListenOptions::default())
            .await
            .expect("listen");

        let (_, watch) = server.accept().await.expect("watch stream");
        let request = next_json(&watch).await;
        let target_id = request["addTarget"]["targetId"].as_i64().expect("target id") as i32;
        send_json(&watch, target_added(&[target_id])).await;
        send_json(
            &watch,
            document_frame("rooms/a", 3, json!({ "n": 1 }), &[target_id]),
        )
        .await;
        send_json(&watch, target_current(&[target_id], "AQ==")).await;
        send_json(&watch, global_snapshot(4)).await;

        let snapshot = loop {
            let snapshot = registration.next().await.expect("snapshot").expect("no error");
            if !snapshot.from_cache {
                break snapshot;
            }
        };
        assert_eq!(snapshot.docs.len(), 1);
        assert_eq!(client.online_state(), OnlineState::Online);
    }

    #[tokio::test]
    async fn user_change_cancels_pending_write() {
        let (datastore, _server) = loopback();
        let auth = Arc::new(StaticTokenProvider::new(User::unauthenticated(), None));
        let client = FirestoreClient::builder(settings(), datastore, Arc::clone(&auth) as TokenProviderArc)
            .build()
            .await
            .expect("client");
        let pending = client
            .write(vec![set_mutation("rooms/a", json!({ "n": 1 }))])
            .await
            .expect("write");

        auth.set_user(User::authenticated("alice"), Some("token".to_string()));
        let err = pending.wait().await.expect_err("cancelled");
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        assert_eq!(client.sync_engine().current_user().await, User::authenticated("alice"));
    }

    #[tokio::test]
    async fn only_the_lease_holder_is_primary() {
        let db = Arc::new(SimpleDb::open_in_memory("shared", SCHEMA_VERSION, &LocalSchema).expect("db"));
        let lease = Duration::from_secs(5);
        let (first_store, _first_server) = loopback();
        let (second_store, _second_server) = loopback();
        let first = FirestoreClient::builder(settings(), first_store, Arc::new(NoopTokenProvider) as TokenProviderArc)
            .with_persistence(Persistence::with_database(Arc::clone(&db), "first", lease))
            .build()
            .await
            .expect("first client");
        let second = FirestoreClient::builder(settings(), second_store, Arc::new(NoopTokenProvider) as TokenProviderArc)
            .with_persistence(Persistence::with_database(Arc::clone(&db), "second", lease))
            .build()
            .await
            .expect("second client");

        assert!(first.local_store().is_primary());
        assert!(!second.local_store().is_primary());
        assert!(!second.sync_engine().remote_store().can_use_network().await);

        first.terminate().await.expect("terminate");
        let is_primary = second
            .local_store()
            .persistence()
            .refresh_lease()
            .await
            .expect("refresh");
        assert!(is_primary);
    }

    #[tokio::test]
    async fn terminated_client_rejects_calls() {
        let (datastore, _server) = loopback();
        let client = FirestoreClient::builder(settings(), datastore, Arc::new(NoopTokenProvider) as TokenProviderArc)
            .build()
            .await
            .expect("client");
        client.terminate().await.expect("terminate");
        let err = client
            .write(vec![set_mutation("rooms/a", json!({ "n": 1 }))])
            .await
            .expect_err("terminated");
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        client.terminate().await.expect("second terminate is a no-op");
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::target::TargetData;
use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::model::TargetId;
use crate::firestore::remote::datastore::StreamHandle;
use crate::firestore::remote::network::{NetworkLayer, StreamHandler, StreamCredentials};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStreamHandle, StreamState};
use crate::firestore::remote::watch_change::{decode_watch_change, WatchChange};

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    /// The stream (re)connected; every active target must be sent again.
    async fn on_open(&self) -> FirestoreResult<()>;
    async fn on_watch_change(&self, change: WatchChange) -> FirestoreResult<()>;
    async fn on_stream_error(&self, error: FirestoreError);
}

/// The watch stream: sends `addTarget` / `removeTarget` requests and decodes watch changes.
pub struct ListenStream<D>
where
    D: ListenStreamDelegate,
{
    handler: Arc<ListenStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> ListenStream<D>
where
    D: ListenStreamDelegate,
{
    pub fn new(layer: NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let handler = Arc::new(ListenStreamHandler::new(serializer, delegate));
        let handle = layer.listen(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        self.handler.watch(target_data).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.handler.unwatch(target_id).await
    }

    /// Whether requests sent now reach the backend.
    pub fn is_open(&self) -> bool {
        self.handler.open.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    pub fn stop(&self) {
        self.handler.stop();
        self.handle.stop();
    }
}

struct ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    serializer: JsonProtoSerializer,
    delegate: Arc<D>,
    stream: Mutex<Option<Arc<dyn StreamHandle>>>,
    open: AtomicBool,
    running: AtomicBool,
}

impl<D> ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn new(serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        Self {
            serializer,
            delegate,
            stream: Mutex::new(None),
            open: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = self.encode_watch_request(target_data)?;
        log::debug!(target: "firestore::watch", "watching target {}", target_data.target_id);
        self.send(request).await
    }

    async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        let request = json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        });
        log::debug!(target: "firestore::watch", "unwatching target {target_id}");
        self.send(request).await
    }

    async fn send(&self, request: JsonValue) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode listen request: {err}")))?;
        let stream = self.stream.lock().await.clone();
        match stream {
            Some(stream) => stream.send(bytes).await,
            None => Err(unavailable("Listen stream is not open")),
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn encode_watch_request(&self, target_data: &TargetData) -> FirestoreResult<JsonValue> {
        let mut request = serde_json::Map::new();
        request.insert("database".to_string(), json!(self.serializer.database_name()));
        request.insert("addTarget".to_string(), self.serializer.encode_target(target_data)?);
        if let Some(labels) = self.serializer.encode_listen_labels(target_data.purpose) {
            request.insert("labels".to_string(), json!(labels));
        }
        Ok(JsonValue::Object(request))
    }

    async fn clear_stream(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.stream.lock().await.take();
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<D> StreamHandler for ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn label(&self) -> &'static str {
        "listen"
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, _credentials: StreamCredentials) -> FirestoreResult<()> {
        *self.stream.lock().await = Some(stream);
        self.open.store(true, Ordering::SeqCst);
        self.delegate.on_open().await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("Failed to decode listen response: {err}")))?;
        match decode_watch_change(&self.serializer, &value)? {
            Some(change) => self.delegate.on_watch_change(change).await,
            None => {
                log::debug!(target: "firestore::watch", "ignoring unrecognised listen response");
                Ok(())
            }
        }
    }

    async fn on_close(&self) {
        self.clear_stream().await;
    }

    async fn on_error(&self, error: FirestoreError) {
        self.clear_stream().await;
        self.delegate.on_stream_error(error).await;
    }
}

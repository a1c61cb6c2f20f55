use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, invalid_argument, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::datastore::StreamHandle;
use crate::firestore::remote::network::{NetworkLayer, StreamHandler, StreamCredentials};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStreamHandle, StreamState};

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The handshake response arrived; mutations may be sent from now on.
    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()>;
    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()>;
    /// `handshake_complete` tells whether the failure happened after the handshake.
    async fn on_stream_error(&self, error: FirestoreError, handshake_complete: bool);
}

/// The write stream: a handshake, then one request per mutation batch, each carrying the
/// latest stream token.
pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    handler: Arc<WriteStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
{
    pub fn new(layer: NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let handler = Arc::new(WriteStreamHandler::new(serializer, delegate));
        let handle = layer.write(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        self.handler.write_mutations(mutations).await
    }

    pub fn is_open(&self) -> bool {
        self.handler.open.load(Ordering::SeqCst)
    }

    pub async fn handshake_complete(&self) -> bool {
        self.handler.state.lock().await.handshake_complete
    }

    pub async fn last_stream_token(&self) -> Vec<u8> {
        self.handler.state.lock().await.last_stream_token.clone()
    }

    /// Replaces the stream token, e.g. clearing it after the backend rejected it.
    pub async fn set_last_stream_token(&self, token: Vec<u8>) {
        self.handler.state.lock().await.last_stream_token = token;
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }

    /// Reconnects without waiting for the backoff delay.
    pub fn inhibit_backoff(&self) {
        self.handle.inhibit_backoff();
    }

    pub fn stop(&self) {
        self.handler.stop();
        self.handle.stop();
    }
}

struct WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    serializer: JsonProtoSerializer,
    delegate: Arc<D>,
    state: Mutex<WriteStreamState>,
    open: AtomicBool,
    running: AtomicBool,
}

#[derive(Default)]
struct WriteStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl<D> WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn new(serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        Self {
            serializer,
            delegate,
            state: Mutex::new(WriteStreamState::default()),
            open: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let (stream, stream_token) = {
            let guard = self.state.lock().await;
            if !guard.handshake_complete {
                return Err(invalid_argument("Cannot write mutations before the handshake completes"));
            }
            let stream = guard
                .stream
                .clone()
                .ok_or_else(|| unavailable("Write stream is not open"))?;
            (stream, guard.last_stream_token.clone())
        };

        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "database": self.serializer.database_name(),
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": writes,
        });
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode write request: {err}")))?;
        stream.send(bytes).await
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    async fn send_handshake(&self, stream: Arc<dyn StreamHandle>) -> FirestoreResult<()> {
        let request = json!({ "database": self.serializer.database_name() });
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode handshake: {err}")))?;
        stream.send(bytes).await
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<D> StreamHandler for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn label(&self) -> &'static str {
        "write"
    }

    fn should_continue(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, _credentials: StreamCredentials) -> FirestoreResult<()> {
        {
            let mut guard = self.state.lock().await;
            guard.stream = Some(Arc::clone(&stream));
            guard.handshake_complete = false;
        }
        self.open.store(true, Ordering::SeqCst);
        self.send_handshake(stream).await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("Failed to decode write response: {err}")))?;
        let stream_token = decode_stream_token(&value)?;

        let was_handshake = {
            let mut guard = self.state.lock().await;
            guard.last_stream_token = stream_token.clone();
            let was_handshake = !guard.handshake_complete;
            guard.handshake_complete = true;
            was_handshake
        };

        if was_handshake {
            // The handshake response carries no results.
            self.delegate.on_handshake_complete(stream_token).await
        } else {
            let response = decode_write_response(&self.serializer, &value, stream_token)?;
            self.delegate.on_write_response(response).await
        }
    }

    async fn on_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut guard = self.state.lock().await;
        guard.stream = None;
        guard.handshake_complete = false;
    }

    async fn on_error(&self, error: FirestoreError) {
        self.open.store(false, Ordering::SeqCst);
        let handshake_complete = {
            let mut guard = self.state.lock().await;
            guard.stream = None;
            std::mem::replace(&mut guard.handshake_complete, false)
        };
        self.delegate.on_stream_error(error, handshake_complete).await;
    }
}

/// One acknowledged batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub results: Vec<MutationResult>,
}

fn decode_stream_token(value: &JsonValue) -> FirestoreResult<Vec<u8>> {
    let token = value
        .get("streamToken")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| internal_error("write response missing streamToken"))?;
    BASE64_STANDARD
        .decode(token)
        .map_err(|err| internal_error(format!("Invalid streamToken: {err}")))
}

fn decode_write_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    stream_token: Vec<u8>,
) -> FirestoreResult<WriteResponse> {
    let commit_version = value
        .get("commitTime")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| internal_error("write response missing commitTime"))
        .and_then(|timestamp| serializer.decode_version(timestamp))?;

    let results = value
        .get("writeResults")
        .and_then(JsonValue::as_array)
        .map(|results| {
            results
                .iter()
                .map(|entry| serializer.decode_write_result(entry, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(WriteResponse {
        stream_token,
        commit_version,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::datastore::{NoopTokenProvider, StreamingDatastore, StreamingDatastoreImpl, TokenProviderArc};
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::test_support::{delete_mutation, set_mutation, version};
    use crate::firestore::value::FirestoreValue;
    use crate::platform::runtime;
    use std::time::Duration;

    #[derive(Default)]
    struct TestDelegate {
        handshakes: std::sync::Mutex<Vec<Vec<u8>>>,
        responses: std::sync::Mutex<Vec<WriteResponse>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl WriteStreamDelegate for TestDelegate {
        async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
            self.handshakes.lock().unwrap().push(stream_token);
            Ok(())
        }

        async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
            self.responses.lock().unwrap().push(response);
            Ok(())
        }

        async fn on_stream_error(&self, _error: FirestoreError, _handshake_complete: bool) {}
    }

    async fn spin_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..50 {
            if condition() {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn write_stream_sends_handshake_and_mutations() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(left_transport));
        let server = MultiplexedConnection::new(right_transport);
        let datastore = Arc::new(StreamingDatastoreImpl::new(client)) as Arc<dyn StreamingDatastore>;
        let layer = NetworkLayer::builder(datastore, Arc::new(NoopTokenProvider) as TokenProviderArc).build();
        let delegate = Arc::new(TestDelegate::default());
        let write_stream = WriteStream::new(
            layer,
            JsonProtoSerializer::new(DatabaseId::default("project")),
            Arc::clone(&delegate),
        );

        let (_, peer) = server.accept().await.expect("peer stream");
        let handshake = peer.next().await.expect("handshake frame").expect("payload");
        let request: JsonValue = serde_json::from_slice(&handshake).expect("json");
        assert_eq!(request, json!({ "database": "projects/project/databases/(default)" }));

        // Writing before the handshake response is refused.
        assert!(write_stream.write_mutations(&[delete_mutation("rooms/a")]).await.is_err());

        let handshake_response = json!({ "streamToken": BASE64_STANDARD.encode([1u8, 2, 3]) });
        peer.send(serde_json::to_vec(&handshake_response).unwrap()).await.expect("send");
        spin_until(|| !delegate.handshakes.lock().unwrap().is_empty()).await;
        assert_eq!(delegate.handshakes.lock().unwrap()[0], vec![1, 2, 3]);
        assert!(write_stream.handshake_complete().await);

        write_stream
            .write_mutations(&[set_mutation("rooms/a", serde_json::json!({"n": 1})), delete_mutation("rooms/b")])
            .await
            .expect("write mutations");
        let write_request = peer.next().await.expect("write frame").expect("payload");
        let request: JsonValue = serde_json::from_slice(&write_request).expect("json");
        assert_eq!(request["streamToken"], json!("AQID"));
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(2));

        let write_response = json!({
            "streamToken": BASE64_STANDARD.encode([4u8, 5, 6]),
            "commitTime": "1970-01-01T00:00:07Z",
            "writeResults": [
                { "updateTime": "1970-01-01T00:00:07Z", "transformResults": [{ "stringValue": "ok" }] },
                {}
            ]
        });
        peer.send(serde_json::to_vec(&write_response).unwrap()).await.expect("send");
        spin_until(|| !delegate.responses.lock().unwrap().is_empty()).await;

        let responses = delegate.responses.lock().unwrap();
        let response = &responses[0];
        assert_eq!(response.stream_token, vec![4, 5, 6]);
        assert_eq!(response.commit_version, version(7));
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].transform_results, vec![FirestoreValue::from_string("ok")]);
        assert_eq!(response.results[1].version, version(7));
        drop(responses);

        assert_eq!(write_stream.last_stream_token().await, vec![4, 5, 6]);
        write_stream.stop();
    }
}

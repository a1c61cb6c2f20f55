#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use firestore_sync::firestore::remote::datastore::{NoopTokenProvider, TokenProviderArc};
use firestore_sync::firestore::remote::{MultiplexedConnection, MultiplexedStream};
use firestore_sync::firestore::test_support::{fast_backoff, loopback_datastore, next_json, send_json, test_settings};
use firestore_sync::{FirestoreClient, FirestoreSettings};
use serde_json::{json, Value};

/// Plays the server side of the loopback connection. Streams the client opens are handed out by
/// channel, so a test can wait for the write stream while the watch stream is parked.
pub struct Backend {
    connection: MultiplexedConnection,
    parked: Mutex<Vec<(String, MultiplexedStream)>>,
}

impl Backend {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Next stream opened on the channel ending with `suffix` (`"/Listen"` or `"/Write"`).
    pub async fn stream(&self, suffix: &str) -> MultiplexedStream {
        {
            let mut parked = self.parked.lock().unwrap();
            if let Some(position) = parked.iter().position(|(channel, _)| channel.ends_with(suffix)) {
                return parked.remove(position).1;
            }
        }
        loop {
            let (channel, stream) = self.connection.accept().await.expect("client opened a stream");
            let channel = channel.to_string();
            if channel.ends_with(suffix) {
                return stream;
            }
            self.parked.lock().unwrap().push((channel, stream));
        }
    }

    /// Accepts the write stream and completes its handshake.
    pub async fn write_stream(&self) -> MultiplexedStream {
        let write = self.stream("/Write").await;
        let handshake = next_json(&write).await;
        assert!(handshake.get("writes").is_none(), "expected a handshake, got {handshake}");
        send_json(&write, json!({ "streamToken": "AQ==" })).await;
        write
    }

    /// Accepts the watch stream and returns it with the first target it asked for.
    pub async fn watch_stream(&self) -> (MultiplexedStream, i32) {
        let watch = self.stream("/Listen").await;
        let request = next_json(&watch).await;
        (watch, added_target_id(&request))
    }
}

pub fn added_target_id(request: &Value) -> i32 {
    request["addTarget"]["targetId"]
        .as_i64()
        .unwrap_or_else(|| panic!("expected addTarget, got {request}")) as i32
}

/// Write response acknowledging `count` writes at `seconds`.
pub fn write_ack(count: usize, seconds: u32) -> Value {
    let time = format!("1970-01-01T00:00:{seconds:02}Z");
    json!({
        "streamToken": "Ag==",
        "commitTime": time,
        "writeResults": (0..count).map(|_| json!({ "updateTime": time })).collect::<Vec<_>>()
    })
}

pub fn settings() -> FirestoreSettings {
    test_settings().with_stream_backoff(fast_backoff())
}

pub async fn start_client() -> (Arc<FirestoreClient>, Backend) {
    start_client_with(settings()).await
}

pub async fn start_client_with(settings: FirestoreSettings) -> (Arc<FirestoreClient>, Backend) {
    let (datastore, connection) = loopback_datastore();
    let client = FirestoreClient::builder(settings, datastore, Arc::new(NoopTokenProvider) as TokenProviderArc)
        .build()
        .await
        .expect("client starts");
    (client, Backend::new(connection))
}

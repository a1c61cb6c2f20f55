use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub mod persistent;

pub use persistent::{PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind, StreamState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    /// Opens a stream on the named channel.
    Open(String),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, channel: impl Into<String>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(channel.into()),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Moves frames between the two ends of a connection.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Carries any number of logical streams over one [`StreamTransport`].
///
/// Streams opened locally use [`open_stream`](Self::open_stream); streams opened by the peer
/// are handed out by [`accept`](Self::accept) together with their channel label.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    accepted: Receiver<(String, MultiplexedStream)>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));
        let manager = Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams: Arc::clone(&streams),
            accepted: accepted_rx,
        };

        start_outbound_loop(Arc::clone(&transport), outbound_rx);
        start_inbound_loop(transport, manager.clone_handle(), accepted_tx);
        manager
    }

    pub async fn open_stream(&self, channel: &str) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let inbound_rx = self.clone_handle().register(stream_id);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, channel))
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone_handle(),
        })
    }

    /// Waits for the next stream opened by the peer. `None` once the transport is gone.
    pub async fn accept(&self) -> Option<(String, MultiplexedStream)> {
        self.accepted.recv().await.ok()
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
    runtime::spawn_detached(async move {
        while let Ok(frame) = outbound_rx.recv().await {
            if let Err(err) = transport.send(frame).await {
                log::warn!(target: "firestore::transport", "multiplexed outbound loop terminated: {err}");
                break;
            }
        }
    });
}

fn start_inbound_loop(
    transport: Arc<dyn StreamTransport>,
    handle: MultiplexedConnectionHandle,
    accepted_tx: Sender<(String, MultiplexedStream)>,
) {
    runtime::spawn_detached(async move {
        loop {
            let frame = match transport.next().await {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!(target: "firestore::transport", "multiplexed inbound loop terminated: {err}");
                    handle.fail_all(unavailable(format!("connection lost: {}", err.message())));
                    break;
                }
            };
            let stream_id = frame.stream_id();
            let event = frame.kind().clone();
            let maybe_sender = {
                let guard = handle.streams.lock().unwrap();
                guard.get(&stream_id).cloned()
            };

            match (maybe_sender, event) {
                (None, FrameKind::Open(channel)) => {
                    let inbound = handle.register(stream_id);
                    let stream = MultiplexedStream {
                        id: stream_id,
                        outbound: handle.outbound_tx.clone(),
                        inbound,
                        manager: handle.clone(),
                    };
                    if accepted_tx.send((channel, stream)).await.is_err() {
                        log::debug!(target: "firestore::transport", "nobody accepts streams; closing {}", stream_id.value());
                    }
                }
                (Some(_), FrameKind::Open(channel)) => {
                    log::warn!(
                        target: "firestore::transport",
                        "ignoring open of {channel} on stream {} which is already in use",
                        stream_id.value()
                    );
                }
                (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                    let _ = sender.send(event).await;
                    handle.streams.lock().unwrap().remove(&stream_id);
                }
                (Some(sender), event) => {
                    if sender.send(event).await.is_err() {
                        log::debug!(target: "firestore::transport", "dropping inbound frame for closed stream {}", stream_id.value());
                    }
                }
                (None, _) => {
                    log::debug!(target: "firestore::transport", "dropping frame for unknown stream {}", stream_id.value());
                }
            }
        }
    });
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
}

impl MultiplexedConnectionHandle {
    fn register(&self, stream_id: StreamId) -> Receiver<FrameKind> {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        self.streams.lock().unwrap().insert(stream_id, inbound_tx);
        inbound_rx
    }

    pub fn close_stream(&self, stream_id: StreamId) {
        let known = self.streams.lock().unwrap().remove(&stream_id).is_some();
        if known {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }

    fn fail_all(&self, error: FirestoreError) {
        let senders: Vec<_> = self.streams.lock().unwrap().drain().map(|(_, sender)| sender).collect();
        for sender in senders {
            let _ = sender.try_send(FrameKind::Error(error.clone()));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue stream frame: {err}")))
    }

    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    /// Fails the stream on the peer's side with `error`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.manager.streams.lock().unwrap().remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.manager.close_stream(self.id);
        Ok(())
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

/// Loopback transport connecting two in-process connection ends.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream("listen").await.expect("left stream");
        let (channel, right_stream) = right.accept().await.expect("accepted stream");
        assert_eq!(channel, "listen");
        assert_eq!(right_stream.id(), left_stream.id());

        left_stream.send(b"hello".to_vec()).await.expect("left send");
        let payload = right_stream.next().await.expect("right recv").expect("payload");
        assert_eq!(payload, b"hello");

        right_stream.send(b"world".to_vec()).await.expect("right send");
        let payload = left_stream.next().await.expect("left recv").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream("write").await.expect("left stream");
        let (_, right_stream) = right.accept().await.expect("accepted stream");

        left_stream.close().await.expect("left close");
        assert!(right_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn peer_errors_surface_on_next() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left = MultiplexedConnection::new(left_transport);
        let right = MultiplexedConnection::new(right_transport);

        let left_stream = left.open_stream("listen").await.expect("left stream");
        let (_, right_stream) = right.accept().await.expect("accepted stream");
        right_stream.fail(permission_denied("nope")).await.expect("fail stream");

        let err = left_stream.next().await.expect("frame").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
    }
}

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::{select, Either};

use crate::firestore::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::{StreamHandle, StreamingDatastore, StreamingFuture};
use crate::platform::runtime;
use crate::util::{BackoffConfig, ExponentialBackoff};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

/// Lifecycle of a persistent stream.
///
/// `Initial -> Starting -> Open`, and on any failure `Error -> Backoff -> Initial` until the
/// stream is stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    /// Fetching credentials and opening the underlying stream.
    Starting,
    Open,
    Error,
    Backoff,
    Stopped,
}

pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn stream_label(&self) -> &'static str;

    fn on_stream_open(&self, stream: Arc<dyn StreamHandle>) -> StreamingFuture<'_, FirestoreResult<()>>;

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Called once, after the stream stopped for good.
    fn on_stream_close(&self) -> StreamingFuture<'_, ()>;

    /// Called for every failed attempt before backing off.
    fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()>;

    fn should_continue(&self) -> bool;
}

struct StreamShared {
    running: AtomicBool,
    inhibit_backoff: AtomicBool,
    state: Mutex<StreamState>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl StreamShared {
    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Keeps one logical stream open, reconnecting with exponential backoff until stopped.
pub struct PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    datastore: Arc<dyn StreamingDatastore>,
    delegate: Arc<D>,
    backoff: BackoffConfig,
    kind: StreamKind,
    shared: Arc<StreamShared>,
}

enum StreamEnd {
    Stopped,
    Failed(FirestoreError),
}

impl<D> PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        delegate: Arc<D>,
        backoff: BackoffConfig,
        kind: StreamKind,
    ) -> Self {
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        Self {
            datastore,
            delegate,
            backoff,
            kind,
            shared: Arc::new(StreamShared {
                running: AtomicBool::new(true),
                inhibit_backoff: AtomicBool::new(false),
                state: Mutex::new(StreamState::Initial),
                stop_tx,
                stop_rx,
            }),
        }
    }

    pub fn start(self) -> PersistentStreamHandle {
        let shared = Arc::clone(&self.shared);
        runtime::spawn_detached(async move {
            self.run().await;
        });
        PersistentStreamHandle { shared }
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && self.delegate.should_continue()
    }

    /// Resolves to `None` as soon as the stream is stopped.
    async fn until_stopped<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if !self.shared.running.load(Ordering::SeqCst) {
            return None;
        }
        match select(Box::pin(future), Box::pin(self.shared.stop_rx.recv())).await {
            Either::Left((value, _)) => Some(value),
            Either::Right(_) => None,
        }
    }

    async fn run(self) {
        let label = self.delegate.stream_label();
        let mut backoff = ExponentialBackoff::new(self.backoff);

        while self.is_running() {
            self.shared.set_state(StreamState::Starting);
            let end = self.run_once(&mut backoff).await;

            let error = match end {
                StreamEnd::Stopped => break,
                StreamEnd::Failed(error) => error,
            };
            if !self.is_running() {
                break;
            }

            self.shared.set_state(StreamState::Error);
            log::debug!(target: "firestore::stream", "{label} stream failed: {error}");
            if error.code == FirestoreErrorCode::ResourceExhausted {
                backoff.reset_to_max();
            }
            self.delegate.on_stream_error(error).await;

            self.shared.set_state(StreamState::Backoff);
            let delay = if self.shared.inhibit_backoff.swap(false, Ordering::SeqCst) {
                Duration::ZERO
            } else {
                backoff.next_delay()
            };
            if self.until_stopped(runtime::sleep(delay)).await.is_none() {
                break;
            }
            self.shared.set_state(StreamState::Initial);
        }

        self.shared.set_state(StreamState::Stopped);
        log::debug!(target: "firestore::stream", "{label} stream stopped");
        self.delegate.on_stream_close().await;
    }

    async fn run_once(&self, backoff: &mut ExponentialBackoff) -> StreamEnd {
        let open = async {
            match self.kind {
                StreamKind::Listen => self.datastore.open_listen_stream().await,
                StreamKind::Write => self.datastore.open_write_stream().await,
            }
        };
        let stream = match self.until_stopped(open).await {
            None => return StreamEnd::Stopped,
            Some(Err(err)) => return StreamEnd::Failed(err),
            Some(Ok(stream)) => stream,
        };

        match self.until_stopped(self.delegate.on_stream_open(Arc::clone(&stream))).await {
            None => {
                let _ = stream.close().await;
                return StreamEnd::Stopped;
            }
            Some(Err(err)) => {
                let _ = stream.close().await;
                return StreamEnd::Failed(err);
            }
            Some(Ok(())) => {}
        }

        self.shared.set_state(StreamState::Open);
        let end = self.process_stream(&stream, backoff).await;
        let _ = stream.close().await;
        end
    }

    async fn process_stream(&self, stream: &Arc<dyn StreamHandle>, backoff: &mut ExponentialBackoff) -> StreamEnd {
        loop {
            if !self.is_running() {
                return StreamEnd::Stopped;
            }
            match self.until_stopped(stream.next()).await {
                None => return StreamEnd::Stopped,
                Some(Some(Ok(payload))) => {
                    // A frame from the backend means the connection is healthy again.
                    backoff.reset();
                    if let Err(err) = self.delegate.on_stream_message(payload).await {
                        return StreamEnd::Failed(err);
                    }
                }
                Some(Some(Err(err))) => return StreamEnd::Failed(err),
                Some(None) => return StreamEnd::Failed(unavailable("stream closed by the backend")),
            }
        }
    }
}

#[derive(Clone)]
pub struct PersistentStreamHandle {
    shared: Arc<StreamShared>,
}

impl PersistentStreamHandle {
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.stop_tx.close();
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_stopped(&self) -> bool {
        !self.shared.running.load(Ordering::SeqCst)
    }

    /// Skips the delay before the next reconnect, used after errors that are not the
    /// connection's fault.
    pub fn inhibit_backoff(&self) {
        self.shared.inhibit_backoff.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::resource_exhausted;
    use crate::firestore::remote::datastore::{streaming::box_stream_future, StreamingDatastoreImpl};
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};

    struct TestDelegate {
        messages: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<FirestoreError>>,
        opens: Mutex<usize>,
        closed: AtomicBool,
    }

    impl TestDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                opens: Mutex::new(0),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl PersistentStreamDelegate for TestDelegate {
        fn stream_label(&self) -> &'static str {
            "test"
        }

        fn on_stream_open(&self, _stream: Arc<dyn StreamHandle>) -> StreamingFuture<'_, FirestoreResult<()>> {
            box_stream_future(async move {
                *self.opens.lock().unwrap() += 1;
                Ok(())
            })
        }

        fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
            box_stream_future(async move {
                self.messages.lock().unwrap().push(message);
                Ok(())
            })
        }

        fn on_stream_close(&self) -> StreamingFuture<'_, ()> {
            box_stream_future(async move {
                self.closed.store(true, Ordering::SeqCst);
            })
        }

        fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()> {
            box_stream_future(async move {
                self.errors.lock().unwrap().push(error);
            })
        }

        fn should_continue(&self) -> bool {
            true
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(5),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        }
    }

    fn start(delegate: Arc<TestDelegate>) -> (PersistentStreamHandle, MultiplexedConnection) {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(client_transport));
        let server = MultiplexedConnection::new(server_transport);
        let datastore = Arc::new(StreamingDatastoreImpl::new(client)) as Arc<dyn StreamingDatastore>;
        let handle = PersistentStream::new(datastore, delegate, fast_backoff(), StreamKind::Listen).start();
        (handle, server)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..50 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn persistent_stream_receives_messages() {
        let delegate = TestDelegate::new();
        let (handle, server) = start(Arc::clone(&delegate));

        let (_, peer_stream) = server.accept().await.expect("peer stream");
        peer_stream.send(b"hello".to_vec()).await.expect("send payload");
        wait_until(|| !delegate.messages.lock().unwrap().is_empty()).await;
        assert_eq!(handle.state(), StreamState::Open);

        handle.stop();
        wait_until(|| delegate.closed.load(Ordering::SeqCst)).await;
        assert_eq!(handle.state(), StreamState::Stopped);
        assert_eq!(delegate.messages.lock().unwrap()[0], b"hello");
        // The backend sees the stream go away.
        assert!(peer_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn reconnects_after_backend_error() {
        let delegate = TestDelegate::new();
        let (handle, server) = start(Arc::clone(&delegate));

        let (_, first) = server.accept().await.expect("first stream");
        first.fail(resource_exhausted("slow down")).await.expect("fail stream");

        let (_, second) = server.accept().await.expect("reconnected stream");
        second.send(b"again".to_vec()).await.expect("send payload");
        wait_until(|| !delegate.messages.lock().unwrap().is_empty()).await;

        assert_eq!(*delegate.opens.lock().unwrap(), 2);
        let errors = delegate.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, FirestoreErrorCode::ResourceExhausted);
        handle.stop();
    }
}

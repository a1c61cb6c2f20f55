use std::sync::Arc;

use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::streaming::box_stream_future;
use crate::firestore::remote::datastore::{StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc};
use crate::firestore::remote::stream::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind,
};
use crate::util::BackoffConfig;

/// Tokens fetched for one stream attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
    pub heartbeat_header: Option<String>,
}

#[derive(Clone)]
struct CredentialSources {
    auth: TokenProviderArc,
    app_check: Option<TokenProviderArc>,
    heartbeat: Option<TokenProviderArc>,
}

impl CredentialSources {
    async fn fetch(&self) -> FirestoreResult<StreamCredentials> {
        let mut credentials = StreamCredentials {
            auth_token: self.auth.get_token().await?,
            ..StreamCredentials::default()
        };
        if let Some(app_check) = &self.app_check {
            credentials.app_check_token = app_check.get_token().await?;
        }
        if let Some(heartbeat) = &self.heartbeat {
            credentials.heartbeat_header = heartbeat.heartbeat_header().await?;
        }
        Ok(credentials)
    }

    /// A rejected token is dropped so the next attempt fetches a fresh one.
    fn handle_stream_error(&self, error: &FirestoreError) {
        if error.code != FirestoreErrorCode::Unauthenticated {
            return;
        }
        log::debug!(target: "firestore::network", "stream rejected credentials; invalidating tokens");
        self.auth.invalidate_token();
        for provider in self.app_check.iter().chain(self.heartbeat.iter()) {
            provider.invalidate_token();
        }
    }
}

/// Protocol logic of one stream kind. The network layer owns reconnects and credentials;
/// the handler only sees frames.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamHandler: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    /// `false` stops reconnecting after the current attempt ends.
    fn should_continue(&self) -> bool;

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, credentials: StreamCredentials) -> FirestoreResult<()>;

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    async fn on_close(&self);

    async fn on_error(&self, error: FirestoreError);
}

struct CredentialedDelegate<H: StreamHandler> {
    handler: Arc<H>,
    sources: CredentialSources,
}

impl<H: StreamHandler> PersistentStreamDelegate for CredentialedDelegate<H> {
    fn stream_label(&self) -> &'static str {
        self.handler.label()
    }

    fn on_stream_open(&self, stream: Arc<dyn StreamHandle>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            let credentials = self.sources.fetch().await?;
            self.handler.on_open(stream, credentials).await
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(self.handler.on_message(message))
    }

    fn on_stream_close(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(self.handler.on_close())
    }

    fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            self.sources.handle_stream_error(&error);
            self.handler.on_error(error).await;
        })
    }

    fn should_continue(&self) -> bool {
        self.handler.should_continue()
    }
}

/// Opens persistent Listen and Write streams with credentials and backoff applied.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    sources: CredentialSources,
    backoff: BackoffConfig,
}

impl NetworkLayer {
    pub fn builder(datastore: Arc<dyn StreamingDatastore>, auth_provider: TokenProviderArc) -> NetworkLayerBuilder {
        NetworkLayerBuilder {
            datastore,
            sources: CredentialSources {
                auth: auth_provider,
                app_check: None,
                heartbeat: None,
            },
            backoff: BackoffConfig::default(),
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    pub fn listen<H: StreamHandler>(&self, handler: Arc<H>) -> PersistentStreamHandle {
        self.open(StreamKind::Listen, handler)
    }

    pub fn write<H: StreamHandler>(&self, handler: Arc<H>) -> PersistentStreamHandle {
        self.open(StreamKind::Write, handler)
    }

    fn open<H: StreamHandler>(&self, kind: StreamKind, handler: Arc<H>) -> PersistentStreamHandle {
        let delegate = Arc::new(CredentialedDelegate {
            handler,
            sources: self.sources.clone(),
        });
        PersistentStream::new(Arc::clone(&self.datastore), delegate, self.backoff, kind).start()
    }
}

pub struct NetworkLayerBuilder {
    datastore: Arc<dyn StreamingDatastore>,
    sources: CredentialSources,
    backoff: BackoffConfig,
}

impl NetworkLayerBuilder {
    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.sources.app_check = Some(provider);
        self
    }

    /// Provider of the heartbeat header. Falls back to the app check provider.
    pub fn with_heartbeat_provider(mut self, provider: TokenProviderArc) -> Self {
        self.sources.heartbeat = Some(provider);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn build(mut self) -> NetworkLayer {
        if self.sources.heartbeat.is_none() {
            self.sources.heartbeat = self.sources.app_check.clone();
        }
        NetworkLayer {
            datastore: self.datastore,
            sources: self.sources,
            backoff: self.backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::user::User;
    use crate::firestore::error::unauthenticated;
    use crate::firestore::remote::datastore::{StaticTokenProvider, TokenProvider};
    use crate::firestore::test_support::{eventually, fast_backoff, loopback_datastore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct AppCheck {
        invalidations: AtomicUsize,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl TokenProvider for AppCheck {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(Some("app-check".into()))
        }

        fn invalidate_token(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }

        async fn heartbeat_header(&self) -> FirestoreResult<Option<String>> {
            Ok(Some("heartbeat".into()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        opened_with: Mutex<Vec<StreamCredentials>>,
        messages: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<FirestoreErrorCode>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl StreamHandler for Recorder {
        fn label(&self) -> &'static str {
            "recorder"
        }

        fn should_continue(&self) -> bool {
            true
        }

        async fn on_open(&self, stream: Arc<dyn StreamHandle>, credentials: StreamCredentials) -> FirestoreResult<()> {
            self.opened_with.lock().unwrap().push(credentials);
            stream.send(b"hello".to_vec()).await
        }

        async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
            self.messages.lock().unwrap().push(payload);
            Ok(())
        }

        async fn on_close(&self) {}

        async fn on_error(&self, error: FirestoreError) {
            self.errors.lock().unwrap().push(error.code);
        }
    }

    #[tokio::test]
    async fn stream_opens_with_every_credential() {
        let (datastore, server) = loopback_datastore();
        let auth = Arc::new(StaticTokenProvider::new(User::authenticated("alice"), Some("auth".into())));
        let layer = NetworkLayer::builder(datastore, auth as TokenProviderArc)
            .with_app_check_provider(Arc::new(AppCheck::default()) as TokenProviderArc)
            .with_backoff(fast_backoff())
            .build();
        let recorder = Arc::new(Recorder::default());
        let handle = layer.listen(Arc::clone(&recorder));

        let (channel, peer) = server.accept().await.expect("stream");
        assert!(channel.ends_with("/Listen"));
        assert_eq!(peer.next().await.expect("frame").expect("payload"), b"hello");
        peer.send(b"frame".to_vec()).await.expect("send");
        eventually(|| !recorder.messages.lock().unwrap().is_empty()).await;
        handle.stop();

        assert_eq!(
            recorder.opened_with.lock().unwrap()[0],
            StreamCredentials {
                auth_token: Some("auth".into()),
                app_check_token: Some("app-check".into()),
                heartbeat_header: Some("heartbeat".into()),
            }
        );
    }

    #[tokio::test]
    async fn unauthenticated_error_refreshes_tokens_before_reconnecting() {
        let (datastore, server) = loopback_datastore();
        let auth = Arc::new(StaticTokenProvider::new(User::authenticated("alice"), Some("stale".into())));
        let app_check = Arc::new(AppCheck::default());
        let layer = NetworkLayer::builder(datastore, Arc::clone(&auth) as TokenProviderArc)
            .with_app_check_provider(Arc::clone(&app_check) as TokenProviderArc)
            .with_backoff(fast_backoff())
            .build();
        let recorder = Arc::new(Recorder::default());
        let handle = layer.write(Arc::clone(&recorder));

        let (_, first) = server.accept().await.expect("first stream");
        first.fail(unauthenticated("token expired")).await.expect("fail");
        let (_, second) = server.accept().await.expect("second stream");
        assert_eq!(second.next().await.expect("frame").expect("payload"), b"hello");
        handle.stop();

        assert_eq!(auth.invalidation_count(), 1);
        assert!(app_check.invalidations.load(Ordering::SeqCst) >= 1);
        assert_eq!(*recorder.errors.lock().unwrap(), vec![FirestoreErrorCode::Unauthenticated]);
        assert_eq!(recorder.opened_with.lock().unwrap().len(), 2);
    }
}

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::core::user::User;
use crate::firestore::error::FirestoreResult;

pub mod streaming;

pub use streaming::StreamingDatastoreImpl;

#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = futures::future::BoxFuture<'a, T>;

/// One open bidirectional stream carrying JSON frames.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// `None` once the peer closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the two long-lived RPC streams of the backend.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

pub type UserListener = Arc<dyn Fn(User) + Send + Sync>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next [`get_token`](Self::get_token) call to fetch a fresh token.
    fn invalidate_token(&self);

    async fn heartbeat_header(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    /// Registers a listener for user changes. Auth providers call it once with the
    /// current user and again after every sign-in or sign-out.
    fn add_user_listener(&self, _listener: UserListener) {}
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// Token provider whose user and token are set by the embedding application.
///
/// Switching users notifies every registered listener, which is how the client
/// learns about sign-in and sign-out.
#[derive(Default)]
pub struct StaticTokenProvider {
    state: Mutex<StaticTokenState>,
}

#[derive(Default)]
struct StaticTokenState {
    user: User,
    token: Option<String>,
    invalidations: usize,
    listeners: Vec<UserListener>,
}

impl StaticTokenProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Mutex::new(StaticTokenState {
                user,
                token,
                invalidations: 0,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn user(&self) -> User {
        self.state.lock().unwrap().user.clone()
    }

    pub fn invalidation_count(&self) -> usize {
        self.state.lock().unwrap().invalidations
    }

    pub fn set_user(&self, user: User, token: Option<String>) {
        let listeners = {
            let mut state = self.state.lock().unwrap();
            if state.user == user && state.token == token {
                return;
            }
            state.user = user.clone();
            state.token = token;
            state.listeners.clone()
        };
        for listener in listeners {
            listener(user.clone());
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(self.state.lock().unwrap().token.clone())
    }

    fn invalidate_token(&self) {
        self.state.lock().unwrap().invalidations += 1;
    }

    fn add_user_listener(&self, listener: UserListener) {
        let user = {
            let mut state = self.state.lock().unwrap();
            state.listeners.push(Arc::clone(&listener));
            state.user.clone()
        };
        listener(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_notifies_on_user_change() {
        let provider = StaticTokenProvider::new(User::unauthenticated(), None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.add_user_listener(Arc::new(move |user| sink.lock().unwrap().push(user)));

        provider.set_user(User::authenticated("alice"), Some("token-a".into()));
        provider.set_user(User::authenticated("alice"), Some("token-a".into()));
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("token-a"));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![User::unauthenticated(), User::authenticated("alice")]);
    }
}

use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::core::user::User;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, MutationBatchResult, TargetId};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks from the remote store into the component that owns local state.
///
/// The remote store never holds its own lock while calling these, so implementations are
/// free to call back into the remote store.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent snapshot from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to serve `target_id`; the target is no longer listened to.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend rejected the batch permanently; it will not be retried.
    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the local store associates with `target_id`. Must not block on async work.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// The first queued batch with an id greater than `after_batch_id`.
    fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    /// Persists the write stream token so a restarted client can resume the stream.
    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_online_state_change(&self, state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        let _ = state;
        box_remote_store_future(async {})
    }
}

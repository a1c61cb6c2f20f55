//! Query-facing half of the engine: targets, views, the sync engine and the client that
//! wires everything together.

pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod listen_sequence;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod user;
pub mod view;

#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryEventSource, QueryListener, SyncEngineListener};
#[doc(inline)]
pub use firestore_client::{FirestoreClient, FirestoreClientBuilder, ListenerRegistration};
#[doc(inline)]
pub use query::{Bound, Direction, Filter, LimitType, Operator, OrderBy, Query};
#[doc(inline)]
pub use sync_engine::{LoadedBundle, PendingWrite, PendingWritesWaiter, SyncEngine};
#[doc(inline)]
pub use target::{Target, TargetData, TargetPurpose};
#[doc(inline)]
pub use user::User;
#[doc(inline)]
pub use view::{ChangeType, DocumentViewChange, SyncState, View, ViewSnapshot};

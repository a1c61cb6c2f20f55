#![doc = include_str!("RUSTDOC.md")]

pub mod firestore;
pub mod platform;
pub mod util;

pub use firestore::core::{FirestoreClient, FirestoreClientBuilder, ListenOptions, ListenerRegistration};
pub use firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use firestore::settings::{FirestoreSettings, PersistenceSettings};

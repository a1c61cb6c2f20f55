//! Offline-first document sync: the local cache and mutation queue, the watch and write
//! streams, and the sync engine that reconciles the two into query snapshots.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
#[doc(hidden)]
pub mod test_support;
pub mod value;

pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};

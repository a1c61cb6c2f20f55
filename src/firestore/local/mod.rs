//! Durable client state: the persistence layer and the caches built on top of it.

pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod index_manager;
pub mod journal;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod schema;
pub mod simple_db;
pub mod target_cache;

#[doc(inline)]
pub use local_store::{
    FieldIndexDefinition, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
#[doc(inline)]
pub use lru_garbage_collector::{LruParams, LruResults};
#[doc(inline)]
pub use persistence::{Persistence, TransactionMode};

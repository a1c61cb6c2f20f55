mod database_id;
mod document;
mod document_key;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_path::{FieldPath, DOCUMENT_KEY_NAME};
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, FieldMask, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

/// Identifier of a listen target. Query targets use even ids, limbo targets odd ones.
pub type TargetId = i32;

/// Monotonic counter recording how recently a target or document was used.
pub type ListenSequenceNumber = i64;

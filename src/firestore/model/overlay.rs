use serde::{Deserialize, Serialize};

use crate::firestore::model::{BatchId, DocumentKey, FieldMask, MutableDocument, Mutation};

/// The compacted local mutation for one document, tagged with the newest batch it reflects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.mutation.key
    }
}

/// A document with overlays applied, plus the fields they touched (`None` for whole-document).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub overlayed_document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

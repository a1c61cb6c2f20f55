use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult,
    OverlayedDocument, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Marker for "no batch" when asking for the highest unacknowledged id.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A group of mutations written atomically by one local write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Patches pinning base values for non-idempotent transforms; applied before `mutations`.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }

    pub fn applies_to(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| &m.key == key)
    }

    /// Applies the server's results for this batch to the remote version of `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationBatchResult) {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if &mutation.key == document.key() {
                if let Some(mutation_result) = result.mutation_results.get(index) {
                    mutation.apply_to_remote_document(document, mutation_result);
                }
            }
        }
    }

    /// Applies base mutations and then mutations that target `document`.
    pub fn apply_to_local_view(&self, document: &mut MutableDocument, mut mask: Option<FieldMask>) -> Option<FieldMask> {
        let key = document.key().clone();
        for mutation in self.base_mutations.iter().filter(|m| m.key == key) {
            mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
        }
        for mutation in self.mutations.iter().filter(|m| m.key == key) {
            mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
        }
        mask
    }

    /// Applies the batch to already-overlayed documents and returns the overlays to persist.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let previous = overlayed.mutated_fields.clone();
            let mut mask = self.apply_to_local_view(&mut overlayed.overlayed_document, previous);
            if documents_without_remote_version.contains(&key) {
                mask = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.overlayed_document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            overlayed.mutated_fields = mask;
            if !overlayed.overlayed_document.is_valid_document() {
                overlayed
                    .overlayed_document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// A batch together with the server's response to committing it.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key.clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    /// Keys whose results carried transform values, which require overlay recomputation.
    pub fn keys_with_transform_results(&self) -> BTreeSet<DocumentKey> {
        self.batch
            .mutations
            .iter()
            .zip(self.mutation_results.iter())
            .filter(|(_, result)| !result.transform_results.is_empty())
            .map(|(mutation, _)| mutation.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::now(), Vec::new(), vec![Mutation::delete(key("a/b"))]);
        let err = MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::set(key("a/b"), MapValue::empty()), Mutation::delete(key("a/c"))],
        );
        let mut documents = BTreeMap::new();
        for path in ["a/b", "a/c"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    overlayed_document: MutableDocument::new_invalid_document(key(path)),
                    mutated_fields: Some(FieldMask::empty()),
                },
            );
        }
        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());
        assert_eq!(overlays.len(), 2);
        assert!(documents[&key("a/b")].overlayed_document.is_found_document());
        assert!(documents[&key("a/c")].overlayed_document.is_no_document());
        assert!(!batch.applies_to(&key("a/d")));
    }
}

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, FieldMask, MutableDocument, MutationKind, Overlay,
    OverlayedDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Local view of documents: the remote cache with each document's pending overlay applied.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    document_overlay_cache: DocumentOverlayCache,
}

fn is_patch(overlay: &Overlay) -> bool {
    matches!(overlay.mutation.kind, MutationKind::Patch { .. })
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        document_overlay_cache: DocumentOverlayCache,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            document_overlay_cache,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn document_overlay_cache(&self) -> &DocumentOverlayCache {
        &self.document_overlay_cache
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.remote_documents
    }

    /// The local view of `key`. Missing documents come back as invalid placeholders.
    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Document> {
        let overlay = self.document_overlay_cache.get_overlay(txn, key)?;
        let mut document = match &overlay {
            Some(overlay) if !is_patch(overlay) => MutableDocument::new_invalid_document(key.clone()),
            _ => self.remote_documents.get_entry(txn, key)?,
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    pub fn get_documents<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`, returning each with the fields its overlay touched.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys())?;
        self.compute_views(txn, documents, overlays, &BTreeSet::new())
    }

    /// Applies overlays to already-read remote `documents`.
    ///
    /// Documents in `existence_state_changed` switched between existing and missing remotely,
    /// so their patch overlays are recomputed from the mutation queue.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys())?;
        Ok(self
            .compute_views(txn, documents, overlays, existence_state_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.overlayed_document))
            .collect())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: BTreeMap<DocumentKey, MutableDocument>,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut recalculate = BTreeSet::new();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            if existence_state_changed.contains(key) && overlay.map_or(true, is_patch) {
                recalculate.insert(key.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                overlay
                    .mutation
                    .apply_to_local_view(document, mask.clone(), Timestamp::now());
                mutated_fields.insert(key.clone(), mask);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let recalculated = self.recalculate_overlays_for(txn, &mut documents, &recalculate)?;
        mutated_fields.extend(recalculated);

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mutated = mutated_fields.remove(&key).flatten();
                (
                    key,
                    OverlayedDocument {
                        overlayed_document: document,
                        mutated_fields: mutated,
                    },
                )
            })
            .collect())
    }

    /// Replays the mutation queue over `documents` (in place) and rewrites their overlays.
    ///
    /// Returns the mask of fields touched per document (`None` for whole-document writes).
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        self.recalculate_overlays_for(txn, documents, &keys)
    }

    fn recalculate_overlays_for(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut BTreeMap<DocumentKey, MutableDocument>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, keys.iter())?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                if !keys.contains(&key) {
                    continue;
                }
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, batch_keys) in keys_by_batch.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                if let Some(document) = documents.get(&key) {
                    let mask = masks.get(&key).cloned().flatten();
                    match calculate_overlay_mutation(document, mask.as_ref()) {
                        Some(mutation) => {
                            overlays.insert(key, mutation);
                        }
                        // The queued batches no longer change the document, e.g. a patch whose
                        // target was deleted remotely.
                        None => self.document_overlay_cache.remove_overlay(txn, &key)?,
                    }
                }
            }
            self.document_overlay_cache.save_overlays(txn, batch_id, &overlays)?;
        }
        Ok(masks)
    }

    /// Recomputes overlays for `keys` from their remote state.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys.iter())?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Local documents matching `query` among those read after `since_read_time`, plus every
    /// document with a pending local mutation.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut results = BTreeMap::new();
            if document.is_found_document() {
                results.insert(key, document);
            }
            return Ok(results);
        }

        let overlays = match query.collection_group_id() {
            Some(group) => self.document_overlay_cache.get_overlays_for_collection_group(
                txn,
                group,
                BATCH_ID_UNKNOWN,
                usize::MAX,
            )?,
            None => self
                .document_overlay_cache
                .get_overlays_for_collection(txn, query.path(), BATCH_ID_UNKNOWN)?,
        };
        let mutated: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut remote = self
            .remote_documents
            .get_documents_matching_query(txn, query, since_read_time, &mutated, context)?;
        // Overlays may apply to documents read before `since_read_time`.
        for key in &mutated {
            if !remote.contains_key(key) {
                let document = self.remote_documents.get_entry(txn, key)?;
                remote.insert(key.clone(), document);
            }
        }

        let mut results = BTreeMap::new();
        for (key, mut document) in remote {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }
}

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::user::User;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_prefix, compound_prefix, document_overlay_key, encode_path, DbDocumentOverlay, DOCUMENT_OVERLAYS_STORE,
};
use crate::firestore::local::simple_db::KeyRange;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user store of the compacted pending mutation for each locally modified document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentOverlayCache {
    user_id: String,
}

impl DocumentOverlayCache {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.storage_key().to_string(),
        }
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        let record: Option<DbDocumentOverlay> = txn.get(DOCUMENT_OVERLAYS_STORE, &document_overlay_key(&self.user_id, key))?;
        Ok(record.map(|record| record.overlay))
    }

    pub fn get_overlays<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut overlays = BTreeMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Stores `overlays` (keyed by document) as produced by batch `largest_batch_id`.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            let record = DbDocumentOverlay {
                collection_path: encode_path(&key.collection_path()),
                collection_group: key.collection_group().to_string(),
                overlay: Overlay::new(largest_batch_id, mutation.clone()),
            };
            txn.put(DOCUMENT_OVERLAYS_STORE, document_overlay_key(&self.user_id, key), &record)?;
        }
        Ok(())
    }

    /// Drops the overlay of `key`, whichever batch wrote it.
    pub fn remove_overlay(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        txn.delete(DOCUMENT_OVERLAYS_STORE, document_overlay_key(&self.user_id, key))
    }

    /// Drops the overlays among `keys` that were last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
        batch_id: BatchId,
    ) -> FirestoreResult<()> {
        for key in keys {
            let storage_key = document_overlay_key(&self.user_id, key);
            let record: Option<DbDocumentOverlay> = txn.get(DOCUMENT_OVERLAYS_STORE, &storage_key)?;
            if record.is_some_and(|record| record.overlay.largest_batch_id == batch_id) {
                txn.delete(DOCUMENT_OVERLAYS_STORE, storage_key)?;
            }
        }
        Ok(())
    }

    /// Overlays of documents directly inside `collection` written after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let prefix = format!("{}{}", compound_prefix(&[&self.user_id]), collection_prefix(collection));
        let encoded_collection = encode_path(collection);
        Ok(txn
            .scan::<DbDocumentOverlay>(DOCUMENT_OVERLAYS_STORE, &KeyRange::prefix(prefix))?
            .into_iter()
            .filter(|(_, record)| record.collection_path == encoded_collection)
            .filter(|(_, record)| record.overlay.largest_batch_id > since_batch_id)
            .map(|(_, record)| (record.overlay.key().clone(), record.overlay))
            .collect())
    }

    /// Overlays in collections named `collection_group` written after `since_batch_id`.
    ///
    /// Returns whole batches in batch order until at least `count` overlays were collected.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut by_batch: BTreeMap<BatchId, Vec<Overlay>> = BTreeMap::new();
        for (_, record) in txn.scan::<DbDocumentOverlay>(DOCUMENT_OVERLAYS_STORE, &KeyRange::prefix(compound_prefix(&[&self.user_id])))? {
            if record.collection_group == collection_group && record.overlay.largest_batch_id > since_batch_id {
                by_batch.entry(record.overlay.largest_batch_id).or_default().push(record.overlay);
            }
        }

        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay);
            }
            if result.len() >= count {
                break;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::test_support::{key, memory_persistence, path, set_mutation};
    use serde_json::json;

    fn overlays(paths: &[&str]) -> BTreeMap<DocumentKey, Mutation> {
        paths.iter().map(|p| (key(p), set_mutation(p, json!({"p": *p})))).collect()
    }

    #[tokio::test]
    async fn saves_and_removes_overlays_by_batch() {
        let persistence = memory_persistence().await;
        let cache = DocumentOverlayCache::for_user(&User::authenticated("alice"));
        persistence
            .run_transaction("overlays", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &overlays(&["rooms/a", "rooms/b"]))?;
                cache.save_overlays(txn, 2, &overlays(&["rooms/b"]))?;

                let keys: BTreeSet<_> = [key("rooms/a"), key("rooms/b")].into_iter().collect();
                cache.remove_overlays_for_batch_id(txn, &keys, 1)?;

                assert!(cache.get_overlay(txn, &key("rooms/a"))?.is_none());
                assert_eq!(cache.get_overlay(txn, &key("rooms/b"))?.map(|o| o.largest_batch_id), Some(2));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overlays_are_namespaced_by_user() {
        let persistence = memory_persistence().await;
        let alice = DocumentOverlayCache::for_user(&User::authenticated("alice"));
        let bob = DocumentOverlayCache::for_user(&User::authenticated("bob"));
        persistence
            .run_transaction("users", TransactionMode::ReadWrite, |txn| {
                alice.save_overlays(txn, 1, &overlays(&["rooms/a"]))?;
                assert!(bob.get_overlay(txn, &key("rooms/a"))?.is_none());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn collection_and_group_scans() {
        let persistence = memory_persistence().await;
        let cache = DocumentOverlayCache::for_user(&User::unauthenticated());
        persistence
            .run_transaction("scan", TransactionMode::ReadWrite, |txn| {
                cache.save_overlays(txn, 1, &overlays(&["rooms/a", "rooms/a/messages/m1"]))?;
                cache.save_overlays(txn, 2, &overlays(&["rooms/b", "lobby/x/messages/m2"]))?;
                cache.save_overlays(txn, 3, &overlays(&["rooms/c/messages/m3"]))?;

                let rooms = cache.get_overlays_for_collection(txn, &path("rooms"), 1)?;
                assert_eq!(rooms.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);

                let messages = cache.get_overlays_for_collection_group(txn, "messages", 0, 1)?;
                assert_eq!(messages.len(), 1);
                let all_messages = cache.get_overlays_for_collection_group(txn, "messages", 0, 10)?;
                assert_eq!(all_messages.len(), 3);
                Ok(())
            })
            .await
            .unwrap();
    }
}

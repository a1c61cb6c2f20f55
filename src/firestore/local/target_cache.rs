use std::collections::BTreeSet;

use crate::firestore::core::target::{Target, TargetData};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    compound_prefix, document_key_from_encoded, document_target_key, encode_id, encode_path, split_compound,
    target_document_key, target_key, DbTarget, DbTargetDocument, DbTargetGlobal, DOCUMENT_TARGETS_STORE, GLOBAL_KEY,
    SENTINEL_TARGET_ID, TARGETS_STORE, TARGET_DOCUMENTS_STORE, TARGET_GLOBAL_STORE,
};
use crate::firestore::local::simple_db::KeyRange;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Persisted targets, their matching documents and the global target metadata.
///
/// The target/document index also carries sentinel rows (target 0) recording when each
/// document was last referenced or unreferenced; garbage collection keys off those.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    pub fn get_target_global(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn.get(TARGET_GLOBAL_STORE, GLOBAL_KEY)?.unwrap_or_default())
    }

    fn save_target_global(&self, txn: &mut PersistenceTransaction<'_>, global: &DbTargetGlobal) -> FirestoreResult<()> {
        txn.put(TARGET_GLOBAL_STORE, GLOBAL_KEY, global)
    }

    /// Reserves the next even target id for a query target.
    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<TargetId> {
        let mut global = self.get_target_global(txn)?;
        let target_id = TargetIdGenerator::for_target_cache(global.highest_target_id).next_id();
        global.highest_target_id = target_id;
        self.save_target_global(txn, &global)?;
        Ok(target_id)
    }

    pub fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<SnapshotVersion> {
        Ok(self.get_target_global(txn)?.last_remote_snapshot_version)
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.get_target_global(txn)?.highest_listen_sequence_number)
    }

    pub fn set_target_versions(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let mut global = self.get_target_global(txn)?;
        global.highest_listen_sequence_number = global.highest_listen_sequence_number.max(highest_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            global.last_remote_snapshot_version = version;
        }
        self.save_target_global(txn, &global)
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        txn.put(
            TARGETS_STORE,
            target_key(target_data.target_id),
            &DbTarget {
                canonical_id: target_data.target.canonical_id(),
                target_data: target_data.clone(),
            },
        )
    }

    fn update_metadata_from_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
        count_delta: i64,
    ) -> FirestoreResult<()> {
        let mut global = self.get_target_global(txn)?;
        global.highest_target_id = global.highest_target_id.max(target_data.target_id);
        global.highest_listen_sequence_number = global.highest_listen_sequence_number.max(target_data.sequence_number);
        global.target_count += count_delta;
        self.save_target_global(txn, &global)
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        self.update_metadata_from_target_data(txn, target_data, 1)
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        self.update_metadata_from_target_data(txn, target_data, 0)
    }

    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        txn.delete(TARGETS_STORE, target_key(target_data.target_id))?;
        let mut global = self.get_target_global(txn)?;
        global.target_count = (global.target_count - 1).max(0);
        self.save_target_global(txn, &global)
    }

    /// Removes inactive targets last used at or before `upper_bound`. Returns how many went.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.get_all_targets(txn)? {
            if target_data.sequence_number <= upper_bound && !active_target_ids.contains(&target_data.target_id) {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn get_all_targets(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<TargetData>> {
        Ok(txn
            .scan::<DbTarget>(TARGETS_STORE, &KeyRange::all())?
            .into_iter()
            .map(|(_, record)| record.target_data)
            .collect())
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(self.get_target_global(txn)?.target_count)
    }

    pub fn get_target_data(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = target.canonical_id();
        Ok(txn
            .scan::<DbTarget>(TARGETS_STORE, &KeyRange::all())?
            .into_iter()
            .map(|(_, record)| record)
            .find(|record| record.canonical_id == canonical_id && &record.target_data.target == target)
            .map(|record| record.target_data))
    }

    pub fn get_target_data_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        let record: Option<DbTarget> = txn.get(TARGETS_STORE, &target_key(target_id))?;
        Ok(record.map(|record| record.target_data))
    }

    pub fn add_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.put(TARGET_DOCUMENTS_STORE, target_document_key(target_id, key), &DbTargetDocument::default())?;
            txn.put(DOCUMENT_TARGETS_STORE, document_target_key(key, target_id), &DbTargetDocument::default())?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.delete(TARGET_DOCUMENTS_STORE, target_document_key(target_id, key))?;
            txn.delete(DOCUMENT_TARGETS_STORE, document_target_key(key, target_id))?;
            self.update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in self.get_matching_keys_for_target_id(txn, target_id)? {
            txn.delete(TARGET_DOCUMENTS_STORE, target_document_key(target_id, &key))?;
            txn.delete(DOCUMENT_TARGETS_STORE, document_target_key(&key, target_id))?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let prefix = compound_prefix(&[&encode_id(target_id.into())]);
        txn.scan_keys(TARGET_DOCUMENTS_STORE, &KeyRange::prefix(prefix))?
            .iter()
            .filter_map(|row| split_compound(row).get(1).map(|encoded| document_key_from_encoded(encoded)))
            .collect()
    }

    fn target_ids_for_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Vec<TargetId>> {
        let prefix = compound_prefix(&[&encode_path(key.path())]);
        Ok(txn
            .scan_keys(DOCUMENT_TARGETS_STORE, &KeyRange::prefix(prefix))?
            .iter()
            .filter_map(|row| split_compound(row).last().and_then(|id| id.parse().ok()))
            .collect())
    }

    /// Whether any real (non-sentinel) target references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self
            .target_ids_for_document(txn, key)?
            .into_iter()
            .any(|target_id| target_id != SENTINEL_TARGET_ID))
    }

    /// Stamps `key` with the transaction's sequence number.
    pub fn update_sentinel(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let row = DbTargetDocument {
            sequence_number: Some(txn.current_sequence_number()),
        };
        txn.put(TARGET_DOCUMENTS_STORE, target_document_key(SENTINEL_TARGET_ID, key), &row)?;
        txn.put(DOCUMENT_TARGETS_STORE, document_target_key(key, SENTINEL_TARGET_ID), &row)
    }

    pub fn remove_sentinel(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        txn.delete(TARGET_DOCUMENTS_STORE, target_document_key(SENTINEL_TARGET_ID, key))?;
        txn.delete(DOCUMENT_TARGETS_STORE, document_target_key(key, SENTINEL_TARGET_ID))
    }

    /// Sentinel rows in key order with the sequence number each document was last touched at.
    pub fn sentinel_rows(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let prefix = compound_prefix(&[&encode_id(SENTINEL_TARGET_ID.into())]);
        let mut rows = Vec::new();
        for (row, record) in txn.scan::<DbTargetDocument>(TARGET_DOCUMENTS_STORE, &KeyRange::prefix(prefix))? {
            if let Some(encoded) = split_compound(&row).get(1) {
                rows.push((document_key_from_encoded(encoded)?, record.sequence_number.unwrap_or_default()));
            }
        }
        Ok(rows)
    }

    /// Documents whose only index row is their sentinel.
    pub fn orphaned_documents(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let mut orphaned = Vec::new();
        for (key, sequence_number) in self.sentinel_rows(txn)? {
            if !self.contains_key(txn, &key)? {
                orphaned.push((key, sequence_number));
            }
        }
        Ok(orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::target::TargetPurpose;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::test_support::{key, memory_persistence, query, version};

    fn target_data(path: &str, target_id: TargetId, sequence_number: ListenSequenceNumber) -> TargetData {
        TargetData::new(query(path).to_target(), target_id, TargetPurpose::Listen, sequence_number)
    }

    #[tokio::test]
    async fn targets_round_trip_with_metadata() {
        let persistence = memory_persistence().await;
        let cache = TargetCache::new();
        persistence
            .run_transaction("targets", TransactionMode::ReadWrite, |txn| {
                let id = cache.allocate_target_id(txn)?;
                assert_eq!(id, 2);
                let data = target_data("rooms", id, 10);
                cache.add_target_data(txn, &data)?;
                assert_eq!(cache.get_target_count(txn)?, 1);
                assert_eq!(cache.get_highest_sequence_number(txn)?, 10);
                assert_eq!(cache.get_target_data(txn, &data.target)?, Some(data.clone()));
                assert!(cache.get_target_data(txn, &query("other").to_target())?.is_none());

                cache.set_target_versions(txn, 3, Some(version(7)))?;
                assert_eq!(cache.get_last_remote_snapshot_version(txn)?, version(7));
                assert_eq!(cache.get_highest_sequence_number(txn)?, 10);

                cache.remove_target_data(txn, &data)?;
                assert_eq!(cache.get_target_count(txn)?, 0);
                assert_eq!(cache.allocate_target_id(txn)?, 4);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn matching_keys_and_orphans() {
        let persistence = memory_persistence().await;
        let cache = TargetCache::new();
        persistence
            .run_transaction("keys", TransactionMode::ReadWrite, |txn| {
                let a = key("rooms/a");
                let b = key("rooms/b");
                cache.add_matching_keys(txn, [&a, &b], 2)?;
                cache.add_matching_keys(txn, [&a], 4)?;
                assert_eq!(cache.get_matching_keys_for_target_id(txn, 2)?.len(), 2);
                assert!(cache.contains_key(txn, &a)?);

                cache.remove_matching_keys(txn, [&b], 2)?;
                assert!(!cache.contains_key(txn, &b)?);
                let orphans: Vec<_> = cache.orphaned_documents(txn)?.into_iter().map(|(k, _)| k).collect();
                assert_eq!(orphans, vec![b.clone()]);

                cache.remove_matching_keys_for_target_id(txn, 2)?;
                assert!(cache.contains_key(txn, &a)?);
                cache.remove_matching_keys_for_target_id(txn, 4)?;
                assert_eq!(cache.orphaned_documents(txn)?.len(), 2);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removes_only_old_inactive_targets() {
        let persistence = memory_persistence().await;
        let cache = TargetCache::new();
        persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                cache.add_target_data(txn, &target_data("a", 2, 1))?;
                cache.add_target_data(txn, &target_data("b", 4, 2))?;
                cache.add_target_data(txn, &target_data("c", 6, 50))?;
                let active: BTreeSet<TargetId> = [4].into_iter().collect();
                assert_eq!(cache.remove_targets(txn, 10, &active)?, 1);
                assert_eq!(cache.get_all_targets(txn)?.len(), 2);
                Ok(())
            })
            .await
            .unwrap();
    }
}

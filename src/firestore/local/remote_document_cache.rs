use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::schema::{
    collection_prefix, encode_path, DbRemoteDocument, DbRemoteDocumentGlobal, GLOBAL_KEY, REMOTE_DOCUMENTS_STORE,
    REMOTE_DOCUMENT_GLOBAL_STORE,
};
use crate::firestore::local::simple_db::KeyRange;
use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};
use crate::util::hard_assert;

/// The last known server state of every cached document, with a running byte size total.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

fn document_size(document: &MutableDocument) -> i64 {
    document.approximate_byte_size() as i64
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// The cached document, or an invalid placeholder when nothing is known about `key`.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let record: Option<DbRemoteDocument> = txn.get(REMOTE_DOCUMENTS_STORE, &encode_path(key.path()))?;
        Ok(record
            .map(|record| record.document)
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone())))
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(documents)
    }

    /// Cached documents below `parent`, read in key order.
    fn scan_below(
        &self,
        txn: &PersistenceTransaction<'_>,
        parent: &ResourcePath,
    ) -> FirestoreResult<impl Iterator<Item = MutableDocument>> {
        let records = txn.scan::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &KeyRange::prefix(collection_prefix(parent)))?;
        Ok(records.into_iter().map(|(_, record)| record.document))
    }

    /// Documents that match `query` (or have pending local mutations in `mutated_docs`) and were
    /// read after `since_read_time`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_docs: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut results = BTreeMap::new();
        for document in self.scan_below(txn, query.path())? {
            let in_scope = match query.collection_group_id() {
                Some(group) => document.key().has_collection_id(group),
                None => query.path().is_immediate_parent_of(document.key().path()),
            };
            if !in_scope {
                continue;
            }
            context.increment_documents_read(1);
            if !since_read_time.is_min() && document.read_time() <= since_read_time {
                continue;
            }
            if query.matches(&document) || mutated_docs.contains(document.key()) {
                results.insert(document.key().clone(), document);
            }
        }
        Ok(results)
    }

    /// Up to `limit` documents of a collection group read after `since_read_time`, oldest first.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_read_time: SnapshotVersion,
        limit: usize,
    ) -> FirestoreResult<Vec<MutableDocument>> {
        let mut documents: Vec<MutableDocument> = self
            .scan_below(txn, &ResourcePath::root())?
            .filter(|doc| doc.key().has_collection_id(collection_group))
            .filter(|doc| doc.read_time() > since_read_time)
            .collect();
        documents.sort_by(|a, b| a.read_time().cmp(&b.read_time()).then_with(|| a.key().cmp(b.key())));
        documents.truncate(limit);
        Ok(documents)
    }

    /// Every document read after `since_read_time` and the newest read time among them.
    pub fn get_new_document_changes(
        &self,
        txn: &PersistenceTransaction<'_>,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<(BTreeMap<DocumentKey, MutableDocument>, SnapshotVersion)> {
        let mut latest = since_read_time;
        let mut changes = BTreeMap::new();
        for document in self.scan_below(txn, &ResourcePath::root())? {
            if document.read_time() > since_read_time {
                latest = latest.max(document.read_time());
                changes.insert(document.key().clone(), document);
            }
        }
        Ok((changes, latest))
    }

    /// Approximate bytes used by cached documents.
    pub fn get_size(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        let global: Option<DbRemoteDocumentGlobal> = txn.get(REMOTE_DOCUMENT_GLOBAL_STORE, GLOBAL_KEY)?;
        Ok(global.unwrap_or_default().byte_size)
    }

    /// Deletes `key` immediately, adjusting the size total. Used by garbage collection.
    pub fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<i64> {
        let storage_key = encode_path(key.path());
        let Some(existing) = txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &storage_key)? else {
            return Ok(0);
        };
        txn.delete(REMOTE_DOCUMENTS_STORE, storage_key)?;
        self.adjust_size(txn, -existing.byte_size)?;
        Ok(existing.byte_size)
    }

    fn adjust_size(&self, txn: &mut PersistenceTransaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let size = self.get_size(txn)?;
        txn.put(
            REMOTE_DOCUMENT_GLOBAL_STORE,
            GLOBAL_KEY,
            &DbRemoteDocumentGlobal {
                byte_size: (size + delta).max(0),
            },
        )
    }

    pub fn new_change_buffer(&self) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer::default()
    }
}

/// Collects document updates for one transaction and writes them in [`Self::apply`].
#[derive(Debug, Default)]
pub struct RemoteDocumentChangeBuffer {
    changes: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentChangeBuffer {
    /// Buffers `document`, which must carry the read time it was observed at.
    pub fn add_entry(&mut self, document: MutableDocument) {
        hard_assert(
            !document.read_time().is_min(),
            0x3f1e,
            "Cannot add a document to the remote document cache without a read time",
        );
        self.changes.insert(document.key().clone(), document);
    }

    /// Buffers removal of `key`.
    pub fn remove_entry(&mut self, key: DocumentKey, read_time: SnapshotVersion) {
        let mut placeholder = MutableDocument::new_invalid_document(key.clone());
        placeholder.set_read_time(read_time);
        self.changes.insert(key, placeholder);
    }

    /// The buffered state for `key`, falling back to the cache.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        match self.changes.get(key) {
            Some(document) => Ok(document.clone()),
            None => RemoteDocumentCache.get_entry(txn, key),
        }
    }

    pub fn get_entries<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(documents)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Persists buffered changes. Invalid documents are deletions.
    pub fn apply(self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let cache = RemoteDocumentCache;
        let mut delta = 0;
        for (key, document) in self.changes {
            let storage_key = encode_path(key.path());
            let previous: Option<DbRemoteDocument> = txn.get(REMOTE_DOCUMENTS_STORE, &storage_key)?;
            delta -= previous.map(|record| record.byte_size).unwrap_or(0);
            if document.is_valid_document() {
                let byte_size = document_size(&document);
                delta += byte_size;
                txn.put(REMOTE_DOCUMENTS_STORE, storage_key, &DbRemoteDocument { document, byte_size })?;
            } else {
                txn.delete(REMOTE_DOCUMENTS_STORE, storage_key)?;
            }
        }
        cache.adjust_size(txn, delta)
    }
}

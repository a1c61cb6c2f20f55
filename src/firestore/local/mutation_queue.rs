use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::core::user::User;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::schema::{
    collection_prefix, compound_prefix, decode_stream_token, document_key_from_encoded, document_mutation_key,
    encode_path, encode_stream_token, mutation_key, mutation_queue_key, split_compound, DbMutationQueue,
    DOCUMENT_MUTATIONS_STORE, MUTATIONS_STORE, MUTATION_QUEUES_STORE,
};
use crate::firestore::local::simple_db::KeyRange;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};
use crate::util::hard_assert;

/// The queue of local writes not yet acknowledged by the server, namespaced by user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationQueue {
    user_id: String,
}

impl MutationQueue {
    pub fn for_user(user: &User) -> Self {
        Self {
            user_id: user.storage_key().to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<DbMutationQueue> {
        let metadata: Option<DbMutationQueue> = txn.get(MUTATION_QUEUES_STORE, &mutation_queue_key(&self.user_id))?;
        Ok(metadata.unwrap_or_else(|| DbMutationQueue {
            user_id: self.user_id.clone(),
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: String::new(),
        }))
    }

    fn batch_range(&self) -> KeyRange {
        KeyRange::prefix(compound_prefix(&[&self.user_id]))
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        Ok(txn.count(MUTATIONS_STORE, &self.batch_range())? == 0)
    }

    /// Batch ids are unique across all users so overlays never confuse batches.
    fn highest_batch_id(txn: &PersistenceTransaction<'_>) -> FirestoreResult<BatchId> {
        let keys = txn.scan_keys(MUTATIONS_STORE, &KeyRange::all())?;
        Ok(keys
            .iter()
            .filter_map(|key| split_compound(key).last().and_then(|id| id.parse::<BatchId>().ok()))
            .max()
            .unwrap_or(0))
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let batch_id = Self::highest_batch_id(txn)? + 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);

        let metadata = self.metadata(txn)?;
        txn.put(MUTATION_QUEUES_STORE, mutation_queue_key(&self.user_id), &metadata)?;
        txn.put(MUTATIONS_STORE, mutation_key(&self.user_id, batch_id), &batch)?;
        for mutation in &batch.mutations {
            txn.put(
                DOCUMENT_MUTATIONS_STORE,
                document_mutation_key(&self.user_id, &mutation.key, batch_id),
                &(),
            )?;
        }
        log::debug!("Queued mutation batch {batch_id} for user '{}'", self.user_id);
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get(MUTATIONS_STORE, &mutation_key(&self.user_id, batch_id))
    }

    /// The first batch with an id greater than `batch_id`, in queue order.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let after = mutation_key(&self.user_id, batch_id.max(0));
        let range = KeyRange::prefix_after(compound_prefix(&[&self.user_id]), after);
        Ok(txn
            .scan::<MutationBatch>(MUTATIONS_STORE, &range)?
            .into_iter()
            .map(|(_, batch)| batch)
            .find(|batch| batch.batch_id > batch_id))
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<BatchId> {
        Ok(txn
            .scan_keys(MUTATIONS_STORE, &self.batch_range())?
            .last()
            .and_then(|key| split_compound(key).last().and_then(|id| id.parse().ok()))
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan::<MutationBatch>(MUTATIONS_STORE, &self.batch_range())?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    fn batches_for_ids(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => crate::util::fail(
                    0x1c4f,
                    &format!("Dangling document-mutation reference found for batch {batch_id}"),
                ),
            }
        }
        Ok(batches)
    }

    fn batch_ids_for_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Vec<BatchId>> {
        let prefix = compound_prefix(&[&self.user_id, &encode_path(key.path())]);
        Ok(txn
            .scan_keys(DOCUMENT_MUTATIONS_STORE, &KeyRange::prefix(prefix))?
            .iter()
            .filter_map(|row| split_compound(row).last().and_then(|id| id.parse().ok()))
            .collect())
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let ids = self.batch_ids_for_key(txn, key)?.into_iter().collect();
        self.batches_for_ids(txn, ids)
    }

    /// Batches touching any of `keys`, each once, in batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys<'k>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut ids = BTreeSet::new();
        for key in keys {
            ids.extend(self.batch_ids_for_key(txn, key)?);
        }
        self.batches_for_ids(txn, ids)
    }

    /// Batches touching documents the query could match: its collection, collection group or
    /// single document.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            return self.get_all_mutation_batches_affecting_document_key(txn, &key);
        }

        let user_prefix = compound_prefix(&[&self.user_id]);
        let prefix = format!("{user_prefix}{}", collection_prefix(query.path()));
        let mut ids = BTreeSet::new();
        for row in txn.scan_keys(DOCUMENT_MUTATIONS_STORE, &KeyRange::prefix(prefix))? {
            let parts = split_compound(&row);
            let (Some(encoded_key), Some(batch_id)) = (parts.get(1), parts.get(2)) else {
                continue;
            };
            let key = document_key_from_encoded(encoded_key)?;
            let relevant = match query.collection_group_id() {
                Some(group) => key.has_collection_id(group),
                None => query.path().is_immediate_parent_of(key.path()),
            };
            if relevant {
                if let Ok(batch_id) = batch_id.parse() {
                    ids.insert(batch_id);
                }
            }
        }
        self.batches_for_ids(txn, ids)
    }

    pub fn remove_mutation_batch(&self, txn: &mut PersistenceTransaction<'_>, batch: &MutationBatch) -> FirestoreResult<()> {
        let batch_key = mutation_key(&self.user_id, batch.batch_id);
        hard_assert(
            txn.contains(MUTATIONS_STORE, &batch_key)?,
            0x6ad5,
            &format!("Attempted to remove unknown mutation batch {}", batch.batch_id),
        );
        txn.delete(MUTATIONS_STORE, batch_key)?;
        for mutation in &batch.mutations {
            txn.delete(
                DOCUMENT_MUTATIONS_STORE,
                document_mutation_key(&self.user_id, &mutation.key, batch.batch_id),
            )?;
        }
        Ok(())
    }

    /// Records the acknowledgement of `batch` together with the latest write stream token.
    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: &[u8],
    ) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_acknowledged_batch_id = metadata.last_acknowledged_batch_id.max(batch.batch_id);
        metadata.last_stream_token = encode_stream_token(stream_token);
        txn.put(MUTATION_QUEUES_STORE, mutation_queue_key(&self.user_id), &metadata)
    }

    pub fn get_last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<u8>> {
        Ok(decode_stream_token(&self.metadata(txn)?.last_stream_token))
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>, stream_token: &[u8]) -> FirestoreResult<()> {
        let mut metadata = self.metadata(txn)?;
        metadata.last_stream_token = encode_stream_token(stream_token);
        txn.put(MUTATION_QUEUES_STORE, mutation_queue_key(&self.user_id), &metadata)
    }

    /// An empty queue must not leave document-mutation index rows behind.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<()> {
        if !self.check_empty(txn)? {
            return Ok(());
        }
        let dangling = txn.count(DOCUMENT_MUTATIONS_STORE, &self.batch_range())?;
        hard_assert(
            dangling == 0,
            0xdd90,
            &format!("Document leak -- {dangling} document-mutation rows remain for an empty queue"),
        );
        Ok(())
    }

    /// Whether any user's queue holds a mutation for `key`.
    pub fn any_queue_contains_key(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        let queues = txn.scan::<DbMutationQueue>(MUTATION_QUEUES_STORE, &KeyRange::all())?;
        let encoded = encode_path(key.path());
        for (_, queue) in queues {
            let prefix = compound_prefix(&[&queue.user_id, &encoded]);
            if txn.count(DOCUMENT_MUTATIONS_STORE, &KeyRange::prefix(prefix))? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

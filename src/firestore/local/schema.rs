//! Object-store layout of the persisted cache: store names, key encodings, record shapes
//! and the schema upgrades between versions.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::firestore::core::target::TargetData;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::simple_db::{KeyRange, SchemaConverter, SimpleDbTransaction};
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, FieldMask, ListenSequenceNumber, MutableDocument,
    MutationBatch, Overlay, ResourcePath, SnapshotVersion, TargetId,
};

pub const SCHEMA_VERSION: u32 = 3;

pub const OWNER_STORE: &str = "owner";
pub const MUTATION_QUEUES_STORE: &str = "mutationQueues";
pub const MUTATIONS_STORE: &str = "mutations";
pub const DOCUMENT_MUTATIONS_STORE: &str = "documentMutations";
pub const REMOTE_DOCUMENTS_STORE: &str = "remoteDocuments";
pub const TARGETS_STORE: &str = "targets";
pub const TARGET_DOCUMENTS_STORE: &str = "targetDocuments";
pub const DOCUMENT_TARGETS_STORE: &str = "documentTargets";
pub const TARGET_GLOBAL_STORE: &str = "targetGlobal";
pub const DOCUMENT_OVERLAYS_STORE: &str = "documentOverlays";
pub const REMOTE_DOCUMENT_GLOBAL_STORE: &str = "remoteDocumentGlobal";
pub const BUNDLES_STORE: &str = "bundles";
pub const NAMED_QUERIES_STORE: &str = "namedQueries";
pub const INDEX_CONFIGURATION_STORE: &str = "indexConfiguration";
pub const INDEX_ENTRIES_STORE: &str = "indexEntries";

pub const OWNER_KEY: &str = "owner";
pub const GLOBAL_KEY: &str = "global";

/// Target id under which document sentinel rows are stored in `targetDocuments`.
pub const SENTINEL_TARGET_ID: TargetId = 0;

const PATH_SEPARATOR: char = '\u{1}';
const KEY_SEPARATOR: char = '\u{0}';

/// Encodes a path so that string order matches segment-wise path order.
pub fn encode_path(path: &ResourcePath) -> String {
    let mut encoded = String::new();
    for (index, segment) in path.segments().iter().enumerate() {
        if index > 0 {
            encoded.push(PATH_SEPARATOR);
        }
        encoded.push_str(segment);
    }
    encoded
}

pub fn decode_path(encoded: &str) -> ResourcePath {
    if encoded.is_empty() {
        return ResourcePath::root();
    }
    ResourcePath::from_segments(encoded.split(PATH_SEPARATOR))
}

/// Prefix shared by every document directly or transitively below `collection`.
pub fn collection_prefix(collection: &ResourcePath) -> String {
    if collection.is_empty() {
        return String::new();
    }
    let mut prefix = encode_path(collection);
    prefix.push(PATH_SEPARATOR);
    prefix
}

pub fn encode_id(id: i64) -> String {
    format!("{id:010}")
}

pub fn compound_key(parts: &[&str]) -> String {
    parts.join(&KEY_SEPARATOR.to_string())
}

pub fn compound_prefix(parts: &[&str]) -> String {
    let mut prefix = compound_key(parts);
    prefix.push(KEY_SEPARATOR);
    prefix
}

pub fn split_compound(key: &str) -> Vec<&str> {
    key.split(KEY_SEPARATOR).collect()
}

pub fn document_key_from_encoded(encoded: &str) -> FirestoreResult<DocumentKey> {
    DocumentKey::from_path(decode_path(encoded))
}

pub fn encode_stream_token(token: &[u8]) -> String {
    STANDARD.encode(token)
}

pub fn decode_stream_token(token: &str) -> Vec<u8> {
    match STANDARD.decode(token) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("Discarding unreadable stream token: {err}");
            Vec::new()
        }
    }
}

/// Holder of the primary lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbOwner {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationQueue {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    /// Base64 encoded write stream token.
    pub last_stream_token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocument {
    pub document: MutableDocument,
    pub byte_size: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRemoteDocumentGlobal {
    pub byte_size: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDocumentOverlay {
    pub collection_path: String,
    pub collection_group: String,
    pub overlay: Overlay,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTarget {
    pub canonical_id: String,
    pub target_data: TargetData,
}

/// Row of the target to document index. Sentinel rows carry the document's sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetDocument {
    pub sequence_number: Option<ListenSequenceNumber>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: i64,
}

pub fn mutation_queue_key(user_id: &str) -> String {
    user_id.to_string()
}

pub fn mutation_key(user_id: &str, batch_id: BatchId) -> String {
    compound_key(&[user_id, &encode_id(batch_id.into())])
}

pub fn document_mutation_key(user_id: &str, key: &DocumentKey, batch_id: BatchId) -> String {
    compound_key(&[user_id, &encode_path(key.path()), &encode_id(batch_id.into())])
}

pub fn document_overlay_key(user_id: &str, key: &DocumentKey) -> String {
    compound_key(&[user_id, &encode_path(key.path())])
}

pub fn target_key(target_id: TargetId) -> String {
    encode_id(target_id.into())
}

pub fn target_document_key(target_id: TargetId, key: &DocumentKey) -> String {
    compound_key(&[&encode_id(target_id.into()), &encode_path(key.path())])
}

pub fn document_target_key(key: &DocumentKey, target_id: TargetId) -> String {
    compound_key(&[&encode_path(key.path()), &encode_id(target_id.into())])
}

/// Creates the stores introduced by each schema version, migrating data where needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSchema;

impl SchemaConverter for LocalSchema {
    fn create_or_upgrade(&self, txn: &mut SimpleDbTransaction<'_>, from_version: u32, to_version: u32) -> FirestoreResult<()> {
        if from_version < 1 && to_version >= 1 {
            for store in [
                OWNER_STORE,
                MUTATION_QUEUES_STORE,
                MUTATIONS_STORE,
                DOCUMENT_MUTATIONS_STORE,
                REMOTE_DOCUMENTS_STORE,
                TARGETS_STORE,
                TARGET_DOCUMENTS_STORE,
                DOCUMENT_TARGETS_STORE,
                TARGET_GLOBAL_STORE,
            ] {
                txn.create_object_store(store)?;
            }
            txn.put(TARGET_GLOBAL_STORE, GLOBAL_KEY, &DbTargetGlobal::default())?;
        }
        if from_version < 2 && to_version >= 2 {
            for store in [
                DOCUMENT_OVERLAYS_STORE,
                REMOTE_DOCUMENT_GLOBAL_STORE,
                BUNDLES_STORE,
                NAMED_QUERIES_STORE,
            ] {
                txn.create_object_store(store)?;
            }
            compute_remote_document_size(txn)?;
            if from_version >= 1 {
                build_overlays_from_mutation_queues(txn)?;
            }
        }
        if from_version < 3 && to_version >= 3 {
            txn.create_object_store(INDEX_CONFIGURATION_STORE)?;
            txn.create_object_store(INDEX_ENTRIES_STORE)?;
        }
        Ok(())
    }
}

fn compute_remote_document_size(txn: &mut SimpleDbTransaction<'_>) -> FirestoreResult<()> {
    let documents = txn.scan::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &KeyRange::all())?;
    let byte_size = documents.iter().map(|(_, record)| record.byte_size).sum();
    txn.put(
        REMOTE_DOCUMENT_GLOBAL_STORE,
        GLOBAL_KEY,
        &DbRemoteDocumentGlobal { byte_size },
    )
}

/// Older caches kept only the mutation queue; derive one overlay per mutated document.
fn build_overlays_from_mutation_queues(txn: &mut SimpleDbTransaction<'_>) -> FirestoreResult<()> {
    let queues = txn.scan::<DbMutationQueue>(MUTATION_QUEUES_STORE, &KeyRange::all())?;
    for (_, queue) in queues {
        let batches = txn.scan::<MutationBatch>(MUTATIONS_STORE, &KeyRange::prefix(compound_prefix(&[&queue.user_id])))?;
        let mut batches_by_key: BTreeMap<DocumentKey, Vec<&MutationBatch>> = BTreeMap::new();
        for (_, batch) in &batches {
            let keys: BTreeSet<DocumentKey> = batch.keys();
            for key in keys {
                batches_by_key.entry(key).or_default().push(batch);
            }
        }
        for (key, batches) in batches_by_key {
            let mut document = txn
                .get::<DbRemoteDocument>(REMOTE_DOCUMENTS_STORE, &encode_path(key.path()))?
                .map(|record| record.document)
                .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));
            let mut mask = Some(FieldMask::empty());
            let mut largest_batch_id = 0;
            for batch in batches {
                mask = batch.apply_to_local_view(&mut document, mask);
                largest_batch_id = largest_batch_id.max(batch.batch_id);
            }
            if let Some(mutation) = calculate_overlay_mutation(&document, mask.as_ref()) {
                let collection = key.collection_path();
                txn.put(
                    DOCUMENT_OVERLAYS_STORE,
                    document_overlay_key(&queue.user_id, &key),
                    &DbDocumentOverlay {
                        collection_path: encode_path(&collection),
                        collection_group: key.collection_group().to_string(),
                        overlay: Overlay::new(largest_batch_id, mutation),
                    },
                )?;
            }
        }
    }
    Ok(())
}

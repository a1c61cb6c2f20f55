use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::rpc_error::map_grpc_status;
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded frame of the Listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means "every target".
    pub target_ids: Vec<TargetId>,
    /// Empty when the frame carried no token.
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = Some(read_time);
        self
    }

    /// The consistent-snapshot marker: no targets named, a read time present.
    pub fn is_global_snapshot(&self) -> bool {
        self.state == TargetChangeState::NoChange && self.target_ids.is_empty() && self.read_time.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document entering, changing in, or leaving targets.
///
/// `documentChange` frames carry a found document, `documentDelete` a no-document at the read
/// time, and `documentRemove` no document at all.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MutableDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<EncodedBloomFilter>,
}

/// Wire form of the bloom filter attached to an existence filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBloomFilter {
    pub bitmap: Vec<u8>,
    pub padding: u32,
    pub hash_count: u32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a Listen response. Unknown frame types decode to `None`.
pub fn decode_watch_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }

    Ok(None)
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));

    let resume_token = value
        .get("resumeToken")
        .and_then(JsonValue::as_str)
        .map(|token| {
            BASE64_STANDARD
                .decode(token)
                .map_err(|err| invalid_argument(format!("Invalid resumeToken: {err}")))
        })
        .transpose()?
        .unwrap_or_default();

    let read_time = decode_read_time(serializer, value)?;

    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| invalid_argument(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| map_grpc_status(cause.code, cause.message));

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let new_doc = serializer.decode_found_document(document)?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: new_doc.key().clone(),
        new_doc: Some(new_doc),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = decode_read_time(serializer, value)?.unwrap_or_default();

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_doc: Some(MutableDocument::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;

    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value.get("targetId").and_then(JsonValue::as_i64).unwrap_or(0) as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(decode_bloom_filter)
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn decode_bloom_filter(value: &JsonValue) -> FirestoreResult<EncodedBloomFilter> {
    let bits = value.get("bits");
    let bitmap = bits
        .and_then(|bits| bits.get("bitmap"))
        .and_then(JsonValue::as_str)
        .map(|bitmap| {
            BASE64_STANDARD
                .decode(bitmap)
                .map_err(|err| invalid_argument(format!("Invalid bloom filter bitmap: {err}")))
        })
        .transpose()?
        .unwrap_or_default();
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0) as u32;
    let hash_count = value.get("hashCount").and_then(JsonValue::as_u64).unwrap_or(0) as u32;
    Ok(EncodedBloomFilter {
        bitmap,
        padding,
        hash_count,
    })
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, frame: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{frame} missing document")))?;
    serializer.document_key_from_name(name)
}

fn decode_read_time(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Option<SnapshotVersion>> {
    value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_version(timestamp))
        .transpose()
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::test_support::{key, version};
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn decode(value: JsonValue) -> WatchChange {
        decode_watch_change(&serializer(), &value).unwrap().unwrap()
    }

    #[test]
    fn decodes_target_change() {
        let change = decode(json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        }));
        match change {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(!change.is_global_snapshot());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn global_snapshot_and_cause() {
        let snapshot = decode(json!({ "targetChange": { "readTime": "1970-01-01T00:00:07Z" } }));
        match snapshot {
            WatchChange::TargetChange(change) => {
                assert!(change.is_global_snapshot());
                assert_eq!(change.read_time, Some(version(7)));
            }
            other => panic!("unexpected change: {other:?}"),
        }

        let rejected = decode(json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" }
            }
        }));
        match rejected {
            WatchChange::TargetChange(change) => {
                let cause = change.cause.unwrap();
                assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
                assert_eq!(cause.message(), "denied");
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn document_frames_share_one_shape() {
        let changed = decode(json!({
            "documentChange": {
                "document": {
                    "name": "projects/project/databases/(default)/documents/rooms/a",
                    "fields": { "n": { "integerValue": "1" } },
                    "updateTime": "1970-01-01T00:00:03Z"
                },
                "targetIds": [2]
            }
        }));
        let WatchChange::DocumentChange(changed) = changed else {
            panic!("expected a document change");
        };
        assert_eq!(changed.key, key("rooms/a"));
        assert_eq!(changed.updated_target_ids, vec![2]);
        let doc = changed.new_doc.unwrap();
        assert!(doc.is_found_document());
        assert_eq!(doc.version(), version(3));

        let deleted = decode(json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/b",
                "readTime": "1970-01-01T00:00:04Z",
                "removedTargetIds": [2]
            }
        }));
        let WatchChange::DocumentChange(deleted) = deleted else {
            panic!("expected a document change");
        };
        assert!(deleted.new_doc.unwrap().is_no_document());
        assert_eq!(deleted.removed_target_ids, vec![2]);

        let removed = decode(json!({
            "documentRemove": {
                "document": "projects/project/databases/(default)/documents/rooms/c",
                "removedTargetIds": [2]
            }
        }));
        let WatchChange::DocumentChange(removed) = removed else {
            panic!("expected a document change");
        };
        assert!(removed.new_doc.is_none());
    }

    #[test]
    fn existence_filter_with_bloom_filter() {
        let filter = decode(json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BASE64_STANDARD.encode([0xffu8, 0x01]), "padding": 7 },
                    "hashCount": 4
                }
            }
        }));
        let WatchChange::ExistenceFilter(filter) = filter else {
            panic!("expected an existence filter");
        };
        assert_eq!(filter.count, 3);
        let bits = filter.unchanged_names.unwrap();
        assert_eq!(bits.bitmap, vec![0xff, 0x01]);
        assert_eq!(bits.padding, 7);
        assert_eq!(bits.hash_count, 4);
    }

    #[test]
    fn unknown_frames_are_skipped() {
        assert!(decode_watch_change(&serializer(), &json!({ "heartbeat": {} }))
            .unwrap()
            .is_none());
    }
}

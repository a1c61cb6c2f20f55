//! Builders shared by unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::firestore::core::query::{Direction, Filter, Operator, OrderBy, Query};
use crate::firestore::local::persistence::Persistence;
use crate::firestore::local::schema::{LocalSchema, SCHEMA_VERSION};
use crate::firestore::local::simple_db::SimpleDb;
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, ResourcePath, SnapshotVersion, TargetId,
    Timestamp,
};
use crate::firestore::remote::datastore::{NoopTokenProvider, StreamingDatastore, StreamingDatastoreImpl, TokenProviderArc};
use crate::firestore::remote::network::NetworkLayer;
use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::value::{FirestoreValue, MapValue};
use crate::platform::runtime;
use crate::util::BackoffConfig;

pub fn path(path: &str) -> ResourcePath {
    if path.is_empty() {
        return ResourcePath::root();
    }
    ResourcePath::from_segments(path.split('/'))
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document path")
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).expect("valid field path")
}

/// Snapshot version at `seconds` past the epoch.
pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

/// Converts plain JSON into a Firestore value. Integers stay integers.
pub fn value(json: Value) -> FirestoreValue {
    match json {
        Value::Null => FirestoreValue::null(),
        Value::Bool(b) => FirestoreValue::from_bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FirestoreValue::from_integer(i),
            None => FirestoreValue::from_double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => FirestoreValue::from_string(s),
        Value::Array(values) => FirestoreValue::from_array(values.into_iter().map(value).collect()),
        Value::Object(_) => FirestoreValue::from_map_value(map(json)),
    }
}

pub fn map(json: Value) -> MapValue {
    match json {
        Value::Object(fields) => {
            let fields: BTreeMap<String, FirestoreValue> = fields.into_iter().map(|(k, v)| (k, value(v))).collect();
            MapValue::new(fields)
        }
        Value::Null => MapValue::empty(),
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn doc(path: &str, version_seconds: i64, data: Value) -> MutableDocument {
    MutableDocument::new_found_document(key(path), version(version_seconds), map(data))
}

pub fn deleted_doc(path: &str, version_seconds: i64) -> MutableDocument {
    MutableDocument::new_no_document(key(path), version(version_seconds))
}

pub fn unknown_doc(path: &str, version_seconds: i64) -> MutableDocument {
    MutableDocument::new_unknown_document(key(path), version(version_seconds))
}

pub fn set_mutation(path: &str, data: Value) -> Mutation {
    Mutation::set(key(path), map(data))
}

/// Patch touching the fields present in `data`.
pub fn patch_mutation(path: &str, data: Value) -> Mutation {
    let data = map(data);
    let mask = FieldMask::new(data.field_paths());
    Mutation::patch(key(path), data, mask)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

pub fn query(path_str: &str) -> Query {
    Query::at_path(path(path_str))
}

pub fn filter(field_path: &str, op: &str, json: Value) -> Filter {
    let op = match op {
        "<" => Operator::LessThan,
        "<=" => Operator::LessThanOrEqual,
        "==" => Operator::Equal,
        "!=" => Operator::NotEqual,
        ">" => Operator::GreaterThan,
        ">=" => Operator::GreaterThanOrEqual,
        "array-contains" => Operator::ArrayContains,
        "array-contains-any" => Operator::ArrayContainsAny,
        "in" => Operator::In,
        "not-in" => Operator::NotIn,
        other => panic!("unknown operator {other}"),
    };
    Filter::field(field(field_path), op, value(json))
}

pub fn order_by(field_path: &str, direction: &str) -> OrderBy {
    let direction = match direction {
        "asc" => Direction::Ascending,
        "desc" => Direction::Descending,
        other => panic!("unknown direction {other}"),
    };
    OrderBy::new(field(field_path), direction)
}

/// In-memory persistence that already holds the primary lease.
pub async fn memory_persistence() -> Arc<Persistence> {
    let db = SimpleDb::open_in_memory("test", SCHEMA_VERSION, &LocalSchema).expect("in-memory database");
    let persistence = Persistence::with_database(Arc::new(db), "test-client", Duration::from_secs(60));
    persistence.start().await.expect("persistence starts");
    persistence
}

/// Settings for a throwaway in-memory client.
pub fn test_settings() -> FirestoreSettings {
    FirestoreSettings::new(DatabaseId::default("test-project"))
}

/// Backoff short enough for reconnect tests.
pub fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(5),
        backoff_factor: 1.5,
        max_delay: Duration::from_millis(20),
        jitter_factor: 0.0,
    }
}

/// A datastore wired to an in-process peer. The returned connection plays the backend:
/// `accept` yields each stream the client opens.
pub fn loopback_datastore() -> (Arc<dyn StreamingDatastore>, MultiplexedConnection) {
    let (client_transport, server_transport) = InMemoryTransport::pair();
    let client = Arc::new(MultiplexedConnection::new(client_transport));
    let server = MultiplexedConnection::new(server_transport);
    (Arc::new(StreamingDatastoreImpl::new(client)) as Arc<dyn StreamingDatastore>, server)
}

/// [`loopback_datastore`] behind a network layer with [`fast_backoff`].
pub fn loopback_network() -> (NetworkLayer, MultiplexedConnection) {
    let (datastore, server) = loopback_datastore();
    let layer = NetworkLayer::builder(datastore, Arc::new(NoopTokenProvider) as TokenProviderArc)
        .with_backoff(fast_backoff())
        .build();
    (layer, server)
}

/// Next JSON frame the client sent on `peer`.
pub async fn next_json(peer: &MultiplexedStream) -> Value {
    let payload = peer.next().await.expect("frame").expect("payload");
    serde_json::from_slice(&payload).expect("json")
}

pub async fn send_json(peer: &MultiplexedStream, frame: Value) {
    peer.send(serde_json::to_vec(&frame).expect("encode")).await.expect("send");
}

/// Polls `condition` for up to a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        runtime::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Watch frame delivering `path` with `fields` (plain JSON) at `seconds` to `target_ids`.
pub fn document_frame(path: &str, seconds: u32, fields: Value, target_ids: &[TargetId]) -> Value {
    let fields: serde_json::Map<String, Value> = match fields {
        Value::Object(fields) => fields
            .into_iter()
            .map(|(name, value)| (name, wire_value(value)))
            .collect(),
        _ => serde_json::Map::new(),
    };
    json!({
        "documentChange": {
            "document": {
                "name": format!("projects/test-project/databases/(default)/documents/{path}"),
                "fields": fields,
                "updateTime": format!("1970-01-01T00:00:{seconds:02}Z")
            },
            "targetIds": target_ids
        }
    })
}

fn wire_value(value: Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(values) => json!({ "arrayValue": { "values": values.into_iter().map(wire_value).collect::<Vec<_>>() } }),
        Value::Object(fields) => {
            let fields: serde_json::Map<String, Value> =
                fields.into_iter().map(|(name, value)| (name, wire_value(value))).collect();
            json!({ "mapValue": { "fields": fields } })
        }
    }
}

/// Watch frame moving every target to a consistent snapshot at `seconds`.
pub fn global_snapshot(seconds: u32) -> Value {
    json!({ "targetChange": { "readTime": format!("1970-01-01T00:00:{seconds:02}Z") } })
}

/// Watch frame acknowledging `target_ids` as added.
pub fn target_added(target_ids: &[TargetId]) -> Value {
    json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": target_ids } })
}

/// Watch frame marking `target_ids` current with a resume token.
pub fn target_current(target_ids: &[TargetId], resume_token: &str) -> Value {
    json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": target_ids, "resumeToken": resume_token } })
}

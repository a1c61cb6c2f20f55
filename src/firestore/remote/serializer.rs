use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::target::{TargetData, TargetPurpose};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, DocumentKey, FieldTransform, GeoPoint, MutableDocument, Mutation, MutationKind, MutationResult,
    Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::structured_query::encode_structured_query;
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between model types and the protobuf-JSON frames of the Listen and Write streams.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Fully qualified name for `path`; the empty path names the documents root.
    pub fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.database_id.documents_root()
        } else {
            format!("{}/{}", self.database_id.documents_root(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_string(self.database_id.relative_document_path(name)?)
    }

    pub fn encode_version(&self, version: &SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        parse_timestamp(value).map(SnapshotVersion::new)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_document_fields(&self, map: &MapValue) -> JsonValue {
        json!({
            "fields": encode_map_fields(map)
        })
    }

    pub fn decode_document_fields(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        if value.get("fields").is_some() {
            decode_map_value(value)
        } else {
            // Document exists but has no user fields.
            Ok(MapValue::empty())
        }
    }

    /// Decodes a `Document` message into a found document at its update time.
    pub fn decode_found_document(&self, value: &JsonValue) -> FirestoreResult<MutableDocument> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document is missing its name"))?;
        let key = self.document_key_from_name(name)?;
        let version = value
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .map(|timestamp| self.decode_version(timestamp))
            .transpose()?
            .ok_or_else(|| invalid_argument(format!("Document {key} is missing its updateTime")))?;
        let data = self.decode_document_fields(value)?;
        Ok(MutableDocument::new_found_document(key, version, data))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = serde_json::Map::new();
        match &mutation.kind {
            MutationKind::Set { value } => {
                write.insert("update".to_string(), self.encode_document(&mutation.key, value));
            }
            MutationKind::Patch { data, mask } => {
                write.insert("update".to_string(), self.encode_document(&mutation.key, data));
                let paths: Vec<String> = mask.fields().iter().map(|path| path.canonical_string()).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(self.document_name(&mutation.key)));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(self.document_name(&mutation.key)));
            }
        }
        if !mutation.field_transforms.is_empty() {
            let transforms = mutation
                .field_transforms
                .iter()
                .map(|transform| self.encode_field_transform(transform))
                .collect();
            write.insert("updateTransforms".to_string(), JsonValue::Array(transforms));
        }
        if let Some(precondition) = self.encode_precondition(&mutation.precondition) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    fn encode_document(&self, key: &DocumentKey, map: &MapValue) -> JsonValue {
        json!({
            "name": self.document_name(key),
            "fields": encode_map_fields(map)
        })
    }

    fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => Some(json!({ "updateTime": self.encode_version(version) })),
        }
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    /// Decodes one `WriteResult`. Writes without an update time (deletes, verifies) take the
    /// batch's commit time as their version.
    pub fn decode_write_result(&self, value: &JsonValue, commit_version: SnapshotVersion) -> FirestoreResult<MutationResult> {
        let version = value
            .get("updateTime")
            .and_then(JsonValue::as_str)
            .map(|timestamp| self.decode_version(timestamp))
            .transpose()?
            .unwrap_or(commit_version);
        let transform_results = value
            .get("transformResults")
            .and_then(JsonValue::as_array)
            .map(|values| values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(MutationResult {
            version,
            transform_results,
        })
    }

    /// Encodes the `addTarget` body for a listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> FirestoreResult<JsonValue> {
        let mut target = serde_json::Map::new();
        target.insert("targetId".to_string(), json!(target_data.target_id));

        if target_data.target.is_document_target() {
            target.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(target_data.target.path())] }),
            );
        } else {
            let (parent, structured_query) = encode_structured_query(self, &target_data.target)?;
            target.insert(
                "query".to_string(),
                json!({ "parent": parent, "structuredQuery": structured_query }),
            );
        }

        let resuming = if !target_data.resume_token.is_empty() {
            target.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
            true
        } else if !target_data.snapshot_version.is_min() {
            target.insert(
                "readTime".to_string(),
                json!(self.encode_version(&target_data.snapshot_version)),
            );
            true
        } else {
            false
        };

        if resuming {
            if let Some(expected) = target_data.expected_count {
                target.insert("expectedCount".to_string(), json!(expected));
            }
        }

        Ok(JsonValue::Object(target))
    }

    /// Listen labels that tell the backend why a target is being (re)listened.
    pub fn encode_listen_labels(&self, purpose: TargetPurpose) -> Option<BTreeMap<String, String>> {
        let label = match purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::ExistenceFilterMismatchBloom => "existence-filter-mismatch-bloom",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        let mut labels = BTreeMap::new();
        labels.insert("goog-listen-tags".to_string(), label.to_string());
        Some(labels)
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) if double.is_nan() => json!({ "doubleValue": "NaN" }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::empty()),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => {
                i64::from_str(value).map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?
            }
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(timestamp_str)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::from_base64(str_value)?));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

fn encode_timestamp(timestamp: &Timestamp) -> String {
    match Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32).single() {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Nanos, true),
        None => "1970-01-01T00:00:00.000000000Z".to_string(),
    }
}

fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime =
        DateTime::parse_from_rfc3339(value).map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

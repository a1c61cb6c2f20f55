use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, SnapshotVersion, Timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};
use crate::util::hard_assert;

/// Set of field paths touched by a write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` equals or is nested below one of the mask's fields.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with(mut self, extra: impl IntoIterator<Item = FieldPath>) -> Self {
        self.fields.extend(extra);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Result of applying the transform locally, before the server has seen it.
    pub fn apply_to_local_view(&self, previous: Option<&FirestoreValue>, local_write_time: Timestamp) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(ArrayValue::new(coerce_array(previous)).union(elements).into_values())
            }
            TransformOperation::ArrayRemove(elements) => {
                FirestoreValue::from_array(ArrayValue::new(coerce_array(previous)).remove_all(elements).into_values())
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self.compute_base_value(previous).unwrap_or_else(|| FirestoreValue::from_integer(0));
                apply_increment(&base, operand)
            }
        }
    }

    /// Result once the server acknowledged the write. Array transforms are replayed locally since
    /// the server reports no value for them.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: FirestoreValue,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::new(0, 0))
            }
            _ => server_result,
        }
    }

    /// Base value captured at write time for non-idempotent transforms.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerce_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn apply_increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(a), ValueKind::Integer(b)) => FirestoreValue::from_integer(a.saturating_add(*b)),
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

/// Outcome of a single write as reported by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    Set { value: MapValue },
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    Verify,
}

/// A single-document write. Field transforms apply after the set or patch data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: DocumentKey,
    pub kind: MutationKind,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { data, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Fields written by this mutation, or `None` when it replaces the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(
                mask.clone()
                    .union_with(self.field_transforms.iter().map(|t| t.field.clone())),
            ),
            _ => None,
        }
    }

    /// Applies this mutation to the locally cached view of `document`.
    ///
    /// Returns the accumulated mask of changed fields, where `None` means the whole document.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                apply_all(&mut data, transform_results);
                let version = document.version();
                document.convert_to_found_document(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { data, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut merged = document.data().clone();
                apply_patch(&mut merged, data, mask);
                apply_all(&mut merged, transform_results);
                let version = document.version();
                document.convert_to_found_document(version, merged).set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields().iter().cloned())
                        .union_with(self.field_transforms.iter().map(|t| t.field.clone()))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies this mutation to the remote version of `document` after the server acknowledged it.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = value.clone();
                apply_all(&mut data, transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut merged = document.data().clone();
                apply_patch(&mut merged, data, mask);
                apply_all(&mut merged, transform_results);
                document
                    .convert_to_found_document(result.version, merged)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {
                crate::util::fail(0x2a1c, "Verify mutations cannot be applied to remote documents");
            }
        }
    }

    /// Base values for non-idempotent transforms, captured from the document as the user saw it.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        let mut found = false;
        for transform in &self.field_transforms {
            let previous = document.field(&transform.field);
            if let Some(value) = transform.operation.compute_base_value(previous) {
                base.set(&transform.field, value);
                found = true;
            }
        }
        found.then_some(base)
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(&transform.field);
                (
                    transform.field.clone(),
                    transform.operation.apply_to_local_view(previous, local_write_time),
                )
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        results: &[FirestoreValue],
    ) -> Vec<(FieldPath, FirestoreValue)> {
        hard_assert(
            results.len() == self.field_transforms.len(),
            0x1b3d,
            format!(
                "server transform result count ({}) should match field transform count ({})",
                results.len(),
                self.field_transforms.len()
            ),
        );
        self.field_transforms
            .iter()
            .zip(results.iter())
            .map(|(transform, result)| {
                let previous = document.field(&transform.field);
                (
                    transform.field.clone(),
                    transform.operation.apply_to_remote_document(previous, result.clone()),
                )
            })
            .collect()
    }
}

fn apply_patch(target: &mut MapValue, data: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match data.get(path) {
            Some(value) => target.set(path, value.clone()),
            None => target.delete(path),
        }
    }
}

fn apply_all(target: &mut MapValue, values: Vec<(FieldPath, FirestoreValue)>) {
    for (path, value) in values {
        target.set(&path, value);
    }
}

/// Collapses the local view of `document` into a single overlay mutation.
///
/// `mask` is the set of fields changed by pending mutations (`None` for whole-document writes).
/// Returns `None` when the document carries no local mutations.
pub fn calculate_overlay_mutation(document: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let mask = match mask {
        None => {
            return Some(if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            });
        }
        Some(mask) if mask.is_empty() => return None,
        Some(mask) => mask,
    };

    let mut patch_value = MapValue::empty();
    let mut mask_set: BTreeSet<FieldPath> = BTreeSet::new();
    for field in mask.fields() {
        if mask_set.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = document.field(&path).cloned();
        if value.is_none() {
            // A deleted nested field is expressed by patching its parent.
            if let Some(parent) = path.parent() {
                value = document.field(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        mask_set.insert(path);
    }
    Some(
        Mutation::patch(document.key().clone(), patch_value, FieldMask::new(mask_set))
            .with_precondition(Precondition::None),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("coll/doc").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut fields = BTreeMap::new();
        for (k, v) in entries {
            fields.insert((*k).to_string(), v.clone());
        }
        MapValue::new(fields)
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_on_missing_document_creates_it() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mutation = Mutation::set(key(), map(&[("a", FirestoreValue::from_integer(1))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.is_found_document());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            map(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(doc.is_no_document());
    }

    #[test]
    fn patch_merges_and_deletes_masked_fields() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a", FirestoreValue::from_integer(1)), ("b", FirestoreValue::from_integer(2))]),
        );
        let mutation = Mutation::patch(
            key(),
            map(&[("c", FirestoreValue::from_integer(3))]),
            FieldMask::new([path("b"), path("c")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        assert_eq!(mask.fields().len(), 2);
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(1)));
        assert!(doc.field(&path("b")).is_none());
        assert_eq!(doc.field(&path("c")), Some(&FirestoreValue::from_integer(3)));
    }

    #[test]
    fn increment_transform_uses_base_value() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("count", FirestoreValue::from_integer(5))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_transform(path("count"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)));
        let base = mutation.extract_transform_base_value(&doc).unwrap();
        assert_eq!(base.get(&path("count")), Some(&FirestoreValue::from_integer(5)));

        mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(doc.field(&path("count")), Some(&FirestoreValue::from_integer(7)));
    }

    #[test]
    fn array_transforms_deduplicate() {
        let previous = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]);
        let union = TransformOperation::ArrayUnion(vec![FirestoreValue::from_integer(2), FirestoreValue::from_integer(3)]);
        let remove = TransformOperation::ArrayRemove(vec![FirestoreValue::from_integer(1)]);
        let now = Timestamp::now();
        assert_eq!(
            union.apply_to_local_view(Some(&previous), now),
            FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(2),
                FirestoreValue::from_integer(3)
            ])
        );
        assert_eq!(
            remove.apply_to_local_view(Some(&previous), now),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(2)])
        );
    }

    #[test]
    fn acknowledged_patch_on_unknown_document_becomes_unknown() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mutation = Mutation::patch(
            key(),
            map(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new([path("a")]),
        );
        mutation.apply_to_remote_document(
            &mut doc,
            &MutationResult {
                version: version(9),
                transform_results: Vec::new(),
            },
        );
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(9));
    }

    #[test]
    fn delete_then_set_overlay_is_a_set() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a", FirestoreValue::from_integer(1))]),
        );
        let delete = Mutation::delete(key());
        let set = Mutation::set(key(), map(&[("b", FirestoreValue::from_integer(2))]));
        let now = Timestamp::now();
        let mask = delete.apply_to_local_view(&mut doc, Some(FieldMask::empty()), now);
        let mask = set.apply_to_local_view(&mut doc, mask, now);

        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert_eq!(
            overlay.kind,
            MutationKind::Set {
                value: map(&[("b", FirestoreValue::from_integer(2))])
            }
        );
    }

    #[test]
    fn patch_overlay_uses_parent_for_deleted_nested_field() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a", FirestoreValue::from_map(BTreeMap::new()))]),
        );
        doc.set_has_local_mutations();
        let mask = FieldMask::new([path("a.b")]);
        let overlay = calculate_overlay_mutation(&doc, Some(&mask)).unwrap();
        match overlay.kind {
            MutationKind::Patch { mask, .. } => {
                assert!(mask.fields().contains(&path("a")));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }
}

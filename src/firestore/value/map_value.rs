use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// An object value. Doubles as the data of a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a possibly nested field.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = self;
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            let value = current.fields.get(segment)?;
            if index + 1 == segments.len() {
                return Some(value);
            }
            current = value.as_map()?;
        }
        None
    }

    /// Writes a nested field, creating (or replacing non-map) intermediate values as maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let segments = path.segments();
        let mut current = self;
        for segment in &segments[..segments.len() - 1] {
            let entry = current
                .fields
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map_value(MapValue::empty());
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => return,
            };
        }
        current
            .fields
            .insert(path.last_segment().to_string(), value);
    }

    /// Removes a nested field. Missing intermediate maps make this a no-op.
    pub fn delete(&mut self, path: &FieldPath) {
        let segments = path.segments();
        let mut current = self;
        for segment in &segments[..segments.len() - 1] {
            current = match current.fields.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(map) => map,
                None => return,
            };
        }
        current.fields.remove(path.last_segment());
    }

    /// Leaf field paths of this object. Empty nested maps count as leaves.
    pub fn field_paths(&self) -> BTreeSet<FieldPath> {
        let mut paths = BTreeSet::new();
        collect_field_paths(self, None, &mut paths);
        paths
    }
}

fn collect_field_paths(map: &MapValue, prefix: Option<&FieldPath>, out: &mut BTreeSet<FieldPath>) {
    for (key, value) in &map.fields {
        let path = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            None => match FieldPath::new([key.clone()]) {
                Ok(path) => path,
                Err(_) => continue,
            },
        };
        match value.kind() {
            ValueKind::Map(nested) if !nested.is_empty() => collect_field_paths(nested, Some(&path), out),
            _ => {
                out.insert(path);
            }
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::DocumentKey;

/// Bidirectional index between documents and the ids (targets or batches) referencing them.
///
/// Used for in-memory pins: documents held by local views and limbo resolutions must not be
/// garbage collected even if no persisted target references them.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<i32>>,
    by_id: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.entry(id).or_default().insert(key.clone());
        self.by_key.entry(key).or_default().insert(id);
    }

    pub fn add_references(&mut self, keys: impl IntoIterator<Item = DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        if let Some(ids) = self.by_key.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(key);
            }
        }
        if let Some(keys) = self.by_id.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_id.remove(&id);
            }
        }
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Clears all references held by `id` and returns the keys that were referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.by_id.remove(&id).unwrap_or_default();
        for key in &keys {
            if let Some(ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        self.by_id.clear();
        std::mem::take(&mut self.by_key).into_keys().collect()
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id.get(&id).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_in_both_directions() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("a/1"), 2);
        set.add_reference(key("a/1"), 4);
        set.add_reference(key("a/2"), 2);

        assert!(set.contains_key(&key("a/1")));
        assert_eq!(set.references_for_id(2).len(), 2);

        set.remove_reference(&key("a/1"), 2);
        assert!(set.contains_key(&key("a/1")));
        set.remove_reference(&key("a/1"), 4);
        assert!(!set.contains_key(&key("a/1")));
    }

    #[test]
    fn removing_an_id_releases_its_keys() {
        let mut set = ReferenceSet::new();
        set.add_references([key("a/1"), key("a/2")], 6);
        set.add_reference(key("a/2"), 8);

        let removed = set.remove_references_for_id(6);
        assert_eq!(removed.len(), 2);
        assert!(!set.contains_key(&key("a/1")));
        assert!(set.contains_key(&key("a/2")));

        assert_eq!(set.remove_all_references().len(), 1);
        assert!(set.is_empty());
    }
}

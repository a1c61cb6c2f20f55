use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey};

/// Documents kept in query order, with lookup by key.
///
/// The order comes from [`Query::compare_documents`], which always ends with the document
/// key, so two different documents never compare equal.
#[derive(Clone)]
pub struct DocumentSet {
    ordering: Arc<Query>,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(ordering: Arc<Query>) -> Self {
        Self {
            ordering,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    /// Documents in query order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.sorted.iter().map(|document| document.key())
    }

    pub fn compare(&self, left: &Document, right: &Document) -> std::cmp::Ordering {
        self.ordering.compare_documents(left, right)
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn add(&mut self, document: Document) {
        self.delete(document.key());
        let position = self
            .sorted
            .binary_search_by(|probe| self.ordering.compare_documents(probe, &document))
            .unwrap_or_else(|position| position);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(position, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        let Some(existing) = self.by_key.remove(key) else {
            return;
        };
        if let Ok(position) = self
            .sorted
            .binary_search_by(|probe| self.ordering.compare_documents(probe, &existing))
        {
            self.sorted.remove(position);
        } else {
            self.sorted.retain(|document| document.key() != key);
        }
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

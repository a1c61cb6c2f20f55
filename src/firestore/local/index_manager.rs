use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{FieldFilter, Operator};
use crate::firestore::core::target::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::schema::{
    compound_key, compound_prefix, document_key_from_encoded, encode_id, encode_path, split_compound,
    INDEX_CONFIGURATION_STORE, INDEX_ENTRIES_STORE,
};
use crate::firestore::local::simple_db::KeyRange;
use crate::firestore::model::{DocumentKey, FieldPath, ListenSequenceNumber, MutableDocument, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, ValueKind};
use crate::platform::runtime::{sleep, spawn_detached};

const DOCUMENT_ROWS: &str = "doc";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexKind {
    /// Orders documents by the field value; serves equality, `in` and range filters.
    Ascending,
    /// One entry per array element; serves `array-contains` and `array-contains-any`.
    Contains,
}

/// How far the backfiller got for an index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexState {
    /// Remote documents read at or before this version have entries.
    pub read_time: SnapshotVersion,
    /// Sequence number of the last backfill pass that touched the index.
    pub sequence_number: ListenSequenceNumber,
    /// Whether the initial backfill completed and queries may use the index.
    pub ready: bool,
}

impl Default for IndexState {
    fn default() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            sequence_number: 0,
            ready: false,
        }
    }
}

/// A persisted single-field index over one collection group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub field: FieldPath,
    pub kind: IndexKind,
    pub state: IndexState,
}

/// Candidate documents produced by an index scan.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexScan {
    pub index_id: i32,
    pub keys: BTreeSet<DocumentKey>,
    /// Documents read after this version may be missing from `keys`.
    pub read_time: SnapshotVersion,
}

/// Encodes `value` so that string order matches value order within an index.
///
/// Only scalar types are indexable; NaN, references, geo points, arrays and maps yield `None`.
pub fn encode_index_value(value: &FirestoreValue) -> Option<String> {
    let encoded = match value.kind() {
        ValueKind::Null => "0".to_string(),
        ValueKind::Boolean(b) => format!("1{}", u8::from(*b)),
        ValueKind::Integer(i) => format!("2{}", encode_double(*i as f64)),
        ValueKind::Double(d) if d.is_nan() => return None,
        ValueKind::Double(d) => format!("2{}", encode_double(*d)),
        ValueKind::Timestamp(t) => format!("3{:016x}{:08x}", (t.seconds as u64) ^ (1 << 63), t.nanos),
        ValueKind::String(s) => format!("4{}", escape_string(s)),
        ValueKind::Bytes(b) => format!("5{}", b.to_hex()),
        _ => return None,
    };
    Some(encoded)
}

fn encode_double(value: f64) -> String {
    // -0.0 and 0.0 compare equal in queries.
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    format!("{ordered:016x}")
}

fn escape_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\u{0}' => escaped.push_str("\u{1}\u{1}"),
            '\u{1}' => escaped.push_str("\u{1}\u{2}"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn entry_prefix(index_id: i32) -> String {
    compound_prefix(&[&encode_id(index_id as i64)])
}

fn entry_key(index_id: i32, encoded_value: &str, key: &DocumentKey) -> String {
    compound_key(&[&encode_id(index_id as i64), encoded_value, &encode_path(key.path())])
}

fn document_row_key(index_id: i32, key: &DocumentKey) -> String {
    compound_key(&[DOCUMENT_ROWS, &encode_id(index_id as i64), &encode_path(key.path())])
}

fn serves(kind: IndexKind, op: Operator) -> bool {
    match kind {
        IndexKind::Ascending => matches!(
            op,
            Operator::Equal
                | Operator::In
                | Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
        ),
        IndexKind::Contains => matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny),
    }
}

/// Values looked up by a filter, each already encoded; `None` if one is not indexable.
fn filter_values(filter: &FieldFilter) -> Option<Vec<String>> {
    match filter.op {
        Operator::In | Operator::ArrayContainsAny => filter
            .value
            .as_array()?
            .values()
            .iter()
            .map(encode_index_value)
            .collect(),
        _ => Some(vec![encode_index_value(&filter.value)?]),
    }
}

/// The collection group a target reads from, if it reads a collection.
fn target_collection_group(target: &Target) -> Option<&str> {
    match target.collection_group() {
        Some(group) => Some(group),
        None if target.is_document_target() => None,
        None => target.path().last_segment(),
    }
}

/// Manages field index definitions and their entries.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    /// Defines an index; an identical existing definition is returned unchanged.
    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        field: &FieldPath,
        kind: IndexKind,
    ) -> FirestoreResult<FieldIndex> {
        let existing = self.get_field_indexes(txn, Some(collection_group))?;
        if let Some(index) = existing.into_iter().find(|i| &i.field == field && i.kind == kind) {
            return Ok(index);
        }

        let next_id = self
            .get_field_indexes(txn, None)?
            .iter()
            .map(|index| index.index_id)
            .max()
            .unwrap_or(0)
            + 1;
        let index = FieldIndex {
            index_id: next_id,
            collection_group: collection_group.to_string(),
            field: field.clone(),
            kind,
            state: IndexState::default(),
        };
        txn.put(INDEX_CONFIGURATION_STORE, encode_id(next_id as i64), &index)?;
        log::debug!(
            "created {:?} index {} on {}.{}",
            kind,
            next_id,
            collection_group,
            field.canonical_string()
        );
        Ok(index)
    }

    /// Removes an index definition together with all of its entries.
    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction<'_>, index_id: i32) -> FirestoreResult<()> {
        txn.delete(INDEX_CONFIGURATION_STORE, encode_id(index_id as i64))?;
        txn.delete_range(INDEX_ENTRIES_STORE, &KeyRange::prefix(entry_prefix(index_id)))?;
        txn.delete_range(
            INDEX_ENTRIES_STORE,
            &KeyRange::prefix(compound_prefix(&[DOCUMENT_ROWS, &encode_id(index_id as i64)])),
        )?;
        Ok(())
    }

    /// All index definitions, or those of one collection group.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: Option<&str>,
    ) -> FirestoreResult<Vec<FieldIndex>> {
        Ok(txn
            .scan::<FieldIndex>(INDEX_CONFIGURATION_STORE, &KeyRange::all())?
            .into_iter()
            .map(|(_, index)| index)
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .collect())
    }

    fn save_field_index(&self, txn: &mut PersistenceTransaction<'_>, index: &FieldIndex) -> FirestoreResult<()> {
        txn.put(INDEX_CONFIGURATION_STORE, encode_id(index.index_id as i64), index)
    }

    /// A ready index able to narrow the candidates of `target`, with the filter it serves.
    ///
    /// Equality-style filters win over range filters; an index on an order-by field is the last
    /// resort. Disjunctions are never served.
    pub fn get_field_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<(FieldIndex, Option<FieldFilter>)>> {
        let Some(group) = target_collection_group(target) else {
            return Ok(None);
        };
        let indexes: Vec<FieldIndex> = self
            .get_field_indexes(txn, Some(group))?
            .into_iter()
            .filter(|index| index.state.ready)
            .collect();
        if indexes.is_empty() {
            return Ok(None);
        }

        let mut filters = Vec::new();
        for filter in target.filters() {
            match filter.conjunction() {
                Some(conjunction) => filters.extend(conjunction),
                None => return Ok(None),
            }
        }
        let usable = |filter: &FieldFilter| {
            if filter.field.is_key_field() || filter_values(filter).is_none() {
                return None;
            }
            indexes
                .iter()
                .find(|index| index.field == filter.field && serves(index.kind, filter.op))
                .cloned()
        };

        let (equalities, ranges): (Vec<&FieldFilter>, Vec<&FieldFilter>) =
            filters.into_iter().partition(|filter| !filter.op.is_inequality());
        for filter in equalities.into_iter().chain(ranges) {
            if let Some(index) = usable(filter) {
                return Ok(Some((index, Some(filter.clone()))));
            }
        }

        for order in target.order_by() {
            if let Some(index) = indexes
                .iter()
                .find(|index| index.field == order.field && index.kind == IndexKind::Ascending)
            {
                return Ok(Some((index.clone(), None)));
            }
        }
        Ok(None)
    }

    /// Candidate keys for `target` from a ready index, or `None` when no index applies.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<IndexScan>> {
        let Some((index, filter)) = self.get_field_index(txn, target)? else {
            return Ok(None);
        };

        let prefix = entry_prefix(index.index_id);
        let mut keys = BTreeSet::new();
        let mut collect = |range: KeyRange, accept: &dyn Fn(&str) -> bool| -> FirestoreResult<()> {
            for row in txn.scan_keys(INDEX_ENTRIES_STORE, &range)? {
                let parts = split_compound(&row);
                if parts.len() == 3 && accept(parts[1]) {
                    keys.insert(document_key_from_encoded(parts[2])?);
                }
            }
            Ok(())
        };

        match filter {
            None => collect(KeyRange::prefix(prefix.clone()), &|_| true)?,
            Some(filter) => {
                // filter_values succeeded when the index was chosen.
                let values = filter_values(&filter).unwrap_or_default();
                if filter.op.is_inequality() {
                    for encoded in values {
                        let type_prefix = format!("{prefix}{}", &encoded[..1]);
                        let op = filter.op;
                        collect(KeyRange::prefix(type_prefix), &move |candidate| match op {
                            Operator::LessThan => candidate < encoded.as_str(),
                            Operator::LessThanOrEqual => candidate <= encoded.as_str(),
                            Operator::GreaterThan => candidate > encoded.as_str(),
                            _ => candidate >= encoded.as_str(),
                        })?;
                    }
                } else {
                    for encoded in values {
                        let value_prefix = compound_prefix(&[&encode_id(index.index_id as i64), &encoded]);
                        collect(KeyRange::prefix(value_prefix), &|_| true)?;
                    }
                }
            }
        }

        Ok(Some(IndexScan {
            index_id: index.index_id,
            keys,
            read_time: index.state.read_time,
        }))
    }

    /// Rewrites the entries of every index in the documents' collection groups.
    pub fn update_index_entries<'d>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: impl IntoIterator<Item = &'d MutableDocument>,
    ) -> FirestoreResult<()> {
        let mut by_group: BTreeMap<String, Vec<FieldIndex>> = BTreeMap::new();
        for document in documents {
            let group = document.key().collection_group().to_string();
            if !by_group.contains_key(&group) {
                let indexes = self.get_field_indexes(txn, Some(&group))?;
                by_group.insert(group.clone(), indexes);
            }
            let indexes = by_group.get(&group).cloned().unwrap_or_default();
            for index in &indexes {
                self.update_entries_for_document(txn, index, document)?;
            }
        }
        Ok(())
    }

    fn update_entries_for_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        index: &FieldIndex,
        document: &MutableDocument,
    ) -> FirestoreResult<()> {
        let key = document.key();
        let row_key = document_row_key(index.index_id, key);
        let previous: Option<Vec<String>> = txn.get(INDEX_ENTRIES_STORE, &row_key)?;
        for encoded in previous.unwrap_or_default() {
            txn.delete(INDEX_ENTRIES_STORE, entry_key(index.index_id, &encoded, key))?;
        }

        let mut values = BTreeSet::new();
        if document.is_found_document() {
            match (index.kind, document.field(&index.field)) {
                (IndexKind::Ascending, Some(value)) => values.extend(encode_index_value(value)),
                (IndexKind::Contains, Some(value)) => {
                    if let Some(array) = value.as_array() {
                        values.extend(array.values().iter().filter_map(encode_index_value));
                    }
                }
                (_, None) => {}
            }
        }

        if values.is_empty() {
            txn.delete(INDEX_ENTRIES_STORE, row_key)?;
            return Ok(());
        }
        for encoded in &values {
            txn.put(INDEX_ENTRIES_STORE, entry_key(index.index_id, encoded, key), &())?;
        }
        let values: Vec<String> = values.into_iter().collect();
        txn.put(INDEX_ENTRIES_STORE, row_key, &values)
    }

    /// Defines indexes for every indexable filter of `target`. They become usable after a backfill.
    pub fn create_target_indexes(&self, txn: &mut PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<usize> {
        let Some(group) = target_collection_group(target).map(str::to_string) else {
            return Ok(0);
        };
        let mut created = 0;
        for filter in target.filters().iter().flat_map(|f| f.flattened()) {
            if filter.field.is_key_field() {
                continue;
            }
            let kind = match filter.op {
                Operator::ArrayContains | Operator::ArrayContainsAny => IndexKind::Contains,
                op if serves(IndexKind::Ascending, op) => IndexKind::Ascending,
                _ => continue,
            };
            let before = self.get_field_indexes(txn, Some(&group))?.len();
            self.add_field_index(txn, &group, &filter.field, kind)?;
            if self.get_field_indexes(txn, Some(&group))?.len() > before {
                created += 1;
            }
        }
        Ok(created)
    }
}

/// Populates index entries from the remote document cache in read-time order.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexBackfiller {
    index_manager: IndexManager,
    remote_documents: RemoteDocumentCache,
}

impl IndexBackfiller {
    pub fn new(index_manager: IndexManager, remote_documents: RemoteDocumentCache) -> Self {
        Self {
            index_manager,
            remote_documents,
        }
    }

    /// Indexes up to about `max_documents` documents, least recently backfilled collection groups
    /// first. Returns the number of documents processed.
    pub fn backfill(&self, txn: &mut PersistenceTransaction<'_>, max_documents: usize) -> FirestoreResult<usize> {
        let mut groups: BTreeMap<String, Vec<FieldIndex>> = BTreeMap::new();
        for index in self.index_manager.get_field_indexes(txn, None)? {
            groups.entry(index.collection_group.clone()).or_default().push(index);
        }
        let mut ordered: Vec<(String, Vec<FieldIndex>)> = groups.into_iter().collect();
        ordered.sort_by_key(|(_, indexes)| indexes.iter().map(|i| i.state.sequence_number).min().unwrap_or(0));

        let sequence_number = txn.current_sequence_number();
        let mut processed = 0;
        for (group, indexes) in ordered {
            if processed >= max_documents {
                break;
            }
            processed += self.backfill_group(txn, &group, indexes, max_documents - processed, sequence_number)?;
        }
        if processed > 0 {
            log::debug!("index backfill processed {processed} documents");
        }
        Ok(processed)
    }

    fn backfill_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        group: &str,
        indexes: Vec<FieldIndex>,
        budget: usize,
        sequence_number: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        let offset = indexes
            .iter()
            .map(|index| index.state.read_time)
            .min()
            .unwrap_or_else(SnapshotVersion::min);
        let mut documents = self
            .remote_documents
            .get_all_from_collection_group(txn, group, offset, usize::MAX)?;

        // Stop on a read time boundary so the new offset never skips documents.
        let exhausted = documents.len() <= budget;
        if !exhausted {
            let first_excluded = documents[budget].read_time();
            let mut cut = budget;
            while cut > 0 && documents[cut - 1].read_time() == first_excluded {
                cut -= 1;
            }
            if cut == 0 {
                cut = documents.iter().take_while(|d| d.read_time() == first_excluded).count();
            }
            documents.truncate(cut);
        }

        for index in &indexes {
            for document in documents.iter().filter(|d| d.read_time() > index.state.read_time) {
                self.index_manager.update_entries_for_document(txn, index, document)?;
            }
        }

        let new_read_time = documents.last().map(|d| d.read_time()).unwrap_or(offset);
        let complete = exhausted;
        for mut index in indexes {
            index.state.read_time = index.state.read_time.max(new_read_time);
            index.state.sequence_number = sequence_number;
            if complete {
                index.state.ready = true;
            }
            self.index_manager.save_field_index(txn, &index)?;
        }
        Ok(documents.len())
    }
}

/// Periodically backfills index entries while this client is primary.
pub struct IndexBackfillScheduler {
    initial_delay: Duration,
    regular_delay: Duration,
    stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl IndexBackfillScheduler {
    pub fn new(initial_delay: Duration, regular_delay: Duration) -> Self {
        Self {
            initial_delay,
            regular_delay,
            stop: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.stop.lock().unwrap().is_some()
    }

    pub fn start(&self, local_store: Weak<LocalStore>) {
        let mut guard = self.stop.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        *guard = Some(stop.clone());

        let initial_delay = self.initial_delay;
        let regular_delay = self.regular_delay;
        spawn_detached(async move {
            sleep(initial_delay).await;
            while !stop.load(Ordering::SeqCst) {
                let Some(store) = local_store.upgrade() else {
                    break;
                };
                if store.is_primary() {
                    match store.backfill_indexes(store.index_backfill_max_documents()).await {
                        Ok(processed) => log::debug!("Index backfill processed {processed} documents"),
                        Err(err) => log::warn!("Ignoring storage error during index backfill: {err}"),
                    }
                }
                drop(store);
                sleep(regular_delay).await;
            }
        });
    }

    pub fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap().take() {
            stop.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for IndexBackfillScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::test_support::{doc, field, filter, key, memory_persistence, order_by, query, value};
    use serde_json::json;

    fn store(txn: &mut PersistenceTransaction<'_>, docs: Vec<MutableDocument>) -> FirestoreResult<()> {
        let mut buffer = RemoteDocumentCache::new().new_change_buffer();
        for mut document in docs {
            let read_time = document.version();
            document.set_read_time(read_time);
            buffer.add_entry(document);
        }
        buffer.apply(txn)
    }

    #[test]
    fn encoding_preserves_order() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-10.5),
            json!(-1),
            json!(0),
            json!(2),
            json!(2.5),
            json!(1000),
            json!(""),
            json!("a"),
            json!("a\u{0}"),
            json!("ab"),
            json!("b"),
        ];
        let encoded: Vec<String> = ordered
            .iter()
            .map(|j| encode_index_value(&value(j.clone())).unwrap())
            .collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1], "{:?} should sort before {:?}", pair[0], pair[1]);
        }
        assert_eq!(
            encode_index_value(&FirestoreValue::from_double(-0.0)),
            encode_index_value(&FirestoreValue::from_integer(0))
        );
        assert!(encode_index_value(&FirestoreValue::from_double(f64::NAN)).is_none());
        assert!(encode_index_value(&value(json!([1]))).is_none());
    }

    #[tokio::test]
    async fn backfill_marks_index_ready_and_serves_filters() {
        let persistence = memory_persistence().await;
        let manager = IndexManager::new();
        let backfiller = IndexBackfiller::new(manager, RemoteDocumentCache::new());
        persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                store(
                    txn,
                    vec![
                        doc("rooms/a", 1, json!({"size": 1, "tags": ["x", "y"]})),
                        doc("rooms/b", 2, json!({"size": 5, "tags": ["y"]})),
                        doc("rooms/c", 3, json!({"size": "big"})),
                        doc("lobby/d", 3, json!({"size": 5})),
                    ],
                )?;
                manager.add_field_index(txn, "rooms", &field("size"), IndexKind::Ascending)?;
                manager.add_field_index(txn, "rooms", &field("tags"), IndexKind::Contains)?;

                let target = query("rooms").with_filter(filter("size", "==", json!(5))).to_target();
                assert!(manager.get_documents_matching_target(txn, &target)?.is_none());

                assert_eq!(backfiller.backfill(txn, 100)?, 3);
                assert!(manager.get_field_indexes(txn, Some("rooms"))?.iter().all(|i| i.state.ready));

                let scan = manager.get_documents_matching_target(txn, &target)?.unwrap();
                assert_eq!(scan.keys, [key("rooms/b")].into_iter().collect());
                assert_eq!(scan.read_time, crate::firestore::test_support::version(3));

                let range = query("rooms").with_filter(filter("size", ">", json!(1))).to_target();
                let scan = manager.get_documents_matching_target(txn, &range)?.unwrap();
                assert_eq!(scan.keys, [key("rooms/b")].into_iter().collect());

                let contains = query("rooms")
                    .with_filter(filter("tags", "array-contains", json!("y")))
                    .to_target();
                let scan = manager.get_documents_matching_target(txn, &contains)?.unwrap();
                assert_eq!(scan.keys.len(), 2);

                let ordered = query("rooms").with_order_by(order_by("size", "asc")).to_target();
                let scan = manager.get_documents_matching_target(txn, &ordered)?.unwrap();
                assert_eq!(scan.keys.len(), 3);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn entries_follow_document_updates() {
        let persistence = memory_persistence().await;
        let manager = IndexManager::new();
        persistence
            .run_transaction("update", TransactionMode::ReadWrite, |txn| {
                let index = manager.add_field_index(txn, "rooms", &field("size"), IndexKind::Ascending)?;
                manager.update_index_entries(txn, [&doc("rooms/a", 1, json!({"size": 1}))])?;
                manager.update_index_entries(txn, [&doc("rooms/a", 2, json!({"size": 2}))])?;

                let mut ready = index.clone();
                ready.state.ready = true;
                manager.save_field_index(txn, &ready)?;

                let old = query("rooms").with_filter(filter("size", "==", json!(1))).to_target();
                assert!(manager.get_documents_matching_target(txn, &old)?.unwrap().keys.is_empty());
                let new = query("rooms").with_filter(filter("size", "in", json!([2, 3]))).to_target();
                assert_eq!(manager.get_documents_matching_target(txn, &new)?.unwrap().keys.len(), 1);

                manager.delete_field_index(txn, index.index_id)?;
                assert!(manager.get_field_indexes(txn, None)?.is_empty());
                assert!(txn.scan_keys(INDEX_ENTRIES_STORE, &KeyRange::all())?.is_empty());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn target_indexes_skip_disjunctions_and_key_filters() {
        let persistence = memory_persistence().await;
        let manager = IndexManager::new();
        persistence
            .run_transaction("auto", TransactionMode::ReadWrite, |txn| {
                let target = query("rooms")
                    .with_filter(filter("size", ">=", json!(2)))
                    .with_filter(filter("tags", "array-contains", json!("x")))
                    .with_filter(filter("name", "!=", json!("z")))
                    .to_target();
                assert_eq!(manager.create_target_indexes(txn, &target)?, 2);
                assert_eq!(manager.create_target_indexes(txn, &target)?, 0);

                let kinds: BTreeSet<_> = manager
                    .get_field_indexes(txn, Some("rooms"))?
                    .into_iter()
                    .map(|i| (i.field.canonical_string(), i.kind))
                    .collect();
                assert!(kinds.contains(&("size".to_string(), IndexKind::Ascending)));
                assert!(kinds.contains(&("tags".to_string(), IndexKind::Contains)));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backfill_respects_budget_at_read_time_boundaries() {
        let persistence = memory_persistence().await;
        let manager = IndexManager::new();
        let backfiller = IndexBackfiller::new(manager, RemoteDocumentCache::new());
        persistence
            .run_transaction("budget", TransactionMode::ReadWrite, |txn| {
                store(
                    txn,
                    vec![
                        doc("rooms/a", 1, json!({"size": 1})),
                        doc("rooms/b", 2, json!({"size": 2})),
                        doc("rooms/c", 2, json!({"size": 3})),
                        doc("rooms/d", 3, json!({"size": 4})),
                    ],
                )?;
                manager.add_field_index(txn, "rooms", &field("size"), IndexKind::Ascending)?;

                assert_eq!(backfiller.backfill(txn, 2)?, 1);
                assert!(!manager.get_field_indexes(txn, None)?[0].state.ready);
                assert_eq!(backfiller.backfill(txn, 2)?, 2);
                assert_eq!(backfiller.backfill(txn, 2)?, 1);
                assert!(manager.get_field_indexes(txn, None)?[0].state.ready);
                Ok(())
            })
            .await
            .unwrap();
    }
}

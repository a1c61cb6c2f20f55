use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::core::target::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};
use crate::util::hard_assert;

/// Provides metadata about active targets so the aggregator can reason about
/// existing documents.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for an active listen, `None` once the target was unlistened.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Per-target accumulation between two consistent snapshots.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests. Changes for the target are ignored while non-zero.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// Starts true so a freshly added target is reported in the next event.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            0x0ca9,
            "pending target responses must not go negative",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds watch frames into [`RemoteEvent`]s, one per consistent snapshot.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, provider: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        let found = change.new_doc.as_ref().filter(|doc| doc.is_found_document()).cloned();
        for target_id in &change.updated_target_ids {
            match &found {
                Some(doc) => self.add_document_to_target(provider, *target_id, doc.clone()),
                None => self.remove_document_from_target(provider, *target_id, &change.key, change.new_doc.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &change.key, change.new_doc.clone());
        }
    }

    /// Applies a target change that carries no error cause.
    pub fn handle_target_change(&mut self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.targets_for(provider, change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A reset from an earlier add has been superseded.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        0xcb2b,
                        "target removals with a cause are handled as listen rejections",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the server's count with the local view of the target and schedules a reset when
    /// they disagree and the bloom filter cannot explain the difference.
    pub fn handle_existence_filter(&mut self, provider: &dyn TargetMetadataProvider, filter: &ExistenceFilterChange) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The single document no longer exists. Remove it, and let the next snapshot
                // record it as deleted.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                }
            } else {
                hard_assert(
                    expected_count == 1,
                    0x4e2d,
                    format!("single document existence filter with count: {expected_count}"),
                );
            }
            return;
        }

        let current_size = self.current_document_count_for_target(provider, target_id);
        if current_size == expected_count as i64 {
            return;
        }

        let status = self.apply_bloom_filter(provider, filter, current_size);
        if status != BloomFilterApplication::Success {
            self.reset_target(provider, target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                target: "firestore::watch",
                "existence filter mismatch on target {target_id}: local {current_size}, server {expected_count}"
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        filter: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let Some(bits) = &filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom = match BloomFilter::new(bits.bitmap.clone(), bits.padding, bits.hash_count) {
            Ok(bloom) => bloom,
            Err(err) => {
                log::warn!(
                    target: "firestore::watch",
                    "applying bloom filter failed: {err}; ignoring the filter and re-listening"
                );
                return BloomFilterApplication::Skipped;
            }
        };
        if bloom.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(provider, &bloom, filter.target_id);
        if filter.count as i64 != current_count - removed {
            BloomFilterApplication::FalsePositive
        } else {
            BloomFilterApplication::Success
        }
    }

    /// Removes every cached key the bloom filter says the server no longer has.
    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = format!(
                "projects/{}/databases/{}/documents/{}",
                self.database_id.project_id(),
                self.database_id.database(),
                key.path().canonical_string()
            );
            if !bloom.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything accumulated so far and clears the pending state.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort_unstable();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self.target_states.get(&target_id).map(|state| state.current).unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target without the document means it does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(provider, target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // Documents referenced only by limbo resolution targets are tracked separately so GC can
        // treat them as unreferenced.
        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called for every watch or unwatch request sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    /// Removes the in-memory state of a target that is no longer listened to.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: MutableDocument,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated_document` is `None` when the document merely left the target.
    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = self.target_contains_document(provider, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document was added and removed between two snapshots.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        hard_assert(
            self.target_states.get(&target_id).map(|state| !state.is_pending()).unwrap_or(true),
            0x2c4b,
            "should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());

        // Every known document is removed; the server re-sends the ones still matching.
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, &key, None);
        }
    }

    fn current_document_count_for_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn targets_for(&self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        let mut ids: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(provider, *target_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(provider, target_id).is_some()
    }

    /// Target data if the target is listened to and has no outstanding add/remove requests.
    fn target_data_for_active_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }

    fn target_contains_document(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> bool {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::remote::watch_change::EncodedBloomFilter;
    use crate::firestore::test_support::{doc, key, path, query, version};
    use serde_json::json;

    #[derive(Default)]
    struct FakeMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl FakeMetadata {
        fn with_query(mut self, target_id: TargetId, collection: &str, keys: &[&str]) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(query(collection).to_target(), target_id, TargetPurpose::Listen, 1),
            );
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo(mut self, target_id: TargetId, document: &str) -> Self {
            let target = Query::at_path(path(document)).to_target();
            self.targets.insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for FakeMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn aggregator() -> WatchChangeAggregator {
        WatchChangeAggregator::new(DatabaseId::default("p"))
    }

    fn doc_change(updated: &[TargetId], removed: &[TargetId], document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated.to_vec(),
            removed_target_ids: removed.to_vec(),
            key: document.key().clone(),
            new_doc: Some(document),
        }
    }

    fn name(path: &str) -> String {
        format!("projects/p/databases/(default)/documents/{path}")
    }

    #[test]
    fn accumulates_changes_until_snapshot() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&metadata, doc_change(&[2], &[], doc("rooms/a", 3, json!({"n": 1}))));
        aggregator.handle_document_change(&metadata, doc_change(&[2], &[], doc("rooms/b", 3, json!({"n": 2}))));
        aggregator.handle_target_change(
            &metadata,
            &WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(vec![9]),
        );

        let event = aggregator.create_remote_event(&metadata, version(4));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![9]);
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.added_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates[&key("rooms/b")].read_time(), version(4));

        // State is cleared once reported.
        let next = aggregator.create_remote_event(&metadata, version(5));
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(&metadata, doc_change(&[2], &[], doc("rooms/a", 1, json!({}))));
        assert!(aggregator.create_remote_event(&metadata, version(1)).document_updates.is_empty());

        aggregator.handle_target_change(&metadata, &WatchTargetChange::new(TargetChangeState::Add, vec![2]));
        aggregator.handle_document_change(&metadata, doc_change(&[2], &[], doc("rooms/a", 1, json!({}))));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn removed_documents_only_report_known_keys() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(
            &metadata,
            DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![2],
                key: key("rooms/a"),
                new_doc: None,
            },
        );
        aggregator.handle_document_change(&metadata, doc_change(&[2], &[], doc("rooms/b", 1, json!({}))));
        aggregator.handle_document_change(
            &metadata,
            DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![2],
                key: key("rooms/b"),
                new_doc: None,
            },
        );
        let change = aggregator.create_remote_event(&metadata, version(2)).target_changes[&2].clone();
        assert_eq!(change.removed_documents, [key("rooms/a")].into_iter().collect());
        assert!(change.added_documents.is_empty());
    }

    #[test]
    fn unexplained_mismatch_resets_target() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(3));
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn bloom_filter_repairs_without_reset() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &["rooms/a", "rooms/b", "rooms/c"]);
        let mut bloom = BloomFilter::with_capacity(256, 5).unwrap();
        bloom.insert(&name("rooms/a"));
        bloom.insert(&name("rooms/c"));
        assert!(!bloom.might_contain(&name("rooms/b")));

        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 2,
                unchanged_names: Some(EncodedBloomFilter {
                    bitmap: bloom.bitmap().to_vec(),
                    padding: bloom.padding(),
                    hash_count: bloom.hash_count(),
                }),
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(3));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            [key("rooms/b")].into_iter().collect()
        );
    }

    #[test]
    fn bloom_filter_false_positive_resets_with_bloom_purpose() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &["rooms/a", "rooms/b"]);
        // Every bit set: the filter claims both documents still match.
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(EncodedBloomFilter {
                    bitmap: vec![0xff; 8],
                    padding: 0,
                    hash_count: 3,
                }),
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(3));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let metadata = FakeMetadata::default().with_limbo(1, "rooms/gone");
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&metadata, &WatchTargetChange::new(TargetChangeState::Current, vec![1]));
        let event = aggregator.create_remote_event(&metadata, version(6));
        let doc = &event.document_updates[&key("rooms/gone")];
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), version(6));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/gone")));
    }

    #[test]
    fn documents_shared_with_query_targets_are_not_limbo_resolved() {
        let metadata = FakeMetadata::default()
            .with_query(2, "rooms", &[])
            .with_limbo(1, "rooms/a");
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&metadata, doc_change(&[1, 2], &[], doc("rooms/a", 2, json!({}))));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn removal_ack_drops_target_state() {
        let metadata = FakeMetadata::default().with_query(2, "rooms", &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(&metadata, &WatchTargetChange::new(TargetChangeState::Remove, vec![2]));
        assert!(aggregator.target_states.get(&2).is_none());
    }
}

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::target::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};

/// Everything the watch stream reported up to one consistent snapshot.
///
/// Produced once per global snapshot by the watch change aggregator and applied atomically by
/// the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results must be discarded, and why.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    /// New server state of every document touched by the event.
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents whose only references were limbo resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn empty(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    /// An event that only marks `target_id` as current, as if the server said so.
    ///
    /// Used when a listen is rejected or when an online state change makes views current.
    pub fn synthesized_for_current_change(target_id: TargetId, current: bool, resume_token: Vec<u8>) -> Self {
        let mut event = Self::empty(SnapshotVersion::min());
        event
            .target_changes
            .insert(target_id, TargetChange::synthesized_for_current_change(current, resume_token));
        event
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Changes to one target's result set within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty() || !self.modified_documents.is_empty() || !self.removed_documents.is_empty()
    }
}

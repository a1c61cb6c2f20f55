use crate::firestore::model::TargetId;

/// Hands out target ids in steps of two so query targets (even) and limbo targets (odd) never
/// collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for persisted query targets, continuing after `highest` (0 on a fresh cache).
    pub fn for_target_cache(highest: TargetId) -> Self {
        Self {
            last_id: highest - highest.rem_euclid(2),
        }
    }

    /// Generator for limbo resolution targets owned by the sync engine.
    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next_id(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}

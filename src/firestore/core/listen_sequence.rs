use crate::firestore::model::ListenSequenceNumber;

pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Monotonic source of LRU sequence numbers, seeded from the highest persisted value.
#[derive(Clone, Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self { previous }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous
    }
}

//! Per-partition commit cursor.
//!
//! The cursor holds, for each input partition, the highest offset whose
//! forwarded copy has been acknowledged and committed. It only moves forward:
//! a commit request at or below the current position is a no-op.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
pub struct CommitCursor {
    committed: BTreeMap<i32, i64>,
}

impl CommitCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest committed offset for `partition`, if any.
    pub fn get(&self, partition: i32) -> Option<i64> {
        self.committed.get(&partition).copied()
    }

    /// The subset of `offsets` that would move the cursor forward.
    pub fn pending(&self, offsets: &BTreeMap<i32, i64>) -> BTreeMap<i32, i64> {
        offsets
            .iter()
            .filter(|(partition, offset)| self.get(**partition).map_or(true, |current| **offset > current))
            .map(|(partition, offset)| (*partition, *offset))
            .collect()
    }

    /// Move the cursor for `partition` to `offset`. Returns `false` and leaves
    /// the cursor untouched when `offset` is not above the current position.
    pub fn advance(&mut self, partition: i32, offset: i64) -> bool {
        match self.committed.get(&partition) {
            Some(current) if *current >= offset => false,
            _ => {
                self.committed.insert(partition, offset);
                true
            }
        }
    }

    /// Drop the position of a partition that is no longer assigned.
    pub fn forget(&mut self, partition: i32) {
        self.committed.remove(&partition);
    }

    pub fn positions(&self) -> &BTreeMap<i32, i64> {
        &self.committed
    }
}

//! Per-partition view of where a subscriber stands.
//!
//! The broker's committed offsets are the source of truth; this is the
//! subscriber's cache of them plus the record currently in flight. It enforces
//! the order pending → stored → committed and refuses committed offsets that
//! go backwards.

use std::collections::HashMap;

use crate::broker::TopicPartition;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetState {
    /// Pulled, outcome not known yet.
    Pending,
    /// Outcome known and offset stored with the consumer.
    Stored,
    /// Stored offset committed to the broker.
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub offset: i64,
    pub state: OffsetState,
}

#[derive(Debug, Default)]
pub struct PartitionPositions {
    heads: HashMap<TopicPartition, Position>,
    committed: HashMap<TopicPartition, i64>,
}

impl PartitionPositions {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, tp: &TopicPartition) -> Option<Position> {
        self.heads.get(tp).copied()
    }

    /// Offset of the last record committed for `tp`.
    #[cfg(test)]
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.committed.get(tp).copied()
    }

    pub fn begin(&mut self, tp: &TopicPartition, offset: i64) {
        self.heads.insert(
            tp.clone(),
            Position {
                offset,
                state: OffsetState::Pending,
            },
        );
    }

    pub fn mark_stored(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        match self.heads.get_mut(tp) {
            Some(head) if head.offset == offset && head.state == OffsetState::Pending => {
                head.state = OffsetState::Stored;
                Ok(())
            }
            other => Err(Error::InvalidState {
                message: format!(
                    "cannot store {} offset {}: head is {:?}",
                    tp, offset, other
                ),
            }),
        }
    }

    /// Promotes every stored offset to committed and returns them.
    pub fn mark_committed(&mut self) -> Result<Vec<(TopicPartition, i64)>> {
        let mut promoted = Vec::new();
        for (tp, head) in self.heads.iter_mut() {
            if head.state != OffsetState::Stored {
                continue;
            }
            if let Some(previous) = self.committed.get(tp) {
                if head.offset < *previous {
                    return Err(Error::InvalidState {
                        message: format!(
                            "committed offset of {} would move back from {} to {}",
                            tp, previous, head.offset
                        ),
                    });
                }
            }
            head.state = OffsetState::Committed;
            self.committed.insert(tp.clone(), head.offset);
            promoted.push((tp.clone(), head.offset));
        }
        promoted.sort();
        Ok(promoted)
    }

    /// Drops the in-flight record of `tp` after a seek back to `offset`.
    pub fn rewind(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        match self.heads.get(tp) {
            Some(head) if head.state == OffsetState::Pending && offset <= head.offset => {
                self.heads.remove(tp);
                Ok(())
            }
            other => Err(Error::InvalidState {
                message: format!(
                    "cannot rewind {} to offset {}: head is {:?}",
                    tp, offset, other
                ),
            }),
        }
    }

    pub fn has_uncommitted(&self) -> bool {
        self.heads
            .values()
            .any(|head| head.state == OffsetState::Stored)
    }
}

//! Bounded retry with dead-letter routing for records that keep failing.
//!
//! A failed record is re-delivered by seeking its partition back to the
//! record's own offset. After `max_attempts` re-deliveries the record is
//! handed to the dead-letter sink and its offset committed, so one poison
//! record can neither stall a partition nor disappear without a trace.

use std::collections::HashMap;

use crate::broker::TopicPartition;

/// What to do with a record given its outcome and attempt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Retry,
    DeadLetter,
}

/// `attempt_count` is the number of re-deliveries already made for the
/// record.
pub fn resolve(succeeded: bool, attempt_count: u32, max_attempts: u32) -> Decision {
    if succeeded {
        Decision::Commit
    } else if attempt_count < max_attempts {
        Decision::Retry
    } else {
        Decision::DeadLetter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Store and commit the record's offset.
    Commit,
    /// Seek the partition to `seek_to` (the failed record itself).
    Retry { seek_to: i64, attempt: u32 },
    /// Route to the dead-letter sink, call [`RetryCoordinator::settle`], then
    /// store and commit. `deliveries` counts every processing attempt.
    DeadLetter { deliveries: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Head {
    offset: i64,
    retries: u32,
}

/// Tracks the retry count of the record at the head of each partition.
///
/// Counts are keyed by physical offset: a re-delivery of the same offset
/// continues its count, any other offset starts from zero.
#[derive(Debug)]
pub struct RetryCoordinator {
    max_attempts: u32,
    heads: HashMap<TopicPartition, Head>,
}

impl RetryCoordinator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            heads: HashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Re-deliveries already made for the record at `offset`.
    pub fn attempts(&self, tp: &TopicPartition, offset: i64) -> u32 {
        self.heads
            .get(tp)
            .filter(|head| head.offset == offset)
            .map(|head| head.retries)
            .unwrap_or(0)
    }

    pub fn resolve(&mut self, tp: &TopicPartition, offset: i64, succeeded: bool) -> Resolution {
        let retries = self.attempts(tp, offset);

        match resolve(succeeded, retries, self.max_attempts) {
            Decision::Commit => {
                self.heads.remove(tp);
                Resolution::Commit
            }
            Decision::Retry => {
                let attempt = retries + 1;
                self.heads.insert(
                    tp.clone(),
                    Head {
                        offset,
                        retries: attempt,
                    },
                );
                Resolution::Retry {
                    seek_to: offset,
                    attempt,
                }
            }
            Decision::DeadLetter => {
                // Kept until settled so a failed routing goes straight back here
                self.heads.insert(tp.clone(), Head { offset, retries });
                Resolution::DeadLetter {
                    deliveries: retries + 1,
                }
            }
        }
    }

    /// Forgets the head of `tp` once its record was dead-lettered.
    pub fn settle(&mut self, tp: &TopicPartition) {
        self.heads.remove(tp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TopicPartition {
        TopicPartition::new("KafkaEstudo", 0)
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(resolve(true, 0, 3), Decision::Commit);
        assert_eq!(resolve(true, 3, 3), Decision::Commit);
        assert_eq!(resolve(false, 0, 3), Decision::Retry);
        assert_eq!(resolve(false, 2, 3), Decision::Retry);
        assert_eq!(resolve(false, 3, 3), Decision::DeadLetter);
        assert_eq!(resolve(false, 4, 3), Decision::DeadLetter);
    }

    #[test]
    fn test_always_failing_record_is_dead_lettered_after_max_retries() {
        let mut coordinator = RetryCoordinator::new(3);
        let tp = tp();

        for attempt in 1..=3 {
            assert_eq!(
                coordinator.resolve(&tp, 10, false),
                Resolution::Retry {
                    seek_to: 10,
                    attempt
                }
            );
        }
        assert_eq!(
            coordinator.resolve(&tp, 10, false),
            Resolution::DeadLetter { deliveries: 4 }
        );

        coordinator.settle(&tp);
        assert_eq!(coordinator.attempts(&tp, 10), 0);
    }

    #[test]
    fn test_success_resets_count() {
        let mut coordinator = RetryCoordinator::new(3);
        let tp = tp();

        coordinator.resolve(&tp, 5, false);
        assert_eq!(coordinator.attempts(&tp, 5), 1);
        assert_eq!(coordinator.resolve(&tp, 5, true), Resolution::Commit);
        assert_eq!(coordinator.attempts(&tp, 5), 0);
    }

    #[test]
    fn test_new_offset_starts_from_zero() {
        let mut coordinator = RetryCoordinator::new(2);
        let tp = tp();

        coordinator.resolve(&tp, 5, false);
        coordinator.resolve(&tp, 5, false);
        assert_eq!(
            coordinator.resolve(&tp, 6, false),
            Resolution::Retry {
                seek_to: 6,
                attempt: 1
            }
        );
    }

    #[test]
    fn test_unsettled_dead_letter_stays_dead_letter() {
        let mut coordinator = RetryCoordinator::new(1);
        let tp = tp();

        coordinator.resolve(&tp, 0, false);
        assert!(matches!(
            coordinator.resolve(&tp, 0, false),
            Resolution::DeadLetter { .. }
        ));
        // routing failed, the record comes back
        assert!(matches!(
            coordinator.resolve(&tp, 0, false),
            Resolution::DeadLetter { .. }
        ));
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut coordinator = RetryCoordinator::new(3);
        let p0 = TopicPartition::new("t", 0);
        let p1 = TopicPartition::new("t", 1);

        coordinator.resolve(&p0, 0, false);
        coordinator.resolve(&p0, 0, false);
        assert_eq!(coordinator.attempts(&p0, 0), 2);
        assert_eq!(coordinator.attempts(&p1, 0), 0);
    }
}

//! # Partition Offset Tracking
//!
//! Kafka commits are cumulative: committing offset `n` acknowledges every
//! offset below it. Completions resolve out of order, so a partition's
//! commit point may only advance past offsets that have all completed.
//!
//! ```text
//! tracked   5  6  7  8
//! complete  ok .  ok ok      commit point 6 (6 still in flight)
//! complete     ok            commit point 9
//! complete     ERR           rewind to 6, later completions of 7..8 ignored
//! ```
//!
//! A failure rewinds the partition to its lowest unfinished offset and
//! starts a new epoch; completions from the old epoch are stale and ignored. An offset
//! that fails more than the redelivery limit is skipped so the partition
//! can make progress.

use std::collections::{BTreeSet, HashMap};

/// What the consumer should do after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing new is committable.
    Idle,
    /// Commit this offset (the next one to consume).
    Commit(i64),
    /// Seek the partition back to this offset and redeliver from there.
    Rewind(i64),
}

/// Issued by [`OffsetTracker::track`], handed back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub partition: i32,
    pub offset: i64,
    epoch: u64,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    epoch: u64,
    in_flight: BTreeSet<i64>,
    /// Completed but above an unfinished offset.
    done: BTreeSet<i64>,
    /// Next offset to consume as last committed (or first seen).
    committed: Option<i64>,
    /// Failures of the offset currently blocking the partition.
    failures: Option<(i64, u32)>,
    /// Set by a rewind: deliveries fetched before the seek are dropped
    /// until this offset comes round again.
    resume_at: Option<i64>,
}

impl PartitionOffsets {
    fn commit_point(&self) -> Option<i64> {
        match self.in_flight.first() {
            Some(&lowest) => Some(lowest),
            None => self.done.last().map(|&highest| highest + 1),
        }
    }
}

/// Commit bookkeeping for one consumer of one topic.
#[derive(Debug)]
pub struct OffsetTracker {
    max_redeliveries: u32,
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    #[must_use]
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries,
            partitions: HashMap::new(),
        }
    }

    /// Record a delivery about to be handed to the handler. `None` means
    /// the delivery was fetched before a rewind and must be dropped.
    pub fn track(&mut self, partition: i32, offset: i64) -> Option<Ticket> {
        let state = self.partitions.entry(partition).or_default();
        match state.resume_at {
            Some(resume) if offset > resume => return None,
            Some(_) => state.resume_at = None,
            None => {}
        }
        state.committed.get_or_insert(offset);
        state.in_flight.insert(offset);
        Some(Ticket {
            partition,
            offset,
            epoch: state.epoch,
        })
    }

    /// Record a completion and say what to do about it.
    pub fn complete(&mut self, ticket: Ticket, succeeded: bool) -> Progress {
        let max_redeliveries = self.max_redeliveries;
        let Some(state) = self.partitions.get_mut(&ticket.partition) else {
            return Progress::Idle;
        };
        if ticket.epoch != state.epoch || !state.in_flight.remove(&ticket.offset) {
            return Progress::Idle;
        }

        if !succeeded {
            let failures = match state.failures {
                Some((offset, count)) if offset == ticket.offset => count + 1,
                _ => 1,
            };
            if failures <= max_redeliveries {
                // Earlier offsets still in flight are redelivered as well.
                let rewind_to = state
                    .in_flight
                    .first()
                    .map_or(ticket.offset, |&lowest| lowest.min(ticket.offset));
                state.failures = Some((ticket.offset, failures));
                state.epoch += 1;
                state.in_flight.clear();
                state.done.clear();
                state.resume_at = Some(rewind_to);
                return Progress::Rewind(rewind_to);
            }
            // Out of redeliveries: treat as handled.
            state.failures = None;
        } else if state
            .failures
            .is_some_and(|(offset, _)| offset == ticket.offset)
        {
            state.failures = None;
        }

        state.done.insert(ticket.offset);
        let Some(point) = state.commit_point() else {
            return Progress::Idle;
        };
        state.done.retain(|&offset| offset >= point);
        if state.committed.is_some_and(|committed| point <= committed) {
            return Progress::Idle;
        }
        state.committed = Some(point);
        Progress::Commit(point)
    }

    /// Failures recorded against `offset` in `partition`, if it is the
    /// offset currently being redelivered.
    #[must_use]
    pub fn failures(&self, partition: i32, offset: i64) -> u32 {
        self.partitions
            .get(&partition)
            .and_then(|state| state.failures)
            .filter(|(failed, _)| *failed == offset)
            .map_or(0, |(_, count)| count)
    }

    /// Forget a partition, e.g. after a rebalance revoked it.
    pub fn forget(&mut self, partition: i32) {
        self.partitions.remove(&partition);
    }
}

//! Encoder-side bookkeeping of unacknowledged header blocks.
//!
//! Tracks which dynamic table entries outstanding header blocks refer to,
//! which streams could be blocked at the peer decoder, and the Known
//! Received Count (RFC 9204 Section 2.1.4).

use crate::config::BugSeverity;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// The dynamic table indices one header block refers to, reduced to the
/// smallest and largest absolute index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSet {
    min_index: u64,
    max_index: u64,
}

impl Default for IndexSet {
    fn default() -> Self {
        Self {
            min_index: u64::MAX,
            max_index: 0,
        }
    }
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an absolute index. Indices are always below `u64::MAX`.
    pub fn insert(&mut self, index: u64) {
        debug_assert!(index < u64::MAX);
        self.min_index = self.min_index.min(index);
        self.max_index = self.max_index.max(index);
    }

    pub fn is_empty(&self) -> bool {
        self.min_index > self.max_index
    }

    pub fn min_index(&self) -> u64 {
        self.min_index
    }

    pub fn max_index(&self) -> u64 {
        self.max_index
    }

    /// Required Insert Count of a header block referring to these indices.
    ///
    /// Returns `None` for an empty set: a block without dynamic references
    /// has no entry to depend on, and asking is a caller error.
    pub fn required_insert_count(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        self.max_index.checked_add(1)
    }
}

impl FromIterator<u64> for IndexSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let mut set = IndexSet::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

/// Outstanding header blocks of one stream, oldest first.
#[derive(Debug, Default)]
struct StreamRecord {
    header_blocks: VecDeque<IndexSet>,
    /// Largest Required Insert Count among `header_blocks`.
    max_required_insert_count: u64,
}

impl StreamRecord {
    fn recompute_max(&mut self) {
        self.max_required_insert_count = self
            .header_blocks
            .iter()
            .filter_map(IndexSet::required_insert_count)
            .max()
            .unwrap_or(0);
    }
}

/// Tracks references to dynamic table entries from header blocks that the
/// peer has not acknowledged yet.
#[derive(Debug, Default)]
pub struct QpackBlockingManager {
    streams: HashMap<u64, StreamRecord>,
    /// Number of outstanding header blocks keyed by their smallest index.
    entry_reference_counts: BTreeMap<u64, u64>,
    /// Streams with a header block the peer might not be able to decode yet.
    blocked_streams: HashSet<u64>,
    known_received_count: u64,
    bug_severity: BugSeverity,
}

impl QpackBlockingManager {
    pub fn new(bug_severity: BugSeverity) -> Self {
        Self {
            bug_severity,
            ..Default::default()
        }
    }

    /// Records a header block sent on `stream_id` that refers to `indices`.
    pub fn on_header_block_sent(&mut self, stream_id: u64, indices: IndexSet, required_insert_count: u64) {
        let Some(computed) = indices.required_insert_count() else {
            self.bug_severity
                .report("header block without dynamic table references recorded");
            return;
        };
        debug_assert_eq!(computed, required_insert_count);
        let required_insert_count = computed.max(required_insert_count);

        self.increase_reference_count(indices.min_index());

        let record = self.streams.entry(stream_id).or_default();
        record.header_blocks.push_back(indices);
        record.max_required_insert_count = record.max_required_insert_count.max(required_insert_count);

        if record.max_required_insert_count > self.known_received_count
            && self.blocked_streams.insert(stream_id)
        {
            trace!(stream_id, required_insert_count, "stream may block at peer");
        }
    }

    /// Processes a Section Acknowledgement for `stream_id`.
    ///
    /// Returns false if the stream has no outstanding header block, which
    /// is a peer error.
    pub fn on_header_acknowledgement(&mut self, stream_id: u64) -> bool {
        let Some(record) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        let Some(indices) = record.header_blocks.pop_front() else {
            self.streams.remove(&stream_id);
            self.blocked_streams.remove(&stream_id);
            self.bug_severity
                .report("stream record without outstanding header blocks");
            return false;
        };

        let stream_done = record.header_blocks.is_empty();
        if !stream_done {
            record.recompute_max();
        }
        let required_insert_count = indices.required_insert_count().unwrap_or(0);

        self.decrease_reference_count(indices.min_index());
        if stream_done {
            self.streams.remove(&stream_id);
            self.blocked_streams.remove(&stream_id);
        }

        if required_insert_count > self.known_received_count {
            self.increase_known_received_count(required_insert_count);
        } else {
            self.update_blocked_stream(stream_id);
        }
        true
    }

    /// Processes a Stream Cancellation. No-op for unknown streams.
    pub fn on_stream_cancellation(&mut self, stream_id: u64) {
        let Some(record) = self.streams.remove(&stream_id) else {
            return;
        };
        for indices in &record.header_blocks {
            self.decrease_reference_count(indices.min_index());
        }
        self.blocked_streams.remove(&stream_id);
    }

    /// Processes an Insert Count Increment.
    ///
    /// Returns false if Known Received Count would overflow.
    pub fn on_insert_count_increment(&mut self, increment: u64) -> bool {
        let Some(known_received_count) = self.known_received_count.checked_add(increment) else {
            return false;
        };
        self.increase_known_received_count(known_received_count);
        true
    }

    /// Returns true if a new header block on `stream_id` may refer to
    /// entries the peer has not acknowledged.
    pub fn blocking_allowed_on_stream(&self, stream_id: u64, maximum_blocked_streams: u64) -> bool {
        if self.blocked_streams.contains(&stream_id) {
            return true;
        }
        (self.blocked_streams.len() as u64) < maximum_blocked_streams
    }

    /// Smallest absolute index referred to by an outstanding header block,
    /// or `u64::MAX` if there is none.
    pub fn smallest_blocking_index(&self) -> u64 {
        self.entry_reference_counts
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX)
    }

    pub fn known_received_count(&self) -> u64 {
        self.known_received_count
    }

    pub fn blocked_stream_count(&self) -> u64 {
        self.blocked_streams.len() as u64
    }

    pub fn is_stream_blocked(&self, stream_id: u64) -> bool {
        self.blocked_streams.contains(&stream_id)
    }

    /// Number of header blocks on `stream_id` awaiting acknowledgement.
    pub fn outstanding_header_blocks(&self, stream_id: u64) -> usize {
        self.streams
            .get(&stream_id)
            .map_or(0, |record| record.header_blocks.len())
    }

    fn increase_known_received_count(&mut self, known_received_count: u64) {
        debug_assert!(known_received_count >= self.known_received_count);
        self.known_received_count = known_received_count;

        let streams = &self.streams;
        self.blocked_streams.retain(|stream_id| {
            let still_blocked = streams
                .get(stream_id)
                .is_some_and(|record| record.max_required_insert_count > known_received_count);
            if !still_blocked {
                debug!(stream_id, known_received_count, "stream no longer blocking");
            }
            still_blocked
        });
    }

    fn update_blocked_stream(&mut self, stream_id: u64) {
        let blocked = self
            .streams
            .get(&stream_id)
            .is_some_and(|record| record.max_required_insert_count > self.known_received_count);
        if !blocked {
            self.blocked_streams.remove(&stream_id);
        }
    }

    fn increase_reference_count(&mut self, index: u64) {
        let count = self.entry_reference_counts.entry(index).or_insert(0);
        match count.checked_add(1) {
            Some(incremented) => *count = incremented,
            None => self.bug_severity.report("entry reference count overflow"),
        }
    }

    fn decrease_reference_count(&mut self, index: u64) {
        let Some(count) = self.entry_reference_counts.get_mut(&index) else {
            self.bug_severity
                .report("reference count decreased for index without references");
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.entry_reference_counts.remove(&index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices(values: &[u64]) -> IndexSet {
        values.iter().copied().collect()
    }

    fn manager() -> QpackBlockingManager {
        QpackBlockingManager::new(BugSeverity::Panic)
    }

    #[test]
    fn test_index_set() {
        let set = indices(&[3, 7, 1]);
        assert_eq!(set.min_index(), 1);
        assert_eq!(set.max_index(), 7);
        assert_eq!(set.required_insert_count(), Some(8));

        let empty = IndexSet::new();
        assert!(empty.is_empty());
        assert_eq!(empty.required_insert_count(), None);

        assert_eq!(indices(&[0]).required_insert_count(), Some(1));
    }

    #[test]
    fn test_acknowledgements_in_order() {
        let mut manager = manager();
        manager.on_header_block_sent(0, indices(&[4]), 5);
        manager.on_header_block_sent(0, indices(&[2, 8]), 9);
        assert_eq!(manager.outstanding_header_blocks(0), 2);
        assert_eq!(manager.smallest_blocking_index(), 2);

        assert!(manager.on_header_acknowledgement(0));
        assert_eq!(manager.known_received_count(), 5);
        assert!(manager.is_stream_blocked(0));

        assert!(manager.on_header_acknowledgement(0));
        assert_eq!(manager.known_received_count(), 9);
        assert!(!manager.is_stream_blocked(0));
        assert_eq!(manager.smallest_blocking_index(), u64::MAX);

        assert!(!manager.on_header_acknowledgement(0));
        assert_eq!(manager.known_received_count(), 9);
    }

    #[test]
    fn test_acknowledgement_unknown_stream() {
        let mut manager = manager();
        assert!(!manager.on_header_acknowledgement(4));
    }

    #[test]
    fn test_acknowledgement_does_not_lower_known_received_count() {
        let mut manager = manager();
        manager.on_header_block_sent(0, indices(&[0]), 1);
        assert!(manager.on_insert_count_increment(3));
        assert!(manager.on_header_acknowledgement(0));
        assert_eq!(manager.known_received_count(), 3);
    }

    #[test]
    fn test_blocking_limit() {
        let mut manager = manager();
        manager.on_header_block_sent(0, indices(&[0]), 1);
        assert!(manager.is_stream_blocked(0));
        assert!(manager.blocking_allowed_on_stream(0, 1));
        assert!(!manager.blocking_allowed_on_stream(4, 1));
        assert!(manager.blocking_allowed_on_stream(4, 2));

        assert!(manager.on_insert_count_increment(1));
        assert!(!manager.is_stream_blocked(0));
        assert!(manager.blocking_allowed_on_stream(4, 1));
        // Unblocked streams still await acknowledgement.
        assert_eq!(manager.outstanding_header_blocks(0), 1);
        assert_eq!(manager.smallest_blocking_index(), 0);
    }

    #[test]
    fn test_no_blocking_when_already_received() {
        let mut manager = manager();
        assert!(manager.on_insert_count_increment(5));
        manager.on_header_block_sent(0, indices(&[1, 4]), 5);
        assert!(!manager.is_stream_blocked(0));
        assert_eq!(manager.blocked_stream_count(), 0);
        assert!(!manager.blocking_allowed_on_stream(0, 0));
    }

    #[test]
    fn test_insert_count_increment_unblocks_selectively() {
        let mut manager = manager();
        manager.on_header_block_sent(0, indices(&[1]), 2);
        manager.on_header_block_sent(4, indices(&[5]), 6);
        assert_eq!(manager.blocked_stream_count(), 2);

        assert!(manager.on_insert_count_increment(3));
        assert!(!manager.is_stream_blocked(0));
        assert!(manager.is_stream_blocked(4));
        assert_eq!(manager.blocked_stream_count(), 1);
    }

    #[test]
    fn test_insert_count_increment_overflow() {
        let mut manager = manager();
        assert!(manager.on_insert_count_increment(10));
        assert!(!manager.on_insert_count_increment(u64::MAX - 9));
        assert_eq!(manager.known_received_count(), 10);
        assert!(manager.on_insert_count_increment(u64::MAX - 10));
        assert_eq!(manager.known_received_count(), u64::MAX);
    }

    #[test]
    fn test_stream_cancellation() {
        let mut manager = manager();
        manager.on_header_block_sent(0, indices(&[1]), 2);
        manager.on_header_block_sent(0, indices(&[3]), 4);
        manager.on_header_block_sent(4, indices(&[1]), 2);
        assert_eq!(manager.smallest_blocking_index(), 1);

        manager.on_stream_cancellation(0);
        assert!(!manager.is_stream_blocked(0));
        assert_eq!(manager.outstanding_header_blocks(0), 0);
        assert_eq!(manager.smallest_blocking_index(), 1);
        assert!(!manager.on_header_acknowledgement(0));

        manager.on_stream_cancellation(4);
        assert_eq!(manager.smallest_blocking_index(), u64::MAX);
        assert_eq!(manager.blocked_stream_count(), 0);

        // Unknown stream.
        manager.on_stream_cancellation(8);
    }

    #[test]
    fn test_reference_counts_shared_between_blocks() {
        let mut manager = manager();
        manager.on_header_block_sent(0, indices(&[2, 3]), 4);
        manager.on_header_block_sent(4, indices(&[2]), 3);
        manager.on_header_block_sent(8, indices(&[5]), 6);
        assert_eq!(manager.smallest_blocking_index(), 2);

        assert!(manager.on_header_acknowledgement(0));
        assert_eq!(manager.smallest_blocking_index(), 2);
        assert!(manager.on_header_acknowledgement(4));
        assert_eq!(manager.smallest_blocking_index(), 5);
    }

    #[test]
    #[should_panic(expected = "qpack bug")]
    fn test_empty_index_set_is_flagged() {
        let mut manager = manager();
        manager.on_header_block_sent(0, IndexSet::new(), 0);
    }

    #[test]
    fn test_empty_index_set_logged_and_ignored() {
        let mut manager = QpackBlockingManager::new(BugSeverity::Log);
        manager.on_header_block_sent(0, IndexSet::new(), 0);
        assert_eq!(manager.outstanding_header_blocks(0), 0);
        assert_eq!(manager.smallest_blocking_index(), u64::MAX);
        assert!(!manager.on_header_acknowledgement(0));
    }
}

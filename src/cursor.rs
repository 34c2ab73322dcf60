//! Progress cursor bookkeeping: what is being watched, block ranges, and the
//! reorder buffer that keeps cursor commits in block order.

use crate::events::BridgeEventKind;
use alloy_primitives::Address;
use std::collections::BTreeMap;
use std::fmt;

/// One indexed stream: a contract's event on a given source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub src_chain_id: u64,
    pub contract_address: Address,
    pub event: BridgeEventKind,
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:?}#{}",
            self.event, self.contract_address, self.src_chain_id
        )
    }
}

/// Inclusive block range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    /// Returns `None` when `from > to`.
    pub fn new(from: u64, to: u64) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    pub fn block_count(&self) -> u64 {
        (self.to - self.from).saturating_add(1)
    }

    /// Consecutive, non-overlapping batches of at most `batch_size` blocks, in
    /// increasing block order.
    pub fn batches(&self, batch_size: u64) -> Vec<BlockRange> {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::with_capacity(self.block_count().div_ceil(batch_size) as usize);
        let mut from = self.from;
        loop {
            let to = from.saturating_add(batch_size - 1).min(self.to);
            batches.push(BlockRange { from, to });
            if to == self.to {
                break;
            }
            from = to + 1;
        }
        batches
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Releases items strictly in index order, however they arrive.
///
/// Batches are tracked by their position in the dispatch order. An item can
/// only be taken once every lower index has been taken, which is what keeps a
/// fast worker from moving the cursor past a slower one.
#[derive(Debug)]
pub struct CommitTracker<T> {
    next: usize,
    ready: BTreeMap<usize, T>,
}

impl<T> Default for CommitTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommitTracker<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            ready: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, index: usize, item: T) {
        debug_assert!(index >= self.next, "batch {index} was already committed");
        self.ready.insert(index, item);
    }

    /// Next item in order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.ready.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Number of items released so far.
    pub fn released(&self) -> usize {
        self.next
    }

    /// Items that arrived ahead of a gap.
    pub fn waiting(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_range_without_overlap() {
        let range = BlockRange::new(100, 200).unwrap();
        let batches = range.batches(20);

        assert_eq!(batches.len(), 6);
        assert_eq!(batches[0], BlockRange { from: 100, to: 119 });
        assert_eq!(batches[5], BlockRange { from: 200, to: 200 });
        for pair in batches.windows(2) {
            assert_eq!(pair[0].to + 1, pair[1].from);
        }
        assert!(batches.iter().all(|b| b.block_count() <= 20));
    }

    #[test]
    fn single_block_range() {
        let range = BlockRange::new(7, 7).unwrap();
        assert_eq!(range.batches(100), vec![range]);
        assert!(BlockRange::new(8, 7).is_none());
    }

    #[test]
    fn batches_near_u64_max_do_not_overflow() {
        let range = BlockRange::new(u64::MAX - 5, u64::MAX).unwrap();
        let batches = range.batches(4);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].to, u64::MAX);
    }

    #[test]
    fn tracker_releases_in_index_order() {
        let mut tracker = CommitTracker::new();
        tracker.insert(2, "c");
        tracker.insert(1, "b");
        assert_eq!(tracker.pop_ready(), None);
        assert_eq!(tracker.waiting(), 2);

        tracker.insert(0, "a");
        assert_eq!(tracker.pop_ready(), Some("a"));
        assert_eq!(tracker.pop_ready(), Some("b"));
        assert_eq!(tracker.pop_ready(), Some("c"));
        assert_eq!(tracker.pop_ready(), None);
        assert_eq!(tracker.released(), 3);
    }
}

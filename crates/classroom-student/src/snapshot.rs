//! Frozen student states and the bounded stack that holds them.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::metrics::Metrics;

/// Everything `pop()` needs to restore a student, captured by `push()`.
///
/// Snapshots are immutable once built and live behind an `Arc`, so clones of
/// a student share them instead of copying them.  `model` doubles as the
/// student's baseline after the push that created it.
#[derive(Debug)]
pub struct Snapshot<M, O, D> {
    pub model: Arc<M>,
    pub optimizer: O,
    pub dataset: Arc<D>,
    pub batch_size: usize,
    pub example_length: usize,
    pub metrics: Metrics,
    /// The baseline in force when the snapshot was taken.
    pub baseline: Option<Arc<M>>,
}

/// Newest-last stack of at most `depth` entries.  Pushing onto a full stack
/// drops the oldest entry for good.
#[derive(Debug)]
pub struct SnapshotStack<T> {
    depth: usize,
    entries: VecDeque<Arc<T>>,
}

pub const DEFAULT_HISTORY_DEPTH: usize = 1;

impl<T> SnapshotStack<T> {
    /// A depth of zero is treated as one.
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self { depth, entries: VecDeque::with_capacity(depth) }
    }

    /// Rebuild from entries listed oldest first, keeping the newest `depth`.
    pub fn from_entries(depth: usize, entries: impl IntoIterator<Item = Arc<T>>) -> Self {
        let mut stack = Self::new(depth);
        for entry in entries {
            stack.push(entry);
        }
        stack
    }

    pub fn push(&mut self, entry: Arc<T>) {
        while self.entries.len() >= self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<Arc<T>> {
        self.entries.pop_back()
    }

    pub fn newest(&self) -> Option<&Arc<T>> {
        self.entries.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Change the depth, dropping the oldest entries that no longer fit.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth.max(1);
        while self.entries.len() > self.depth {
            self.entries.pop_front();
        }
    }

    /// True when both stacks hold the very same snapshots, in order.
    pub fn shares_entries_with(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(&other.entries).all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

impl<T> Default for SnapshotStack<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}

// Manual impl: cloning shares entries and must not require `T: Clone`.
impl<T> Clone for SnapshotStack<T> {
    fn clone(&self) -> Self {
        Self { depth: self.depth, entries: self.entries.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(stack: &SnapshotStack<u32>) -> Vec<u32> {
        stack.iter().map(|e| **e).collect()
    }

    #[test]
    fn depth_one_keeps_only_newest() {
        let mut stack = SnapshotStack::new(1);
        stack.push(Arc::new(1));
        stack.push(Arc::new(2));
        assert_eq!(values(&stack), vec![2]);
        assert_eq!(stack.pop().map(|e| *e), Some(2));
        assert!(stack.pop().is_none());
    }

    #[test]
    fn deeper_stack_is_lifo() {
        let mut stack = SnapshotStack::new(3);
        for v in 1..=4 {
            stack.push(Arc::new(v));
        }
        assert_eq!(values(&stack), vec![2, 3, 4]);
        assert_eq!(stack.pop().map(|e| *e), Some(4));
        assert_eq!(stack.newest().map(|e| **e), Some(3));
    }

    #[test]
    fn zero_depth_means_one() {
        assert_eq!(SnapshotStack::<u32>::new(0).depth(), 1);
    }

    #[test]
    fn clone_shares_entries() {
        let mut stack = SnapshotStack::new(2);
        stack.push(Arc::new(7));
        let copy = stack.clone();
        assert!(copy.shares_entries_with(&stack));

        let mut other = SnapshotStack::new(2);
        other.push(Arc::new(7));
        assert!(!other.shares_entries_with(&stack), "equal values are not the same snapshot");
    }

    #[test]
    fn shrinking_depth_drops_oldest() {
        let mut stack = SnapshotStack::from_entries(3, [1, 2, 3].map(Arc::new));
        stack.set_depth(1);
        assert_eq!(values(&stack), vec![3]);
    }
}

//! Time-ordered queue of scheduled commands.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::ScheduledCommand;

/// Heap entry ordered by firing instant.
///
/// `seq` only makes the order total; entries with equal `fire_at` pop in
/// no guaranteed order.
#[derive(Debug, Clone)]
struct QueueEntry {
    seq: u64,
    item: ScheduledCommand,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .fire_at
            .cmp(&other.item.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of [`ScheduledCommand`] keyed by `fire_at`.
///
/// Not synchronized; the scheduler task owns it exclusively.
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: ScheduledCommand) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(QueueEntry { seq, item }));
    }

    /// Removes and returns the entry with the earliest `fire_at`.
    ///
    /// An empty queue is a normal state, not an error.
    pub fn pop_earliest(&mut self) -> Option<ScheduledCommand> {
        self.heap.pop().map(|Reverse(entry)| entry.item)
    }

    /// Earliest entry without removing it.
    pub fn peek(&self) -> Option<&ScheduledCommand> {
        self.heap.peek().map(|Reverse(entry)| &entry.item)
    }

    /// Removes the first entry that [matches](ScheduledCommand::matches) `target`.
    ///
    /// Returns true if an entry was removed. O(n).
    pub fn remove_matching(&mut self, target: &ScheduledCommand) -> bool {
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let position = entries
            .iter()
            .position(|Reverse(entry)| entry.item.matches(target));
        if let Some(position) = position {
            entries.swap_remove(position);
        }
        self.heap = BinaryHeap::from(entries);
        position.is_some()
    }

    /// All pending entries ordered by `fire_at`.
    pub fn snapshot(&self) -> Vec<ScheduledCommand> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().map(|Reverse(entry)| entry).collect();
        entries.sort();
        entries.into_iter().map(|entry| entry.item.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl FromIterator<ScheduledCommand> for ScheduleQueue {
    fn from_iter<I: IntoIterator<Item = ScheduledCommand>>(iter: I) -> Self {
        let mut queue = Self::new();
        for item in iter {
            queue.push(item);
        }
        queue
    }
}

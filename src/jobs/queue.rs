use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use super::job::{JobId, Pri, Seq};
use super::store::WaiterId;

/// One heap element. Entries are not removed when their job is deleted or
/// handed to a worker; they go stale in place and are discarded when they
/// reach the top.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Entry {
    pub pri: Pri,
    pub seq: Seq,
    pub id: JobId,
}

// Max-heap on priority, oldest-first among equals.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pri
            .cmp(&other.pri)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-queue state: the ready heap plus the ids of waiters registered on
/// this queue. Waiters are referenced by id only; the store's registry owns
/// them.
#[derive(Debug, Default)]
pub struct Queue {
    pub heap: BinaryHeap<Entry>,
    pub waiters: HashSet<WaiterId>,
}

impl Queue {
    /// True once the heap holds no entries and no waiter references remain,
    /// at which point the queue's map slot can be dropped.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty() && self.waiters.is_empty()
    }
}

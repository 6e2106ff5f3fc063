use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Queue entry for a pending task. Ordered by priority (higher first), then
/// submission time (older first), with a monotonic sequence number breaking
/// the remaining ties deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedTask {
    pub id: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending tasks plus a parked list for tasks that
/// currently have no available agent. A drain pass pops candidates in
/// priority order and parks the unmatchable ones, so an unmatched head never
/// starves the tasks behind it; parked tasks re-enter the heap whenever an
/// agent becomes available.
pub(crate) struct PendingQueue {
    heap: BinaryHeap<QueuedTask>,
    parked: Vec<QueuedTask>,
    seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            parked: Vec::new(),
            seq: 0,
        }
    }

    pub fn push(&mut self, id: String, priority: i32, created_at: DateTime<Utc>) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(QueuedTask {
            id,
            priority,
            created_at,
            seq,
        });
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub fn park(&mut self, task: QueuedTask) {
        self.parked.push(task);
    }

    /// Move every parked task back into the heap for another matching pass.
    pub fn unpark_all(&mut self) {
        for task in self.parked.drain(..) {
            self.heap.push(task);
        }
    }

    pub fn queued_len(&self) -> usize {
        self.heap.len()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

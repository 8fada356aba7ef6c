//! Priority run queue

use super::RunQueue;
use crate::config::PolicyKind;
use crate::scheduler::routine::{Priority, Routine, RoutineId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

struct Entry {
    priority: Priority,
    seq: u64,
    routine: Arc<Routine>,
}

// Max-heap on priority; among equals, the earlier admission wins
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Runs the highest-priority ready routine first
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl PriorityQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunQueue for PriorityQueue {
    fn policy(&self) -> PolicyKind {
        PolicyKind::Priority
    }

    fn push(&mut self, routine: Arc<Routine>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            priority: routine.priority(),
            seq,
            routine,
        });
    }

    fn pop(&mut self) -> Option<Arc<Routine>> {
        self.heap.pop().map(|entry| entry.routine)
    }

    fn remove(&mut self, id: RoutineId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.routine.id() != id);
        self.heap.len() != before
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.len())
            .finish()
    }
}

//! Strict admission-order run queue

use super::RunQueue;
use crate::config::PolicyKind;
use crate::scheduler::routine::{Routine, RoutineId};
use std::collections::VecDeque;
use std::sync::Arc;

/// Runs routines in the order they became ready
#[derive(Debug, Default)]
pub struct FifoQueue {
    queue: VecDeque<Arc<Routine>>,
}

impl FifoQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunQueue for FifoQueue {
    fn policy(&self) -> PolicyKind {
        PolicyKind::Fifo
    }

    fn push(&mut self, routine: Arc<Routine>) {
        self.queue.push_back(routine);
    }

    fn pop(&mut self) -> Option<Arc<Routine>> {
        self.queue.pop_front()
    }

    fn remove(&mut self, id: RoutineId) -> bool {
        match self.queue.iter().position(|r| r.id() == id) {
            Some(pos) => self.queue.remove(pos).is_some(),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

//! Group-affinity ("choreography") run queue
//!
//! Ready routines are bucketed by producer group. The group at the head of
//! the rotation is served back-to-back for up to `burst` slices, so routines
//! working on the same data run while it is still cache-hot; then the head
//! group moves to the back. Groups enter the rotation in first-arrival order
//! and leave it when their bucket drains. Ungrouped routines share one bucket.

use super::RunQueue;
use crate::config::PolicyKind;
use crate::scheduler::routine::{Routine, RoutineId};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;

type GroupKey = Option<Arc<str>>;

/// Runs routines of one group back-to-back
#[derive(Debug)]
pub struct GroupQueue {
    buckets: FxHashMap<GroupKey, VecDeque<Arc<Routine>>>,
    rotation: VecDeque<GroupKey>,
    burst: usize,
    served: usize,
    len: usize,
}

impl GroupQueue {
    /// Create an empty queue; `burst` is clamped to at least 1
    pub fn new(burst: usize) -> Self {
        Self {
            buckets: FxHashMap::default(),
            rotation: VecDeque::new(),
            burst: burst.max(1),
            served: 0,
            len: 0,
        }
    }

    /// Groups with ready routines, head of the rotation first
    pub fn groups(&self) -> Vec<Option<Arc<str>>> {
        self.rotation.iter().cloned().collect()
    }

    fn drop_group(&mut self, key: &GroupKey) {
        self.buckets.remove(key);
        if let Some(pos) = self.rotation.iter().position(|k| k == key) {
            self.rotation.remove(pos);
            if pos == 0 {
                self.served = 0;
            }
        }
    }
}

impl RunQueue for GroupQueue {
    fn policy(&self) -> PolicyKind {
        PolicyKind::GroupAffinity
    }

    fn push(&mut self, routine: Arc<Routine>) {
        let key = routine.group().cloned();
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            self.rotation.push_back(key);
            VecDeque::new()
        });
        bucket.push_back(routine);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Arc<Routine>> {
        let key = self.rotation.front()?.clone();
        let bucket = self.buckets.get_mut(&key)?;
        let routine = bucket.pop_front()?;
        let drained = bucket.is_empty();
        self.len -= 1;
        self.served += 1;

        if drained {
            self.drop_group(&key);
        } else if self.served >= self.burst {
            self.rotation.rotate_left(1);
            self.served = 0;
        }
        Some(routine)
    }

    fn remove(&mut self, id: RoutineId) -> bool {
        let found = self.buckets.iter_mut().find_map(|(key, bucket)| {
            let pos = bucket.iter().position(|r| r.id() == id)?;
            bucket.remove(pos);
            Some((key.clone(), bucket.is_empty()))
        });

        match found {
            Some((key, drained)) => {
                self.len -= 1;
                if drained {
                    self.drop_group(&key);
                }
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

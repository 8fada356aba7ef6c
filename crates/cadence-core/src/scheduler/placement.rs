//! Routine placement
//!
//! Picks the context a new routine is enqueued on. In order:
//! 1. the routine's affinity hint, if it names an existing processor;
//! 2. the configured affinity table entry for its group;
//! 3. under the group-affinity policy, the context the group was first
//!    placed on;
//! 4. the context owning the fewest routines. Ties go to whichever comes
//!    first after a rotating cursor, so equal loads spread round-robin.
//!
//! A routine never moves after placement.

use crate::config::{PolicyKind, SchedulerConfig};
use crate::scheduler::context::ProcessorContext;
use crate::scheduler::routine::Routine;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type FxBuild = BuildHasherDefault<FxHasher>;

/// Which rule chose the context
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PlacedBy {
    Hint,
    Table,
    GroupHome,
    LeastLoaded,
}

pub(crate) struct Placement {
    policy: PolicyKind,
    affinity_table: FxHashMap<Arc<str>, usize>,
    group_homes: DashMap<Arc<str>, usize, FxBuild>,
    cursor: AtomicUsize,
}

impl Placement {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        Self {
            policy: config.policy,
            affinity_table: config
                .affinity_table
                .iter()
                .map(|(group, &processor)| (Arc::from(group.as_str()), processor))
                .collect(),
            group_homes: DashMap::with_hasher(FxBuild::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Choose a context index for `routine`. `contexts` must not be empty.
    pub(crate) fn place(
        &self,
        routine: &Routine,
        contexts: &[Arc<ProcessorContext>],
    ) -> (usize, PlacedBy) {
        if let Some(hint) = routine.affinity() {
            if hint < contexts.len() {
                return (hint, PlacedBy::Hint);
            }
            debug!(
                routine = %routine.id(),
                hint,
                workers = contexts.len(),
                "affinity hint out of range, using placement heuristic"
            );
        }

        if let Some(group) = routine.group() {
            if let Some(&processor) = self.affinity_table.get(group) {
                if processor < contexts.len() {
                    return (processor, PlacedBy::Table);
                }
            }

            if self.policy == PolicyKind::GroupAffinity {
                let mut placed_by = PlacedBy::GroupHome;
                let home = *self
                    .group_homes
                    .entry(Arc::clone(group))
                    .or_insert_with(|| {
                        placed_by = PlacedBy::LeastLoaded;
                        self.least_loaded(contexts)
                    });
                return (home, placed_by);
            }
        }

        (self.least_loaded(contexts), PlacedBy::LeastLoaded)
    }

    /// Home context of a group, once it has one
    pub(crate) fn group_home(&self, group: &str) -> Option<usize> {
        self.group_homes.get(group).map(|home| *home)
    }

    fn least_loaded(&self, contexts: &[Arc<ProcessorContext>]) -> usize {
        let count = contexts.len().max(1);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        (0..contexts.len())
            .map(|offset| (start + offset) % count)
            .min_by_key(|&i| contexts[i].rq_size())
            .unwrap_or(0)
    }
}

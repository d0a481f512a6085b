//! Conflict detection between changes.
//!
//! Every task kind may declare a footprint: the resource names (for example
//! `pkg:foo`) its tasks touch. A new change is only admitted if its
//! footprint does not overlap the footprint of any change still in flight.
//! Rejections come back as `ChangeConflictError` and leave no trace in the
//! graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::error::{ChangeConflictError, OverlordError, Result};
use crate::state::{ChangeId, StateGuard, Task, TaskId};

type FootprintFn = Arc<dyn Fn(&Task) -> Vec<String> + Send + Sync>;

/// Registry of per-kind footprint functions.
#[derive(Clone, Default)]
pub struct ConflictDetector {
    footprints: Arc<Mutex<BTreeMap<String, FootprintFn>>>,
}

impl fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictDetector")
            .field("kinds", &self.registry().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, FootprintFn>> {
        self.footprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares which resources tasks of `kind` touch.
    pub fn add_footprint<F>(&self, kind: &str, footprint: F)
    where
        F: Fn(&Task) -> Vec<String> + Send + Sync + 'static,
    {
        self.registry().insert(kind.to_string(), Arc::new(footprint));
    }

    /// Union of the resources touched by `task_ids`.
    ///
    /// Kinds without a footprint function touch nothing.
    pub fn footprint(&self, st: &StateGuard<'_>, task_ids: &[TaskId]) -> BTreeSet<String> {
        let registry = self.registry();
        task_ids
            .iter()
            .filter_map(|id| st.task(*id))
            .filter_map(|task| registry.get(task.kind()).map(|f| f(task)))
            .flatten()
            .collect()
    }

    /// Fails if any resource in `footprint` is claimed by a change that is
    /// not ready yet. `ignore` skips one change, typically the caller's own.
    pub fn check(
        &self,
        st: &StateGuard<'_>,
        footprint: &BTreeSet<String>,
        ignore: Option<ChangeId>,
    ) -> std::result::Result<(), ChangeConflictError> {
        if footprint.is_empty() {
            return Ok(());
        }
        for change in st.changes() {
            if Some(change.id()) == ignore || st.is_change_ready(change.id()) {
                continue;
            }
            let claimed = self.footprint(st, change.task_ids());
            if let Some(resource) = claimed.intersection(footprint).next() {
                debug!(
                    "Resource {} already claimed by change {}",
                    resource,
                    change.id()
                );
                return Err(ChangeConflictError {
                    resource: resource.clone(),
                    change_id: change.id(),
                    change_kind: change.kind().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Creates a change from existing unattached tasks, unless it conflicts
    /// with a change in flight.
    pub fn admit(
        &self,
        st: &mut StateGuard<'_>,
        kind: &str,
        summary: &str,
        task_ids: &[TaskId],
    ) -> Result<ChangeId> {
        for id in task_ids {
            let task = st
                .task(*id)
                .ok_or_else(|| OverlordError::not_found(format!("task {}", id)))?;
            if let Some(existing) = task.change() {
                return Err(OverlordError::general(format!(
                    "task {} already belongs to change {}",
                    id, existing
                )));
            }
        }
        let footprint = self.footprint(st, task_ids);
        self.check(st, &footprint, None)?;
        let change = st.new_change(kind, summary);
        for task in task_ids {
            st.add_task(change, *task)?;
        }
        info!(
            "Admitted change {} ({}) touching {} resource(s)",
            change,
            kind,
            footprint.len()
        );
        Ok(change)
    }
}

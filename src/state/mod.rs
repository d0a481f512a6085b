//! State Store
//!
//! The in-memory object graph of changes, tasks and custom data, guarded by a
//! single process-wide lock.
//!
//! # Design Principles
//!
//! - **One lock**: every read or write of the graph goes through a `StateGuard`
//!   obtained from `State::lock()`. Holding the guard is the lock; there is no
//!   per-task or per-change locking.
//! - **Arena and index**: tasks and changes live in id-keyed maps and refer to
//!   each other by id only.
//! - **Checkpoint on unlock**: a guard that mutated anything serializes the
//!   graph while still locked, releases the lock, and only then hands the bytes
//!   to the `Checkpointer`. Snapshots are generation ordered so an older one
//!   never overwrites a newer one.
//! - **Explicit construction**: clock and checkpoint backend are passed in, the
//!   store has no global state.

mod change;
mod task;
mod taskset;

pub use change::Change;
pub use task::{LogEntry, LogLevel, Progress, Status, Task, MAX_TASK_LOG};
pub use taskset::TaskSet;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{OverlordError, Result};
use crate::persist::{self, Checkpointer};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw id.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw id.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }
    };
}

define_id!(
    /// Identifier of a change, unique for the lifetime of the state file.
    ChangeId
);
define_id!(
    /// Identifier of a task, unique for the lifetime of the state file.
    TaskId
);

/// The lock-protected graph. Field layout mirrors the persisted document.
#[derive(Debug, Default)]
pub(crate) struct StateData {
    pub(crate) data: BTreeMap<String, Value>,
    pub(crate) changes: BTreeMap<ChangeId, Change>,
    pub(crate) tasks: BTreeMap<TaskId, Task>,
    pub(crate) last_change_id: u64,
    pub(crate) last_task_id: u64,
    /// Set by any mutation since the last checkpoint
    modified: bool,
    /// Bumped every time a snapshot is taken
    generation: u64,
    known_change_kinds: BTreeSet<String>,
}

/// Pending wake-up requests for the ensure loop.
#[derive(Debug)]
struct EnsureSignal {
    deadline: Mutex<Option<DateTime<Utc>>>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

struct StateInner {
    data: Mutex<StateData>,
    clock: Arc<dyn Clock>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    /// Generation of the last snapshot handed to the checkpointer
    written: Mutex<u64>,
    checkpoint_error: Mutex<Option<String>>,
    ensure: EnsureSignal,
}

/// Handle to the shared state. Cloning is cheap; all clones see the same graph.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("clock", &self.inner.clock)
            .field("persistent", &self.inner.checkpointer.is_some())
            .finish()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), None)
    }
}

impl State {
    /// Creates an empty state.
    pub fn new(clock: Arc<dyn Clock>, checkpointer: Option<Arc<dyn Checkpointer>>) -> Self {
        Self::from_data(StateData::default(), clock, checkpointer)
    }

    pub(crate) fn from_data(
        data: StateData,
        clock: Arc<dyn Clock>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
    ) -> Self {
        let (tx, rx) = channel::bounded(1);
        Self {
            inner: Arc::new(StateInner {
                data: Mutex::new(data),
                clock,
                checkpointer,
                written: Mutex::new(0),
                checkpoint_error: Mutex::new(None),
                ensure: EnsureSignal {
                    deadline: Mutex::new(None),
                    tx,
                    rx,
                },
            }),
        }
    }

    /// Acquires the state lock.
    ///
    /// A poisoned lock (a handler panicked while holding it) is recovered: the
    /// graph is still structurally valid because every mutation is a single
    /// field assignment.
    pub fn lock(&self) -> StateGuard<'_> {
        let data = self
            .inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        StateGuard {
            inner: &self.inner,
            data: Some(data),
        }
    }

    /// Current time according to the state's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// The clock this state was built with.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Returns and clears the last checkpoint failure recorded by an
    /// implicitly dropped guard.
    pub fn take_checkpoint_error(&self) -> Option<String> {
        self.inner
            .checkpoint_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Receiver that gets a message whenever an ensure pass is requested.
    pub fn ensure_receiver(&self) -> Receiver<()> {
        self.inner.ensure.rx.clone()
    }

    /// Earliest time an ensure pass was requested for, if any.
    pub fn ensure_deadline(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .ensure
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Forgets the ensure request if it is due at or before `now`.
    pub(crate) fn clear_due_ensure(&self, now: DateTime<Utc>) {
        let mut deadline = self
            .inner
            .ensure
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if deadline.is_some_and(|at| at <= now) {
            *deadline = None;
        }
    }

    /// Requests an ensure pass no later than `at`.
    pub fn ensure_at(&self, at: DateTime<Utc>) {
        self.inner.ensure_at(at);
    }

    /// Requests an immediate ensure pass.
    ///
    /// Unlike `ensure_at`, this always wakes the loop, even when an earlier
    /// request is still pending.
    pub fn ensure_now(&self) {
        self.inner.ensure_at(self.now());
        let _ = self.inner.ensure.tx.try_send(());
    }

    /// Writes the current graph through the checkpointer, even if nothing
    /// changed since the last checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        let mut guard = self.lock();
        guard.mark_modified();
        guard.unlock()
    }
}

impl StateInner {
    fn ensure_at(&self, at: DateTime<Utc>) {
        {
            let mut deadline = self
                .ensure
                .deadline
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *deadline {
                Some(current) if current <= at => return,
                _ => *deadline = Some(at),
            }
        }
        // A full channel already carries a pending wake-up.
        let _ = self.ensure.tx.try_send(());
    }
}

fn write_ordered(inner: &StateInner, generation: u64, bytes: &[u8]) -> Result<()> {
    let Some(checkpointer) = &inner.checkpointer else {
        return Ok(());
    };
    let mut written = inner.written.lock().unwrap_or_else(PoisonError::into_inner);
    if *written >= generation {
        debug!("Skipping checkpoint {}: {} already written", generation, *written);
        return Ok(());
    }
    checkpointer.checkpoint(bytes)?;
    *written = generation;
    Ok(())
}

/// Proof that the state lock is held. All graph accessors live here.
pub struct StateGuard<'a> {
    inner: &'a StateInner,
    data: Option<MutexGuard<'a, StateData>>,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("State checkpoint failed: {}", e);
            *self
                .inner
                .checkpoint_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
        }
    }
}

impl<'a> StateGuard<'a> {
    fn d(&self) -> &StateData {
        self.data.as_ref().expect("state guard used after release")
    }

    fn d_mut(&mut self) -> &mut StateData {
        self.data.as_mut().expect("state guard used after release")
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut data) = self.data.take() else {
            return Ok(());
        };
        if !data.modified {
            return Ok(());
        }
        data.modified = false;
        data.generation += 1;
        let generation = data.generation;
        if self.inner.checkpointer.is_none() {
            return Ok(());
        }
        let bytes = persist::encode(&data)?;
        drop(data);
        write_ordered(self.inner, generation, &bytes)
    }

    /// Releases the lock, returning any checkpoint failure to the caller.
    pub fn unlock(mut self) -> Result<()> {
        self.release()
    }

    pub(crate) fn mark_modified(&mut self) {
        self.d_mut().modified = true;
    }

    /// Runs `f` against the raw graph.
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&StateData) -> R) -> R {
        f(self.d())
    }

    /// Returns true if something changed since the last checkpoint.
    pub fn is_modified(&self) -> bool {
        self.d().modified
    }

    /// Current time according to the state's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ========================================================================
    // Changes and tasks
    // ========================================================================

    /// Creates a new change and wakes the ensure loop.
    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let now = self.now();
        let d = self.d_mut();
        if !d.known_change_kinds.is_empty() && !d.known_change_kinds.contains(kind) {
            warn!("Creating change of unregistered kind {:?}", kind);
        }
        d.last_change_id += 1;
        let id = ChangeId::new(d.last_change_id);
        d.changes.insert(id, Change::new(id, kind, summary, now));
        d.modified = true;
        debug!("New change {} ({}): {}", id, kind, summary);
        self.request_ensure(now);
        id
    }

    /// Creates a new task not yet attached to any change.
    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        let now = self.now();
        let d = self.d_mut();
        d.last_task_id += 1;
        let id = TaskId::new(d.last_task_id);
        d.tasks.insert(id, Task::new(id, kind, summary, now));
        d.modified = true;
        id
    }

    pub fn change(&self, id: ChangeId) -> Option<&Change> {
        self.d().changes.get(&id)
    }

    /// Mutable access to a change. Marks the state as modified.
    pub fn change_mut(&mut self, id: ChangeId) -> Option<&mut Change> {
        let d = self.d_mut();
        let change = d.changes.get_mut(&id)?;
        d.modified = true;
        Some(change)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.d().tasks.get(&id)
    }

    /// Mutable access to a task. Marks the state as modified.
    ///
    /// Status is not writable through this handle; the runner owns it.
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let d = self.d_mut();
        let task = d.tasks.get_mut(&id)?;
        d.modified = true;
        Some(task)
    }

    /// All changes in id order.
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.d().changes.values()
    }

    /// All tasks in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.d().tasks.values()
    }

    pub fn changes_by_kind<'s>(&'s self, kind: &'s str) -> impl Iterator<Item = &'s Change> {
        self.changes().filter(move |c| c.kind() == kind)
    }

    pub fn tasks_by_kind<'s>(&'s self, kind: &'s str) -> impl Iterator<Item = &'s Task> {
        self.tasks().filter(move |t| t.kind() == kind)
    }

    /// Member tasks of a change, in insertion order.
    pub fn change_tasks(&self, id: ChangeId) -> Vec<&Task> {
        self.change(id)
            .map(|c| c.task_ids().iter().filter_map(|t| self.task(*t)).collect())
            .unwrap_or_default()
    }

    /// Aggregate status of a change, derived from its member tasks.
    pub fn change_status(&self, id: ChangeId) -> Option<Status> {
        let change = self.change(id)?;
        Some(Status::aggregate(
            change
                .task_ids()
                .iter()
                .filter_map(|t| self.task(*t))
                .map(Task::status),
        ))
    }

    /// True if the change reached a terminal aggregate status.
    pub fn is_change_ready(&self, id: ChangeId) -> bool {
        self.change_status(id).is_some_and(Status::is_ready)
    }

    /// Composes the error log lines of the change's failed tasks.
    pub fn change_err(&self, id: ChangeId) -> Option<String> {
        let mut lines = Vec::new();
        for task in self.change_tasks(id) {
            if task.status() != Status::Error {
                continue;
            }
            lines.push(format!("- {} ({})", task.summary(), task.error_summary()));
        }
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "cannot perform the following tasks:\n{}",
            lines.join("\n")
        ))
    }

    /// Links a task into a change.
    pub fn add_task(&mut self, change_id: ChangeId, task_id: TaskId) -> Result<()> {
        if self.change(change_id).is_none() {
            return Err(OverlordError::not_found(format!("change {}", change_id)));
        }
        let task = self
            .task(task_id)
            .ok_or_else(|| OverlordError::not_found(format!("task {}", task_id)))?;
        match task.change() {
            Some(existing) if existing == change_id => return Ok(()),
            Some(existing) => {
                return Err(OverlordError::general(format!(
                    "task {} already belongs to change {}",
                    task_id, existing
                )));
            }
            None => {}
        }
        let d = self.d_mut();
        if let Some(task) = d.tasks.get_mut(&task_id) {
            task.change = Some(change_id);
        }
        if let Some(change) = d.changes.get_mut(&change_id) {
            change.task_ids.push(task_id);
            change.ready_time = None;
        }
        d.modified = true;
        Ok(())
    }

    /// Makes `task` wait for `dependency` to be `Done` before running.
    ///
    /// Rejects edges that would close a cycle.
    pub fn wait_for(&mut self, task_id: TaskId, dependency: TaskId) -> Result<()> {
        for id in [task_id, dependency] {
            if self.task(id).is_none() {
                return Err(OverlordError::not_found(format!("task {}", id)));
            }
        }
        if self.depends_on(dependency, task_id) {
            return Err(OverlordError::Cycle {
                task: task_id,
                dependency,
            });
        }
        let d = self.d_mut();
        if let Some(task) = d.tasks.get_mut(&task_id) {
            if task.wait_tasks.contains(&dependency) {
                return Ok(());
            }
            task.wait_tasks.push(dependency);
        }
        if let Some(dep) = d.tasks.get_mut(&dependency) {
            dep.halt_tasks.push(task_id);
        }
        d.modified = true;
        Ok(())
    }

    /// Makes `task` wait for every task in `set`.
    pub fn wait_all(&mut self, task_id: TaskId, set: &TaskSet) -> Result<()> {
        for dep in set.tasks() {
            self.wait_for(task_id, *dep)?;
        }
        Ok(())
    }

    /// Adds every task of `set` to a change.
    pub fn add_all(&mut self, change_id: ChangeId, set: &TaskSet) -> Result<()> {
        for task in set.tasks() {
            self.add_task(change_id, *task)?;
        }
        Ok(())
    }

    /// True if `from` transitively waits on `target` (or is it).
    fn depends_on(&self, from: TaskId, target: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.task(id) {
                stack.extend(task.wait_tasks().iter().copied());
            }
        }
        false
    }

    /// True if every task this one waits for is `Done`.
    pub fn is_ready(&self, id: TaskId) -> bool {
        self.task(id).is_some_and(|task| {
            task.wait_tasks()
                .iter()
                .all(|w| self.task(*w).is_some_and(|t| t.status() == Status::Done))
        })
    }

    /// Sets a task's status, maintaining task and change ready times.
    ///
    /// Returns false (and leaves the state untouched) if the status is unchanged.
    pub(crate) fn set_status(&mut self, id: TaskId, status: Status) -> bool {
        let now = self.now();
        let d = self.d_mut();
        let Some(task) = d.tasks.get_mut(&id) else {
            return false;
        };
        if task.status == status {
            return false;
        }
        task.status = status;
        task.ready_time = status.is_ready().then_some(now);
        let change_id = task.change;
        d.modified = true;
        if let Some(change_id) = change_id {
            self.refresh_change_ready(change_id, now);
        }
        true
    }

    fn refresh_change_ready(&mut self, id: ChangeId, now: DateTime<Utc>) {
        let ready = self.change_status(id).is_some_and(Status::is_ready);
        if let Some(change) = self.d_mut().changes.get_mut(&id) {
            match (ready, change.ready_time) {
                (true, None) => change.ready_time = Some(now),
                (false, Some(_)) => change.ready_time = None,
                _ => {}
            }
        }
    }

    /// Puts a task that has not started yet on hold, e.g. because a
    /// conflicting operation superseded it.
    pub fn hold_task(&mut self, id: TaskId) -> Result<()> {
        let task = self
            .task(id)
            .ok_or_else(|| OverlordError::not_found(format!("task {}", id)))?;
        match task.status() {
            Status::Do | Status::Wait => {
                self.set_status(id, Status::Hold);
                Ok(())
            }
            Status::Hold => Ok(()),
            other => Err(OverlordError::general(format!(
                "cannot hold task {} in status {}",
                id, other
            ))),
        }
    }

    /// Holds every `Do` task that waits on a task which ended without
    /// completing (`Hold`, `Error`, `Undone`). Such tasks can never run.
    /// Repeats until holds stop propagating and returns the held ids.
    pub(crate) fn hold_blocked_tasks(&mut self) -> Vec<TaskId> {
        let mut held = Vec::new();
        loop {
            let blocked: Vec<(TaskId, TaskId, Status)> = self
                .tasks()
                .filter(|t| t.status() == Status::Do)
                .filter_map(|t| {
                    t.wait_tasks().iter().find_map(|w| {
                        self.task(*w)
                            .map(Task::status)
                            .filter(|s| s.is_ready() && *s != Status::Done)
                            .map(|s| (t.id(), *w, s))
                    })
                })
                .collect();
            if blocked.is_empty() {
                return held;
            }
            for (id, wait, status) in blocked {
                self.logf(id, format!("held: task {wait} ended in {status}"));
                self.set_status(id, Status::Hold);
                held.push(id);
            }
        }
    }

    /// Aborts a change: pending work is held, running work is asked to stop,
    /// finished work is scheduled for undo.
    pub fn abort_change(&mut self, id: ChangeId) -> Result<()> {
        let task_ids = self
            .change(id)
            .ok_or_else(|| OverlordError::not_found(format!("change {}", id)))?
            .task_ids()
            .to_vec();
        for task_id in task_ids {
            let Some(status) = self.task(task_id).map(Task::status) else {
                continue;
            };
            let next = match status {
                Status::Do | Status::Wait => Status::Hold,
                Status::Doing => Status::Abort,
                Status::Done => Status::Undo,
                _ => continue,
            };
            self.set_status(task_id, next);
        }
        self.request_ensure(self.now());
        Ok(())
    }

    /// Removes a change and all of its tasks, dropping edges that pointed at them.
    pub fn remove_change(&mut self, id: ChangeId) -> Result<()> {
        let change = self
            .d_mut()
            .changes
            .remove(&id)
            .ok_or_else(|| OverlordError::not_found(format!("change {}", id)))?;
        for task_id in change.task_ids() {
            self.remove_task_unchecked(*task_id);
        }
        self.d_mut().modified = true;
        Ok(())
    }

    /// Removes a task that does not belong to any change.
    pub fn remove_task(&mut self, id: TaskId) -> Result<()> {
        let task = self
            .task(id)
            .ok_or_else(|| OverlordError::not_found(format!("task {}", id)))?;
        if let Some(change) = task.change() {
            return Err(OverlordError::general(format!(
                "task {} belongs to change {}",
                id, change
            )));
        }
        self.remove_task_unchecked(id);
        self.d_mut().modified = true;
        Ok(())
    }

    fn remove_task_unchecked(&mut self, id: TaskId) {
        let d = self.d_mut();
        let Some(task) = d.tasks.remove(&id) else {
            return;
        };
        for other in task.wait_tasks.iter().chain(task.halt_tasks.iter()) {
            if let Some(other) = d.tasks.get_mut(other) {
                other.wait_tasks.retain(|t| *t != id);
                other.halt_tasks.retain(|t| *t != id);
            }
        }
    }

    /// Appends an info line to a task's log.
    pub fn logf(&mut self, id: TaskId, message: impl Into<String>) {
        let now = self.now();
        if let Some(task) = self.task_mut(id) {
            task.logf(now, message);
        }
    }

    /// Appends an error line to a task's log.
    pub fn errorf(&mut self, id: TaskId, message: impl Into<String>) {
        let now = self.now();
        if let Some(task) = self.task_mut(id) {
            task.errorf(now, message);
        }
    }

    // ========================================================================
    // Custom data
    // ========================================================================

    /// Stores a serializable value under `key`.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let d = self.d_mut();
        if d.data.get(key) == Some(&value) {
            return Ok(());
        }
        d.data.insert(key.to_string(), value);
        d.modified = true;
        Ok(())
    }

    /// Reads the value stored under `key`; `Ok(None)` if absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        get_value(&self.d().data, key)
    }

    /// Removes the value stored under `key`.
    pub fn remove(&mut self, key: &str) {
        let d = self.d_mut();
        if d.data.remove(key).is_some() {
            d.modified = true;
        }
    }

    // ========================================================================
    // Ensure wake-ups and change kinds
    // ========================================================================

    /// Requests an ensure pass within `delay`.
    pub fn ensure_before(&mut self, delay: chrono::Duration) {
        let at = self.now() + delay;
        self.request_ensure(at);
    }

    fn request_ensure(&self, at: DateTime<Utc>) {
        self.inner.ensure_at(at);
    }

    /// Registers a change kind as known to the daemon.
    pub fn register_change_kind(&mut self, kind: &str) {
        self.d_mut().known_change_kinds.insert(kind.to_string());
    }

    /// Change kinds registered so far.
    pub fn known_change_kinds(&self) -> Vec<String> {
        self.d().known_change_kinds.iter().cloned().collect()
    }
}

pub(crate) fn get_value<T: DeserializeOwned>(
    map: &BTreeMap<String, Value>,
    key: &str,
) -> Result<Option<T>> {
    match map.get(key) {
        Some(value) => Ok(Some(T::deserialize(value)?)),
        None => Ok(None),
    }
}

pub(crate) fn set_value<T: Serialize>(
    map: &mut BTreeMap<String, Value>,
    key: &str,
    value: &T,
) -> Result<()> {
    map.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(())
}

//! Persistence Layer
//!
//! Serializes the whole state graph into one JSON document and writes it
//! atomically (temp file in the same directory, fsync, rename), so a crash
//! mid-write always leaves the previous good copy in place.
//!
//! # Document Layout
//!
//! ```text
//! {
//!   "data":           { key: value, ... },
//!   "changes":        [ { id, kind, summary, spawn-time, ready-time, task-ids, data } ],
//!   "tasks":          [ { id, kind, summary, status, change, wait-tasks, halt-tasks,
//!                         retry-count, at, log, data, progress, spawn-time, ... } ],
//!   "last-change-id": n,
//!   "last-task-id":   n
//! }
//! ```
//!
//! Maps are ordered, so the same graph always produces the same bytes.
//!
//! # Loading
//!
//! - Missing file: start empty.
//! - Malformed JSON or dangling ids: fatal `OverlordError::Persistence`.
//! - Tasks interrupted by a crash are put back where the runner picks them up
//!   again: `Doing → Do`, `Undoing → Undo`, `Abort → Undo`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{OverlordError, Result};
use crate::state::{Change, State, StateData, Status, Task, TaskId};

/// Receives serialized snapshots of the state after every mutating unlock.
pub trait Checkpointer: Send + Sync {
    /// Durably stores `data`, replacing the previous snapshot.
    fn checkpoint(&self, data: &[u8]) -> Result<()>;
}

/// Stores snapshots in a single file, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpointer for FileBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<()> {
        atomic_write(&self.path, data)
    }
}

/// Keeps every snapshot in memory. Useful for tests and embedders that
/// persist elsewhere.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots written so far.
    pub fn write_count(&self) -> usize {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The most recent snapshot.
    pub fn last(&self) -> Option<Vec<u8>> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Checkpointer for MemoryBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<()> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        Ok(())
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| {
        OverlordError::persistence(format!("cannot create {}: {e}", dir.display()))
    })?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        OverlordError::persistence(format!(
            "cannot create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    temp.write_all(data)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| OverlordError::persistence(format!("cannot write state temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        OverlordError::persistence(format!("cannot persist state to {}: {e}", path.display()))
    })?;
    debug!("Checkpointed {} bytes to {}", data.len(), path.display());
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct SnapshotRef<'a> {
    data: &'a BTreeMap<String, Value>,
    changes: Vec<&'a Change>,
    tasks: Vec<&'a Task>,
    last_change_id: u64,
    last_task_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Snapshot {
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
}

pub(crate) fn encode(data: &StateData) -> Result<Vec<u8>> {
    let snapshot = SnapshotRef {
        data: &data.data,
        changes: data.changes.values().collect(),
        tasks: data.tasks.values().collect(),
        last_change_id: data.last_change_id,
        last_task_id: data.last_task_id,
    };
    Ok(serde_json::to_vec(&snapshot)?)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<StateData> {
    let snapshot: Snapshot = serde_json::from_slice(bytes)
        .map_err(|e| OverlordError::persistence(format!("malformed state: {e}")))?;

    let mut data = StateData::default();
    data.data = snapshot.data;
    data.last_change_id = snapshot.last_change_id;
    data.last_task_id = snapshot.last_task_id;
    for change in snapshot.changes {
        let id = change.id();
        if data.changes.insert(id, change).is_some() {
            return Err(OverlordError::persistence(format!("duplicate change {id}")));
        }
    }
    for task in snapshot.tasks {
        let id = task.id();
        if data.tasks.insert(id, task).is_some() {
            return Err(OverlordError::persistence(format!("duplicate task {id}")));
        }
    }
    validate(&data)?;
    Ok(data)
}

/// Checks that every id reference in the graph resolves.
fn validate(data: &StateData) -> Result<()> {
    let malformed = |msg: String| Err(OverlordError::persistence(msg));

    for change in data.changes.values() {
        if change.id().get() > data.last_change_id {
            return malformed(format!("change {} above last-change-id", change.id()));
        }
        let mut members = BTreeSet::new();
        for task_id in change.task_ids() {
            match data.tasks.get(task_id) {
                Some(task) if task.change() == Some(change.id()) => {}
                Some(_) => {
                    return malformed(format!(
                        "task {} listed in change {} belongs elsewhere",
                        task_id,
                        change.id()
                    ));
                }
                None => {
                    return malformed(format!(
                        "change {} refers to missing task {}",
                        change.id(),
                        task_id
                    ));
                }
            }
            if !members.insert(*task_id) {
                return malformed(format!(
                    "task {} listed twice in change {}",
                    task_id,
                    change.id()
                ));
            }
        }
    }

    for task in data.tasks.values() {
        if task.id().get() > data.last_task_id {
            return malformed(format!("task {} above last-task-id", task.id()));
        }
        if let Some(change_id) = task.change() {
            let listed = data
                .changes
                .get(&change_id)
                .is_some_and(|c| c.task_ids().contains(&task.id()));
            if !listed {
                return malformed(format!(
                    "task {} refers to change {} that does not list it",
                    task.id(),
                    change_id
                ));
            }
        }
        for edge in task.wait_tasks().iter().chain(task.halt_tasks()) {
            if !data.tasks.contains_key(edge) {
                return malformed(format!("task {} refers to missing task {}", task.id(), edge));
            }
        }
        check_edges(data, task)?;
    }
    check_acyclic(data)
}

/// Every wait edge must be mirrored by a halt edge and the other way round.
fn check_edges(data: &StateData, task: &Task) -> Result<()> {
    let id = task.id();
    let mut seen = BTreeSet::new();
    for wait in task.wait_tasks() {
        if !seen.insert(*wait) {
            return Err(OverlordError::persistence(format!(
                "task {id} waits for {wait} twice"
            )));
        }
        if !data.tasks.get(wait).is_some_and(|w| w.halt_tasks().contains(&id)) {
            return Err(OverlordError::persistence(format!(
                "task {id} waits for {wait} but {wait} does not halt it"
            )));
        }
    }
    let mut seen = BTreeSet::new();
    for halt in task.halt_tasks() {
        if !seen.insert(*halt) {
            return Err(OverlordError::persistence(format!(
                "task {id} halts {halt} twice"
            )));
        }
        if !data.tasks.get(halt).is_some_and(|h| h.wait_tasks().contains(&id)) {
            return Err(OverlordError::persistence(format!(
                "task {id} halts {halt} but {halt} does not wait for it"
            )));
        }
    }
    Ok(())
}

/// Rejects dependency cycles by peeling off tasks with no pending waits.
fn check_acyclic(data: &StateData) -> Result<()> {
    let mut pending: BTreeMap<TaskId, usize> = data
        .tasks
        .values()
        .map(|t| (t.id(), t.wait_tasks().len()))
        .collect();
    let mut free: Vec<TaskId> = pending
        .iter()
        .filter(|(_, waits)| **waits == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut peeled = 0;
    while let Some(id) = free.pop() {
        peeled += 1;
        let Some(task) = data.tasks.get(&id) else {
            continue;
        };
        for halt in task.halt_tasks() {
            if let Some(waits) = pending.get_mut(halt) {
                *waits -= 1;
                if *waits == 0 {
                    free.push(*halt);
                }
            }
        }
    }
    if peeled < data.tasks.len() {
        let stuck: Vec<String> = pending
            .iter()
            .filter(|(_, waits)| **waits > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(OverlordError::persistence(format!(
            "dependency cycle among tasks [{}]",
            stuck.join(", ")
        )));
    }
    Ok(())
}

/// Puts tasks that were running when the process died back into a runnable status.
fn recover_interrupted(data: &mut StateData) -> usize {
    let mut recovered = 0;
    for task in data.tasks.values_mut() {
        let next = match task.status {
            Status::Doing => Status::Do,
            Status::Undoing | Status::Abort => Status::Undo,
            _ => continue,
        };
        warn!(
            "Task {} ({}) was {} when the daemon stopped, now {}",
            task.id, task.kind, task.status, next
        );
        task.status = next;
        recovered += 1;
    }
    recovered
}

/// Serializes the state's graph without touching any backend.
pub fn encode_state(state: &State) -> Result<Vec<u8>> {
    let st = state.lock();
    st.with_data(encode)
}

/// Builds a state from a serialized graph, exactly as written.
pub fn decode_state(
    bytes: &[u8],
    clock: Arc<dyn Clock>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
) -> Result<State> {
    Ok(State::from_data(decode(bytes)?, clock, checkpointer))
}

/// Loads the state file at `path`, starting empty if it does not exist.
///
/// Tasks interrupted by a previous crash are recovered. A present but
/// malformed file is an error; nothing is silently discarded.
pub fn load_state(
    path: &Path,
    clock: Arc<dyn Clock>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
) -> Result<State> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No state file at {}, starting empty", path.display());
            return Ok(State::new(clock, checkpointer));
        }
        Err(e) => {
            return Err(OverlordError::persistence(format!(
                "cannot read {}: {e}",
                path.display()
            )));
        }
    };
    let mut data = decode(&bytes).map_err(|e| {
        OverlordError::persistence(format!("cannot load {}: {e}", path.display()))
    })?;
    let recovered = recover_interrupted(&mut data);
    info!(
        "Loaded {} change(s) and {} task(s) from {} ({} recovered)",
        data.changes.len(),
        data.tasks.len(),
        path.display(),
        recovered
    );
    let state = State::from_data(data, clock, checkpointer);
    if recovered > 0 {
        state.checkpoint()?;
    }
    Ok(state)
}

//! Task Runner
//!
//! Dispatches ready tasks to their kind's handler and records the outcome.
//!
//! # Problem Solved
//! Handlers do slow, fallible work (downloads, mounts, service restarts)
//! that must not hold the state lock, must not take the daemon down when it
//! panics, and must be resumable after a crash.
//!
//! # Solution
//! - Each ensure pass scans the graph under the state lock and moves
//!   dispatchable tasks to `Doing`/`Undoing` before releasing it
//! - Every handler runs on its own worker thread inside `catch_unwind`
//! - The worker reacquires the lock to record the outcome, then reports
//!   back on a channel so the next pass can join it
//! - A private registry tracks running workers and their cancel tokens
//!
//! # Lock Order
//! The running registry is only ever locked while the state lock is held,
//! or on its own. Never the other way around.

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{OverlordError, Result};
use crate::shutdown::CancelToken;
use crate::state::{ChangeId, State, StateGuard, Status, TaskId};

/// Default number of handlers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 16;

/// How a handler run ended, other than success.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Run the handler again after `after`.
    #[error("retry requested in {after:?}: {reason}")]
    Retry { after: Duration, reason: String },

    /// The handler noticed its cancel token and stopped early.
    #[error("task aborted")]
    Aborted,

    /// The handler failed; the task goes to `Error`.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn retry(after: Duration, reason: impl Into<String>) -> Self {
        Self::Retry {
            after,
            reason: reason.into(),
        }
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A do or undo handler for one task kind.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&TaskContext) -> HandlerResult + Send + Sync>);

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&TaskContext) -> HandlerResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, ctx: &TaskContext) -> HandlerResult {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

#[derive(Debug, Clone)]
struct HandlerPair {
    do_handler: Handler,
    undo_handler: Option<Handler>,
}

/// Cap on automatic retries. `None` retries forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    pub const fn unbounded() -> Self {
        Self { max_retries: None }
    }

    pub const fn at_most(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }

    /// True if a task that already retried `retry_count` times may retry again.
    pub fn allows(&self, retry_count: u32) -> bool {
        self.max_retries.is_none_or(|max| retry_count < max)
    }
}

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct TaskContext {
    state: State,
    task_id: TaskId,
    change_id: Option<ChangeId>,
    undo: bool,
    cancel: CancelToken,
}

impl TaskContext {
    /// The shared state. Lock it to read parameters or store results.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn change_id(&self) -> Option<ChangeId> {
        self.change_id
    }

    /// True when running the undo handler.
    pub fn is_undo(&self) -> bool {
        self.undo
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleeps up to `timeout`; returns `Err(Aborted)` if cancelled meanwhile.
    pub fn sleep(&self, timeout: Duration) -> HandlerResult {
        if self.cancel.wait_timeout(timeout) {
            return Err(HandlerError::Aborted);
        }
        Ok(())
    }

    /// Appends an info line to this task's log.
    pub fn logf(&self, message: impl Into<String>) {
        self.state.lock().logf(self.task_id, message);
    }

    pub fn set_progress(&self, label: &str, done: u64, total: u64) {
        let mut st = self.state.lock();
        if let Some(task) = st.task_mut(self.task_id) {
            task.set_progress(label, done, total);
        }
    }
}

struct RunningTask {
    cancel: CancelToken,
    undo: bool,
    handle: JoinHandle<()>,
}

/// Workers currently executing a handler, keyed by task.
#[derive(Default)]
struct RunningRegistry {
    tasks: BTreeMap<TaskId, RunningTask>,
}

impl RunningRegistry {
    fn register(&mut self, id: TaskId, task: RunningTask) {
        self.tasks.insert(id, task);
        debug!("Registered worker for task {}", id);
    }

    /// Joins a worker that reported completion.
    fn finish(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        if task.handle.join().is_err() {
            error!("Worker thread for task {} died outside its handler", id);
        }
        debug!("Joined worker for task {} (undo: {})", id, task.undo);
    }

    fn cancel_all(&self) {
        for (id, task) in &self.tasks {
            debug!("Cancelling task {}", id);
            task.cancel.cancel();
        }
    }

    fn count(&self) -> usize {
        self.tasks.len()
    }
}

struct RunnerInner {
    state: State,
    handlers: Mutex<BTreeMap<String, HandlerPair>>,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    running: Mutex<RunningRegistry>,
    done_tx: Sender<TaskId>,
    done_rx: Receiver<TaskId>,
    stopping: AtomicBool,
}

/// Executes task handlers. Cloning is cheap; clones share workers.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("kinds", &self.known_task_kinds())
            .field("running", &self.running_count())
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish()
    }
}

impl TaskRunner {
    /// Creates a runner with unbounded retries and the default concurrency cap.
    pub fn new(state: State) -> Self {
        Self::with_limits(state, DEFAULT_MAX_CONCURRENT_TASKS, RetryPolicy::default())
    }

    pub fn with_limits(state: State, max_concurrent: usize, retry_policy: RetryPolicy) -> Self {
        let (done_tx, done_rx) = channel::unbounded();
        Self {
            inner: Arc::new(RunnerInner {
                state,
                handlers: Mutex::new(BTreeMap::new()),
                retry_policy,
                max_concurrent: max_concurrent.max(1),
                running: Mutex::new(RunningRegistry::default()),
                done_tx,
                done_rx,
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Registers the handlers for a task kind, replacing any earlier ones.
    ///
    /// Without an undo handler, tasks of this kind are marked `Undone`
    /// directly when their change is aborted.
    pub fn add_handler(&self, kind: &str, do_handler: Handler, undo_handler: Option<Handler>) {
        let mut handlers = self.handlers();
        if handlers
            .insert(
                kind.to_string(),
                HandlerPair {
                    do_handler,
                    undo_handler,
                },
            )
            .is_some()
        {
            warn!("Replacing handlers for task kind {:?}", kind);
        }
    }

    /// Task kinds with a registered handler, sorted.
    pub fn known_task_kinds(&self) -> Vec<String> {
        self.handlers().keys().cloned().collect()
    }

    /// Number of workers not yet joined.
    pub fn running_count(&self) -> usize {
        self.registry().count()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry_policy
    }

    /// Fails if any unfinished task has a kind without a handler.
    pub fn check_handlers(&self) -> Result<()> {
        let st = self.inner.state.lock();
        let handlers = self.handlers();
        for task in st.tasks() {
            if !task.status().is_ready() && !handlers.contains_key(task.kind()) {
                return Err(OverlordError::MissingHandler {
                    kind: task.kind().to_string(),
                });
            }
        }
        Ok(())
    }

    fn handlers(&self) -> MutexGuard<'_, BTreeMap<String, HandlerPair>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, RunningRegistry> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reap(&self, running: &mut RunningRegistry) {
        while let Ok(id) = self.inner.done_rx.try_recv() {
            running.finish(id);
        }
    }

    /// Runs one dispatch pass.
    ///
    /// Returns `MissingHandler` if a task due to run has no handler.
    pub fn ensure(&self) -> Result<()> {
        let mut st = self.inner.state.lock();
        let mut running = self.registry();
        self.reap(&mut running);
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Running tasks whose change got aborted are asked to stop.
        for (id, task) in &running.tasks {
            if st.task(*id).is_some_and(|t| t.status() == Status::Abort) {
                task.cancel.cancel();
            }
        }

        for id in st.hold_blocked_tasks() {
            debug!("Task {} can no longer run, holding it", id);
        }

        let now = st.now();
        let handlers = self.handlers().clone();
        let active_changes: BTreeSet<ChangeId> = st
            .changes()
            .map(|c| c.id())
            .filter(|id| !st.is_change_ready(*id))
            .collect();
        let candidates: Vec<TaskId> = st
            .tasks()
            .filter(|t| t.change().is_some_and(|c| active_changes.contains(&c)))
            .filter(|t| matches!(t.status(), Status::Do | Status::Wait | Status::Undo))
            .map(|t| t.id())
            .collect();

        let mut next_wake: Option<DateTime<Utc>> = None;
        let mut dispatched = 0;
        for id in candidates {
            if running.tasks.contains_key(&id) {
                continue;
            }
            let Some(task) = st.task(id) else {
                continue;
            };
            let status = task.status();
            let kind = task.kind().to_string();
            let at = task.at();

            let undo = match status {
                Status::Do if st.is_ready(id) => false,
                Status::Wait => false,
                Status::Undo if self.halt_tasks_ready(&st, id) => true,
                _ => continue,
            };
            if let Some(at) = at.filter(|at| *at > now) {
                next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
                continue;
            }
            let pair = handlers
                .get(&kind)
                .ok_or_else(|| OverlordError::MissingHandler { kind: kind.clone() })?;
            let handler = if undo {
                match &pair.undo_handler {
                    Some(h) => h.clone(),
                    None => {
                        debug!("Task {} ({}) has no undo handler, marking undone", id, kind);
                        st.set_status(id, Status::Undone);
                        continue;
                    }
                }
            } else {
                pair.do_handler.clone()
            };
            if running.count() >= self.inner.max_concurrent {
                debug!(
                    "Concurrency limit {} reached, task {} waits",
                    self.inner.max_concurrent, id
                );
                continue;
            }
            self.dispatch(&mut st, &mut running, id, undo, handler)?;
            dispatched += 1;
        }

        if let Some(at) = next_wake {
            self.inner.state.ensure_at(at);
        }
        if dispatched > 0 {
            debug!(
                "Ensure pass dispatched {} task(s), {} running",
                dispatched,
                running.count()
            );
        }
        Ok(())
    }

    fn halt_tasks_ready(&self, st: &StateGuard<'_>, id: TaskId) -> bool {
        st.task(id).is_some_and(|task| {
            task.halt_tasks()
                .iter()
                .all(|h| st.task(*h).is_none_or(|t| t.status().is_ready()))
        })
    }

    fn dispatch(
        &self,
        st: &mut StateGuard<'_>,
        running: &mut RunningRegistry,
        id: TaskId,
        undo: bool,
        handler: Handler,
    ) -> Result<()> {
        let previous = st.task(id).map(|t| t.status()).unwrap_or_default();
        let change_id = st.task(id).and_then(|t| t.change());
        st.set_status(id, if undo { Status::Undoing } else { Status::Doing });

        let cancel = CancelToken::new();
        let ctx = TaskContext {
            state: self.inner.state.clone(),
            task_id: id,
            change_id,
            undo,
            cancel: cancel.clone(),
        };
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || run_worker(&inner, handler, ctx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                st.set_status(id, previous);
                return Err(e.into());
            }
        };
        debug!("Dispatched task {} (undo: {})", id, undo);
        running.register(
            id,
            RunningTask {
                cancel,
                undo,
                handle,
            },
        );
        Ok(())
    }

    /// Cancels every running handler and waits up to `timeout` for them to
    /// return. No new work is dispatched afterwards.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        {
            let running = self.registry();
            if running.count() > 0 {
                info!("Stopping {} running task(s)...", running.count());
            }
            running.cancel_all();
        }

        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut running = self.registry();
                self.reap(&mut running);
                if running.count() == 0 {
                    return Ok(());
                }
            }
            match self.inner.done_rx.recv_deadline(deadline) {
                Ok(id) => self.registry().finish(id),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
            }
        }

        let left = self.running_count();
        if left == 0 {
            return Ok(());
        }
        warn!("{} task(s) still running after {:?}", left, timeout);
        Err(OverlordError::general(format!(
            "{left} task(s) did not stop within {timeout:?}"
        )))
    }

    /// True once `stop` was called.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }
}

/// Outcome of one handler run, with panics folded in.
enum Outcome {
    Done,
    Retry { after: Duration, reason: String },
    Aborted,
    Failed(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_worker(inner: &RunnerInner, handler: Handler, ctx: TaskContext) {
    let id = ctx.task_id;
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&ctx))) {
        Ok(Ok(())) => Outcome::Done,
        Ok(Err(HandlerError::Retry { after, reason })) => Outcome::Retry { after, reason },
        Ok(Err(HandlerError::Aborted)) => Outcome::Aborted,
        Ok(Err(HandlerError::Failed(e))) => Outcome::Failed(format!("{e:#}")),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!("Handler for task {} panicked: {}", id, msg);
            Outcome::Failed(format!("internal error: handler panicked: {msg}"))
        }
    };

    record_outcome(inner, id, ctx.undo, outcome);
    inner.state.ensure_now();
    // The runner may be gone already; nobody is left to join us then.
    let _ = inner.done_tx.send(id);
}

fn retry_at(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn record_outcome(inner: &RunnerInner, id: TaskId, undo: bool, outcome: Outcome) {
    let mut st = inner.state.lock();
    let Some(task) = st.task(id) else {
        warn!("Task {} vanished while its handler ran", id);
        return;
    };
    let status = task.status();
    let retry_count = task.retry_count();
    let change_id = task.change();
    let stopping = inner.stopping.load(Ordering::SeqCst);
    let now = st.now();

    if !undo && status == Status::Abort {
        // The change was aborted while we ran.
        let next = match outcome {
            Outcome::Done => Status::Undo,
            Outcome::Failed(msg) => {
                st.errorf(id, msg);
                Status::Hold
            }
            Outcome::Retry { .. } | Outcome::Aborted => Status::Hold,
        };
        debug!("Aborted task {} finished, now {}", id, next);
        st.set_status(id, next);
        return;
    }

    match outcome {
        Outcome::Done => {
            st.set_status(id, if undo { Status::Undone } else { Status::Done });
        }
        Outcome::Retry { after, reason } => {
            if !inner.retry_policy.allows(retry_count) {
                let msg = format!("giving up after {retry_count} retries: {reason}");
                warn!("Task {}: {}", id, msg);
                fail_task(&mut st, id, undo, change_id, msg);
                return;
            }
            let at = retry_at(now, after);
            if let Some(task) = st.task_mut(id) {
                task.retry_count += 1;
                task.at = Some(at);
            }
            st.logf(id, format!("will retry in {after:?}: {reason}"));
            st.set_status(id, if undo { Status::Undo } else { Status::Wait });
            inner.state.ensure_at(at);
        }
        Outcome::Aborted if stopping => {
            // Picked up again after restart.
            st.logf(id, "interrupted by shutdown");
            st.set_status(id, if undo { Status::Undo } else { Status::Do });
        }
        Outcome::Aborted => {
            if undo {
                fail_task(&mut st, id, true, change_id, "undo aborted".to_string());
            } else {
                st.logf(id, "aborted");
                st.set_status(id, Status::Hold);
            }
        }
        Outcome::Failed(msg) => fail_task(&mut st, id, undo, change_id, msg),
    }
}

fn fail_task(
    st: &mut StateGuard<'_>,
    id: TaskId,
    undo: bool,
    change_id: Option<ChangeId>,
    msg: String,
) {
    error!("Task {} failed{}: {}", id, if undo { " to undo" } else { "" }, msg);
    st.errorf(id, msg);
    if undo {
        if let Some(task) = st.task_mut(id) {
            task.undo_failed = true;
        }
    }
    st.set_status(id, Status::Error);
    if undo {
        return;
    }
    if let Some(change_id) = change_id {
        if let Err(e) = st.abort_change(change_id) {
            warn!("Cannot abort change {}: {}", change_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_limits() {
        assert!(RetryPolicy::unbounded().allows(u32::MAX - 1));
        let policy = RetryPolicy::at_most(2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn test_retry_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").expect("parse");
        assert_eq!(policy, RetryPolicy::unbounded());
        let policy: RetryPolicy = serde_json::from_str(r#"{"max-retries": 3}"#).expect("parse");
        assert_eq!(policy, RetryPolicy::at_most(3));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_retry_at_saturates() {
        let now = Utc::now();
        assert_eq!(retry_at(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
        assert_eq!(retry_at(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_handler_error_from_anyhow() {
        let err: HandlerError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, HandlerError::Failed(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_known_task_kinds_sorted() {
        let runner = TaskRunner::new(State::default());
        runner.add_handler("link", Handler::new(|_| Ok(())), None);
        runner.add_handler("download", Handler::new(|_| Ok(())), None);
        assert_eq!(runner.known_task_kinds(), vec!["download", "link"]);
        assert_eq!(runner.running_count(), 0);
    }
}

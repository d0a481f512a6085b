//! Overlord Driver
//!
//! Owns the state, the task runner, the conflict detector and the
//! registered managers, and drives them from a single ensure loop.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► add_manager()* ──► start_up() ──► run() ──► wait() ──► stop()
//!                                  │
//!                                  └── settle() / ensure_once() in tests
//! ```
//!
//! # Ensure Loop
//! - Wakes on `ensure_interval`, on any `ensure_before`/`ensure_now`
//!   request, and on cancellation
//! - Each pass runs every manager's `ensure`, then the runner's
//! - Manager errors are logged and retried on the next pass; fatal runner
//!   errors and checkpoint failures stop the loop
//! - Pruning runs every `prune_interval`

use anyhow::Context;
use chrono::DateTime;
use crossbeam::channel;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::OverlordConfig;
use crate::conflict::ConflictDetector;
use crate::error::{OverlordError, Result};
use crate::persist::{self, Checkpointer, FileBackend};
use crate::runner::TaskRunner;
use crate::shutdown::CancelToken;
use crate::state::{ChangeId, State, Status, TaskId};

/// Interval at which `settle` re-checks for convergence.
const SETTLE_POLL: Duration = Duration::from_millis(10);

/// A subsystem that reconciles its slice of the state on every ensure pass.
pub trait StateManager: Send {
    /// Called once by `Overlord::start_up`, in registration order.
    fn start_up(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Moves the manager's slice of the world towards the desired state.
    fn ensure(&mut self) -> anyhow::Result<()>;

    /// Called once by `Overlord::stop`, in reverse registration order.
    fn stop(&mut self) {}
}

struct OverlordInner {
    config: OverlordConfig,
    state: State,
    runner: TaskRunner,
    conflicts: ConflictDetector,
    managers: Mutex<Vec<Box<dyn StateManager>>>,
    cancel: CancelToken,
}

/// The engine: state, runner, conflicts and managers behind one ensure loop.
pub struct Overlord {
    inner: Arc<OverlordInner>,
    ensure_loop: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for Overlord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlord")
            .field("state", &self.inner.state)
            .field("runner", &self.inner.runner)
            .field("managers", &self.managers().len())
            .finish()
    }
}

impl Overlord {
    /// Loads the state file named by `config` (or starts empty) and builds
    /// the engine around it.
    pub fn new(config: OverlordConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(FileBackend::new(&config.state_path));
        let state = persist::load_state(&config.state_path, Arc::new(SystemClock), Some(backend))?;
        Self::with_state(config, state)
    }

    /// Builds an engine with an empty state checkpointed to `backend`.
    pub fn with_backend(
        config: OverlordConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn Checkpointer>,
    ) -> Result<Self> {
        config.validate()?;
        Self::with_state(config, State::new(clock, Some(backend)))
    }

    /// Builds an engine around an existing state.
    pub fn with_state(config: OverlordConfig, state: State) -> Result<Self> {
        config.validate()?;
        let runner =
            TaskRunner::with_limits(state.clone(), config.max_concurrent_tasks, config.retry);
        Ok(Self {
            inner: Arc::new(OverlordInner {
                config,
                state,
                runner,
                conflicts: ConflictDetector::new(),
                managers: Mutex::new(Vec::new()),
                cancel: CancelToken::new(),
            }),
            ensure_loop: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &State {
        &self.inner.state
    }

    pub fn task_runner(&self) -> &TaskRunner {
        &self.inner.runner
    }

    pub fn conflicts(&self) -> &ConflictDetector {
        &self.inner.conflicts
    }

    pub fn config(&self) -> &OverlordConfig {
        &self.inner.config
    }

    /// Token cancelled by `stop` (or by a signal handler).
    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    fn managers(&self) -> MutexGuard<'_, Vec<Box<dyn StateManager>>> {
        self.inner.managers()
    }

    /// Registers a manager. Managers run in registration order.
    pub fn add_manager(&self, manager: Box<dyn StateManager>) {
        self.managers().push(manager);
    }

    /// Runs manager start-up hooks, then checks that every unfinished task
    /// has a handler.
    pub fn start_up(&self) -> Result<()> {
        for (i, manager) in self.managers().iter_mut().enumerate() {
            manager
                .start_up()
                .with_context(|| format!("manager #{i} failed to start"))
                .map_err(|e| OverlordError::general(format!("{e:#}")))?;
        }
        self.inner.runner.check_handlers()?;
        let st = self.inner.state.lock();
        info!(
            "Overlord started with {} change(s), {} task kind(s)",
            st.changes().count(),
            self.inner.runner.known_task_kinds().len()
        );
        Ok(())
    }

    /// Runs a single ensure pass.
    pub fn ensure_once(&self) -> Result<()> {
        self.inner.ensure_once()
    }

    /// Starts the ensure loop on its own thread.
    pub fn run(&self) -> Result<()> {
        let mut slot = self
            .ensure_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(OverlordError::general("ensure loop already running"));
        }
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("overlord-ensure".into())
            .spawn(move || inner.ensure_loop())?;
        *slot = Some(handle);
        info!(
            "Ensure loop started (interval {:?})",
            self.inner.config.ensure_interval()
        );
        Ok(())
    }

    /// Blocks until the ensure loop exits, returning its result.
    pub fn wait(&self) -> Result<()> {
        let handle = self
            .ensure_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(OverlordError::general("ensure loop panicked"))),
            None => Ok(()),
        }
    }

    /// Runs ensure passes until every change is ready and no handler runs.
    pub fn settle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let wakeups = self.inner.state.ensure_receiver();
        loop {
            self.ensure_once()?;
            if self.inner.runner.running_count() == 0 && self.all_changes_ready() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = wakeups.recv_timeout(SETTLE_POLL.min(deadline - now));
        }

        let st = self.inner.state.lock();
        let pending: Vec<String> = st
            .changes()
            .filter(|c| !st.is_change_ready(c.id()))
            .map(|c| format!("{} ({})", c.id(), c.kind()))
            .collect();
        Err(OverlordError::Settle(format!(
            "not converging after {:?}: {} running, pending changes [{}]",
            timeout,
            self.inner.runner.running_count(),
            pending.join(", ")
        )))
    }

    fn all_changes_ready(&self) -> bool {
        let st = self.inner.state.lock();
        st.changes().all(|c| st.is_change_ready(c.id()))
    }

    /// Removes old ready changes, aborts stale unready ones and drops old
    /// orphan tasks.
    pub fn prune(&self) -> Result<()> {
        self.inner.prune()
    }

    /// Shuts the engine down: loop, managers, running handlers, final
    /// checkpoint.
    pub fn stop(&self) -> Result<()> {
        info!("Stopping overlord...");
        self.inner.cancel.cancel();
        self.inner.state.ensure_now();
        if let Err(e) = self.wait() {
            error!("Ensure loop ended with error: {}", e);
        }

        for manager in self.managers().iter_mut().rev() {
            manager.stop();
        }

        if let Err(e) = self.inner.runner.stop(self.inner.config.shutdown_timeout()) {
            warn!("{}", e);
        }

        self.inner.state.checkpoint()?;
        info!("Overlord stopped");
        Ok(())
    }
}

impl OverlordInner {
    fn managers(&self) -> MutexGuard<'_, Vec<Box<dyn StateManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_checkpoint_failure(&self) -> Result<()> {
        match self.state.take_checkpoint_error() {
            Some(msg) => Err(OverlordError::persistence(msg)),
            None => Ok(()),
        }
    }

    fn ensure_once(&self) -> Result<()> {
        self.take_checkpoint_failure()?;
        self.state.clear_due_ensure(self.state.now());

        for (i, manager) in self.managers().iter_mut().enumerate() {
            if let Err(e) = manager.ensure() {
                warn!("Manager #{} ensure failed: {:#}", i, e);
            }
        }
        self.runner.ensure()?;
        self.take_checkpoint_failure()
    }

    fn ensure_loop(&self) -> Result<()> {
        let wakeups = self.state.ensure_receiver();
        let interval = self.config.ensure_interval();
        let mut last_prune = Instant::now();

        while !self.cancel.is_cancelled() {
            match self.ensure_once() {
                Err(e) if e.is_fatal() => {
                    error!("Fatal error in ensure loop: {}", e);
                    self.cancel.cancel();
                    return Err(e);
                }
                Err(e) => warn!("Ensure pass failed: {}", e),
                Ok(()) => {}
            }

            if last_prune.elapsed() >= self.config.prune_interval() {
                if let Err(e) = self.prune() {
                    warn!("Prune failed: {}", e);
                }
                last_prune = Instant::now();
            }

            // A stop may have raced with the pass above.
            if self.cancel.is_cancelled() {
                break;
            }
            let wait = self.next_wait(interval);
            debug!("Ensure loop sleeping for {:?}", wait);
            crossbeam::select! {
                recv(wakeups) -> _ => {}
                recv(channel::after(wait)) -> _ => {}
            }
        }
        debug!("Ensure loop exiting");
        Ok(())
    }

    /// Time until the next requested pass, capped at the regular interval.
    fn next_wait(&self, interval: Duration) -> Duration {
        match self.state.ensure_deadline() {
            Some(at) => (at - self.state.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(interval),
            None => interval,
        }
    }

    fn prune(&self) -> Result<()> {
        let mut st = self.state.lock();
        let now = st.now();
        let prune_limit = now
            .checked_sub_signed(self.config.prune_wait())
            .unwrap_or(DateTime::<chrono::Utc>::MIN_UTC);
        let abort_limit = now
            .checked_sub_signed(self.config.abort_wait())
            .unwrap_or(DateTime::<chrono::Utc>::MIN_UTC);

        let mut expired: Vec<ChangeId> = Vec::new();
        let mut stale: Vec<ChangeId> = Vec::new();
        let mut ready = Vec::new();
        for change in st.changes() {
            let status = st.change_status(change.id()).unwrap_or_default();
            if status.is_ready() {
                let ready_time = change.ready_time().unwrap_or(change.spawn_time());
                if ready_time <= prune_limit {
                    expired.push(change.id());
                } else {
                    ready.push((ready_time, change.id()));
                }
            } else if change.spawn_time() <= abort_limit && status != Status::Undoing {
                stale.push(change.id());
            }
        }

        if ready.len() > self.config.max_ready_changes {
            ready.sort();
            let excess = ready.len() - self.config.max_ready_changes;
            expired.extend(ready.iter().take(excess).map(|(_, id)| *id));
        }

        for id in &stale {
            warn!("Aborting change {} after waiting too long", id);
            st.abort_change(*id)?;
        }
        for id in &expired {
            debug!("Pruning change {}", id);
            st.remove_change(*id)?;
        }

        let orphans: Vec<TaskId> = st
            .tasks()
            .filter(|t| t.change().is_none() && t.spawn_time() <= prune_limit)
            .map(|t| t.id())
            .collect();
        for id in &orphans {
            st.remove_task(*id)?;
        }

        if !(expired.is_empty() && stale.is_empty() && orphans.is_empty()) {
            info!(
                "Pruned {} change(s) and {} orphan task(s), aborted {} stale change(s)",
                expired.len(),
                orphans.len(),
                stale.len()
            );
        }
        st.unlock()
    }
}

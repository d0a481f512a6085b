//! Tasks and their execution status.
//!
//! # Status Flow
//!
//! ```text
//! Do ──► Doing ──► Done
//!  │       │  └──► Error
//!  │       ├─────► Wait ──► Doing (retry)
//!  │       └─────► Abort (change aborted while running)
//!  └──► Hold (skipped)
//!
//! on abort:  Done ──► Undo ──► Undoing ──► Undone
//!                                  └─────► Error (undo failed)
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumIter, EnumString};

use super::{get_value, set_value, ChangeId, TaskId};
use crate::error::Result;

/// Maximum number of log entries kept per task; older ones are dropped.
pub const MAX_TASK_LOG: usize = 10;

/// Execution status of a task.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum Status {
    /// Waiting for its dependencies, then runs
    #[default]
    Do,
    /// Handler dispatched
    Doing,
    /// Completed successfully
    Done,
    /// Running while its change is being aborted
    Abort,
    /// Scheduled for compensation
    Undo,
    /// Undo handler dispatched
    Undoing,
    /// Compensated
    Undone,
    /// Skipped without running
    Hold,
    /// Failed, forward or during undo
    Error,
    /// Waiting for a requested retry time
    Wait,
}

impl Status {
    /// Order in which member statuses decide a change's aggregate status.
    const AGGREGATE_ORDER: [Status; 10] = [
        Status::Abort,
        Status::Undoing,
        Status::Undo,
        Status::Doing,
        Status::Do,
        Status::Wait,
        Status::Error,
        Status::Undone,
        Status::Hold,
        Status::Done,
    ];

    /// Returns true for terminal statuses.
    #[inline]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Done | Self::Undone | Self::Hold | Self::Error)
    }

    /// Returns true while a handler may be executing.
    #[inline]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Doing | Self::Undoing | Self::Abort)
    }

    /// Derives a change's status from the statuses of its tasks.
    ///
    /// `Done` only if every task is done; `Error` only once nothing can make
    /// progress any more. An empty change is `Hold`.
    pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        let mut seen = [false; 10];
        for status in statuses {
            if let Some(pos) = Self::AGGREGATE_ORDER.iter().position(|s| *s == status) {
                seen[pos] = true;
            }
        }
        Self::AGGREGATE_ORDER
            .iter()
            .zip(seen)
            .find(|(_, present)| *present)
            .map(|(status, _)| *status)
            .unwrap_or(Status::Hold)
    }
}

/// Severity of a task log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Error,
}

/// One line of a task's progress/error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.level,
            self.message
        )
    }
}

/// Handler-reported progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub label: String,
    pub done: u64,
    pub total: u64,
}

/// A unit of work with a kind-specific handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) kind: String,
    pub(crate) summary: String,
    pub(crate) status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) change: Option<ChangeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) wait_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) halt_tasks: Vec<TaskId>,
    #[serde(default)]
    pub(crate) retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) progress: Option<Progress>,
    pub(crate) spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) undo_failed: bool,
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            change: None,
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            retry_count: 0,
            at: None,
            log: Vec::new(),
            data: BTreeMap::new(),
            progress: None,
            spawn_time: now,
            ready_time: None,
            undo_failed: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn change(&self) -> Option<ChangeId> {
        self.change
    }

    /// Tasks that must be `Done` before this one runs.
    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    /// Tasks waiting on this one; they are undone before it.
    pub fn halt_tasks(&self) -> &[TaskId] {
        &self.halt_tasks
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Earliest time the task may run (or be retried).
    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn set_progress(&mut self, label: &str, done: u64, total: u64) {
        self.progress = Some(Progress {
            label: label.to_string(),
            done,
            total,
        });
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// True if this task is in `Error` because its undo handler failed.
    pub fn undo_failed(&self) -> bool {
        self.undo_failed
    }

    /// Appends an info line to the log.
    pub fn logf(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.push_log(at, LogLevel::Info, message.into());
    }

    /// Appends an error line to the log.
    pub fn errorf(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.push_log(at, LogLevel::Error, message.into());
    }

    fn push_log(&mut self, time: DateTime<Utc>, level: LogLevel, message: String) {
        self.log.push(LogEntry {
            time,
            level,
            message,
        });
        if self.log.len() > MAX_TASK_LOG {
            let excess = self.log.len() - MAX_TASK_LOG;
            self.log.drain(..excess);
        }
    }

    /// The error lines of the log joined together, or the status if there are none.
    pub fn error_summary(&self) -> String {
        let errors: Vec<&str> = self
            .log
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .map(|e| e.message.as_str())
            .collect();
        if errors.is_empty() {
            self.status.to_string()
        } else {
            errors.join("; ")
        }
    }

    /// Stores a serializable parameter or result under `key`.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        set_value(&mut self.data, key, value)
    }

    /// Reads the value stored under `key`; `Ok(None)` if absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        get_value(&self.data, key)
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }
}

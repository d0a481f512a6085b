//! Overlord Library
//!
//! A persisted, crash-resilient task-orchestration engine. Changes made of
//! dependent tasks are executed by kind-specific handlers, undone in reverse
//! dependency order on failure, and checkpointed after every mutation so a
//! restarted daemon picks up where it left off.

pub mod cli;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod overlord;
pub mod persist;
pub mod runner;
pub mod shutdown;
pub mod state;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OverlordConfig;
pub use conflict::ConflictDetector;
pub use error::{ChangeConflictError, OverlordError, Result};
pub use overlord::{Overlord, StateManager};
pub use persist::{Checkpointer, FileBackend, MemoryBackend};
pub use runner::{Handler, HandlerError, HandlerResult, RetryPolicy, TaskContext, TaskRunner};
pub use shutdown::CancelToken;
pub use state::{
    Change, ChangeId, LogEntry, LogLevel, Progress, State, StateGuard, Status, Task, TaskId,
    TaskSet,
};

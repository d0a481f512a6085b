//! Error handling module for the overlord engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Task handlers report their own outcomes through `runner::HandlerError`; every
//! other failure in the engine is an `OverlordError`.

use thiserror::Error;

use crate::state::{ChangeId, TaskId};

/// Raised when a proposed change touches a resource already claimed by an
/// in-flight change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("change {change_id} ({change_kind}) already in progress for {resource}")]
pub struct ChangeConflictError {
    /// Contended resource name, e.g. `pkg:foo`
    pub resource: String,
    /// The in-flight change holding the resource
    pub change_id: ChangeId,
    /// Kind of the in-flight change
    pub change_kind: String,
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum OverlordError {
    /// IO errors (state file, temp files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed or unwritable state file
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Admission rejected because of overlapping footprints
    #[error("Conflict: {0}")]
    Conflict(#[from] ChangeConflictError),

    /// A task kind was dispatched without a registered handler
    #[error("no handler registered for task kind {kind:?}")]
    MissingHandler { kind: String },

    /// A dependency edge would close a cycle
    #[error("task {task} cannot wait for {dependency}: dependency cycle")]
    Cycle { task: TaskId, dependency: TaskId },

    /// Referenced change or task does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors (loading, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Settle did not converge within its timeout
    #[error("Settle error: {0}")]
    Settle(String),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, OverlordError>;

impl OverlordError {
    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// Returns true for errors that indicate a wiring defect or state that can
    /// no longer be persisted. The ensure loop stops on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingHandler { .. } | Self::Persistence(_) | Self::Config(_) | Self::Io(_)
        )
    }
}

//! Error types for taskvent.

use thiserror::Error;

/// Main error type for taskvent.
#[derive(Error, Debug)]
pub enum TaskventError {
    /// An operation was invoked in a lifecycle state that does not allow it,
    /// e.g. `run()` before `initialize_sockets()`.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Could not bind to a free port in {min}..={max} after {attempts} attempts")]
    Bind { min: u16, max: u16, attempts: usize },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid high-water mark {0}: must be a positive integer")]
    InvalidHwm(i32),

    #[error("Messaging error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(String),

    /// A relayed log record crossed the configured failure threshold.
    #[error("Subprocess failure reported by {origin} at {level}: {message}")]
    SubprocessFailure {
        origin: String,
        level: crate::relay::Severity,
        message: String,
    },

    /// Failure raised by user-supplied role code.
    #[error("{0}")]
    Task(String),
}

impl TaskventError {
    /// Shorthand for a [`TaskventError::Task`] error.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }
}

/// Result type alias for taskvent operations.
pub type Result<T> = std::result::Result<T, TaskventError>;

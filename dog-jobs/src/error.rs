use thiserror::Error;

use crate::types::{JobId, JobState};

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the queue, its jobs and its workers
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Job(id:{0}) is not found.")]
    NotFound(JobId),

    #[error("update unexpected number of rows. (expected: {expected}, actual: {actual})")]
    UpdateConflict { expected: u64, actual: u64 },

    #[error("shutdown timeout")]
    ShutdownTimeout,

    #[error("unexpectedly termination")]
    UnexpectedTermination,

    #[error("{0}")]
    Processor(#[from] JobError),

    #[error("worker shut down before processing")]
    WorkerShutdown,

    #[error("Invalid progress: {done}/{total}")]
    InvalidProgress { done: u64, total: u64 },

    #[error("Invalid state transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Job {0} was abandoned by its worker")]
    JobAbandoned(JobId),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure reported by user processing code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Processing failed with a message
    #[error("{0}")]
    Failed(String),

    /// Processing aborted without producing an error value (a panic)
    #[error("Processor is failed, and non error object is thrown.")]
    NonError,
}

impl JobError {
    /// Create a processing failure
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<String> for JobError {
    fn from(msg: String) -> Self {
        Self::Failed(msg)
    }
}

impl From<&str> for JobError {
    fn from(msg: &str) -> Self {
        Self::Failed(msg.to_string())
    }
}

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Duplicate job id: {0}")]
    DuplicateId(JobId),

    #[error("Corrupt datafile at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Store is not initialized")]
    NotInitialized,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

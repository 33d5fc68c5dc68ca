//! Error types for the worker.
//!

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::store::StoreError;

/// Why a batch invocation gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFailureKind {
    /// The store reported an error that must not be retried
    Fatal,
    /// Transient conflicts persisted past the retry budget
    RetryBudgetExhausted,
}

impl std::fmt::Display for BatchFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchFailureKind::Fatal => write!(f, "fatal"),
            BatchFailureKind::RetryBudgetExhausted => write!(f, "retry budget exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    #[error("Batch failed after {attempts} attempt(s) ({kind}): {source}")]
    BatchFailed {
        kind: BatchFailureKind,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Listener error: {0}")]
    Listener(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

impl WorkerError {
    /// Kind of batch failure, if this error ended a batch invocation
    pub fn batch_failure_kind(&self) -> Option<BatchFailureKind> {
        match self {
            WorkerError::BatchFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for WorkerError {
    fn from(err: sqlx::Error) -> Self {
        WorkerError::Store(StoreError::from(err))
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

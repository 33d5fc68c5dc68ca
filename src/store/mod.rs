//! # Work Store
//!
//! The transactional contract the claim engine drives, and its backends.
//!
//! ## Contract
//!
//! A [`WorkStore`] hands out one [`StoreTransaction`] per processing attempt.
//! Inside it the engine:
//!
//! 1. claims up to `limit` unfinished items with skip-locked semantics, so
//!    concurrent transactions never select the same row and never wait on
//!    each other,
//! 2. runs every [`PipelineStage`] against exactly the claimed set,
//! 3. commits, or rolls back on any error.
//!
//! Transactions are never shared between attempts. Errors keep enough detail
//! (the SQLSTATE code for PostgreSQL) for the conflict classifier to tell a
//! transient conflict from a fatal failure.
//!
//! ## Backends
//!
//! - [`postgres::PgWorkStore`] - production backend using `FOR UPDATE SKIP LOCKED`
//! - [`memory::InMemoryStore`] - in-process backend with the same locking
//!   semantics and fault injection, used by tests and dry runs

pub mod memory;
pub mod postgres;
pub mod queries;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Batch, PipelineStage};

pub use memory::{FaultPoint, InMemoryStore};
pub use postgres::PgWorkStore;

/// Failures reported by a store backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The database rejected a statement and reported a SQLSTATE code
    #[error("Database error [{code}]: {message}")]
    Database { code: String, message: String },
    /// Statement failure without a SQLSTATE code
    #[error("Query error: {0}")]
    Query(String),
    /// Connectivity loss, pool exhaustion or TLS failure
    #[error("Connection error: {0}")]
    Connection(String),
    /// Domain sentinel: nothing is currently available to claim
    #[error("No work available: {0}")]
    NoWorkAvailable(String),
    /// A row could not be mapped onto a work item
    #[error("Decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// SQLSTATE code when the backend reported one
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            StoreError::Database { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn serialization_failure(message: impl Into<String>) -> Self {
        StoreError::Database {
            code: crate::constants::sqlstate::SERIALIZATION_FAILURE.to_string(),
            message: message.into(),
        }
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        StoreError::Database {
            code: crate::constants::sqlstate::DEADLOCK_DETECTED.to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => StoreError::Database {
                    code: code.into_owned(),
                    message: db_err.message().to_string(),
                },
                None => StoreError::Query(db_err.message().to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::Decode(err.to_string()),
            _ => StoreError::Query(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A backing store able to open processing transactions
#[async_trait]
pub trait WorkStore: Send + Sync + 'static {
    type Transaction: StoreTransaction;

    /// Open a fresh transaction for one processing attempt
    async fn begin(&self) -> StoreResult<Self::Transaction>;

    /// Number of unfinished items, used for progress logging only
    async fn backlog_size(&self) -> StoreResult<u64>;

    /// Backend name for log fields
    fn backend_name(&self) -> &'static str;
}

/// One processing attempt's transaction
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Claim up to `limit` unfinished items, oldest first, skipping rows locked
    /// by other transactions. Items whose claim is older than `lease` count as
    /// unclaimed.
    async fn claim_batch(&mut self, limit: usize, lease: Duration) -> StoreResult<Batch>;

    /// Run one pipeline stage over the claimed batch, returning rows affected
    async fn run_stage(&mut self, stage: PipelineStage, batch: &Batch) -> StoreResult<u64>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_only_for_database_errors() {
        assert_eq!(
            StoreError::serialization_failure("could not serialize").sqlstate(),
            Some("40001")
        );
        assert_eq!(StoreError::deadlock("deadlock").sqlstate(), Some("40P01"));
        assert_eq!(StoreError::Connection("reset".into()).sqlstate(), None);
    }

    #[test]
    fn test_pool_errors_map_to_connection() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StoreError::Connection(_)));

        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Query(_)));
    }

    #[test]
    fn test_display_includes_code() {
        let err = StoreError::deadlock("deadlock detected");
        assert_eq!(err.to_string(), "Database error [40P01]: deadlock detected");
    }
}

#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Trail Progress Worker
//!
//! Background worker that drains the backlog of activity/route pairs waiting
//! to be evaluated for route coverage, safely alongside any number of other
//! worker processes.
//!
//! ## Overview
//!
//! Upstream ingestion inserts one work item per activity/route pair and sends
//! a `NOTIFY`. Each worker process runs one or more schedulers; a scheduler
//! wakes on that notification or on its fallback timer and drains the backlog
//! batch by batch. Every batch is claimed with `FOR UPDATE SKIP LOCKED`,
//! processed by a fixed pipeline of SQL stages and completed inside a single
//! transaction, so concurrent workers never process the same item and a
//! failed attempt leaves nothing half-applied.
//!
//! ## Module Organization
//!
//! - [`processing`] - Scheduler, batch claim engine, conflict classifier, wake trigger
//! - [`store`] - Transactional store contract with PostgreSQL and in-memory backends
//! - [`models`] - Work items, batches and pipeline stages
//! - [`listener`] - PostgreSQL LISTEN/NOTIFY wake source
//! - [`worker`] - Pool of independent scheduler/engine pairs
//! - [`bootstrap`] - Process wiring from configuration to a running system
//! - [`config`] - Layered configuration loading and validation
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trail_progress_worker::processing::{BatchClaimConfig, BatchClaimEngine, BatchOutcome};
//! use trail_progress_worker::store::PgWorkStore;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BatchClaimEngine::new(Arc::new(PgWorkStore::new(pool)), BatchClaimConfig::default());
//!
//! while let BatchOutcome::Processed(count) = engine.process_batch(10).await? {
//!     println!("processed {count} items");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod error;
pub mod listener;
pub mod logging;
pub mod models;
pub mod processing;
pub mod store;
pub mod worker;

pub use bootstrap::{bootstrap, WorkerSystem};
pub use config::{ConfigManager, WorkerConfig};
pub use error::{BatchFailureKind, WorkerError, WorkerResult};
pub use models::{Batch, PipelineStage, WorkItem};
pub use processing::{
    BatchClaimEngine, BatchOutcome, BatchProcessor, ConflictClass, Scheduler, SchedulerExit,
};
pub use store::{InMemoryStore, PgWorkStore, StoreError, StoreTransaction, WorkStore};
pub use worker::WorkerPool;

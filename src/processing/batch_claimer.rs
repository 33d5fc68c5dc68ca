//! # Batch Claim Engine
//!
//! Claims a bounded batch of unfinished work items and runs the processing
//! pipeline over it inside one transaction per attempt.
//!
//! ## Attempt
//!
//! 1. Open a transaction.
//! 2. Claim up to `max_batch_size` items, oldest first, skipping rows locked
//!    by concurrent transactions. An empty claim commits and reports
//!    [`BatchOutcome::NothingLeft`].
//! 3. Run every [`PipelineStage`] in order against exactly the claimed ids.
//! 4. Commit.
//!
//! Any error rolls the attempt back and is classified. Transient conflicts
//! retry the whole attempt with a fresh claim until `max_attempts` is spent;
//! the exhausted sentinel becomes `NothingLeft`; everything else is returned
//! as [`WorkerError::BatchFailed`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::error_classifier::{ConflictClass, ErrorClassifier, StandardErrorClassifier};
use crate::config::ProcessingConfig;
use crate::constants::defaults;
use crate::error::{BatchFailureKind, WorkerError, WorkerResult};
use crate::logging::log_batch_operation;
use crate::models::PipelineStage;
use crate::store::{StoreResult, StoreTransaction, WorkStore};

/// Result of one `process_batch` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A non-empty batch was claimed, processed and committed
    Processed(usize),
    /// No claimable work remains
    NothingLeft,
}

/// Anything the scheduler can drain
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    /// Process at most `max_batch_size` items in one committed unit
    async fn process_batch(&self, max_batch_size: usize) -> WorkerResult<BatchOutcome>;

    /// Unfinished items, if cheaply known; only used for progress logging
    async fn backlog_size(&self) -> Option<u64> {
        None
    }
}

/// Engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchClaimConfig {
    /// Attempts per `process_batch` call, the first one included
    pub max_attempts: u32,
    /// Claims older than this are treated as abandoned
    pub claim_lease: Duration,
}

impl Default for BatchClaimConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            claim_lease: defaults::CLAIM_LEASE,
        }
    }
}

impl From<&ProcessingConfig> for BatchClaimConfig {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            claim_lease: config.claim_lease,
        }
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    attempts: AtomicU64,
    batches_committed: AtomicU64,
    items_processed: AtomicU64,
    empty_claims: AtomicU64,
    conflicts_retried: AtomicU64,
    retry_budget_exhausted: AtomicU64,
    fatal_failures: AtomicU64,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub attempts: u64,
    pub batches_committed: u64,
    pub items_processed: u64,
    pub empty_claims: u64,
    pub conflicts_retried: u64,
    pub retry_budget_exhausted: u64,
    pub fatal_failures: u64,
}

/// What a single committed attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
struct AttemptReport {
    claimed: usize,
    stage_rows: Vec<(PipelineStage, u64)>,
}

/// Claim-and-process engine over a [`WorkStore`]
pub struct BatchClaimEngine<S: WorkStore> {
    store: Arc<S>,
    config: BatchClaimConfig,
    classifier: Arc<dyn ErrorClassifier>,
    stats: Arc<EngineStats>,
}

impl<S: WorkStore> std::fmt::Debug for BatchClaimEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchClaimEngine")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

impl<S: WorkStore> BatchClaimEngine<S> {
    pub fn new(store: Arc<S>, config: BatchClaimConfig) -> Self {
        Self {
            store,
            config,
            classifier: Arc::new(StandardErrorClassifier::new()),
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Replace the conflict classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> BatchClaimConfig {
        self.config
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            batches_committed: self.stats.batches_committed.load(Ordering::Relaxed),
            items_processed: self.stats.items_processed.load(Ordering::Relaxed),
            empty_claims: self.stats.empty_claims.load(Ordering::Relaxed),
            conflicts_retried: self.stats.conflicts_retried.load(Ordering::Relaxed),
            retry_budget_exhausted: self.stats.retry_budget_exhausted.load(Ordering::Relaxed),
            fatal_failures: self.stats.fatal_failures.load(Ordering::Relaxed),
        }
    }

    /// Claim, process and commit at most one batch, retrying transient
    /// conflicts within the attempt budget
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn process_batch(&self, max_batch_size: usize) -> WorkerResult<BatchOutcome> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();

            let failure = match self.attempt(max_batch_size).await {
                Ok(None) => {
                    self.stats.empty_claims.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, "No claimable work items");
                    return Ok(BatchOutcome::NothingLeft);
                }
                Ok(Some(report)) => {
                    self.record_committed(&report, attempt, started.elapsed());
                    return Ok(BatchOutcome::Processed(report.claimed));
                }
                Err(failure) => failure,
            };

            let class = self.classifier.classify(&failure);
            match class {
                ConflictClass::Exhausted => {
                    debug!(attempt, reason = %failure, "Store reported no work available");
                    return Ok(BatchOutcome::NothingLeft);
                }
                _ if class.is_retryable() && attempt < max_attempts => {
                    self.stats.conflicts_retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt,
                        max_attempts,
                        sqlstate = failure.sqlstate().unwrap_or(""),
                        error = %failure,
                        "Transient conflict, retrying batch with a fresh claim"
                    );
                }
                ConflictClass::TransientConflict => {
                    self.stats
                        .retry_budget_exhausted
                        .fetch_add(1, Ordering::Relaxed);
                    error!(
                        attempts = attempt,
                        error = %failure,
                        "Transient conflicts persisted past the retry budget"
                    );
                    log_batch_operation(
                        "process_batch",
                        0,
                        attempt,
                        "retry_budget_exhausted",
                        Some(&failure.to_string()),
                    );
                    return Err(WorkerError::BatchFailed {
                        kind: BatchFailureKind::RetryBudgetExhausted,
                        attempts: attempt,
                        source: failure,
                    });
                }
                ConflictClass::Fatal => {
                    self.stats.fatal_failures.fetch_add(1, Ordering::Relaxed);
                    error!(attempts = attempt, error = %failure, "Batch failed with a fatal store error");
                    log_batch_operation(
                        "process_batch",
                        0,
                        attempt,
                        "fatal",
                        Some(&failure.to_string()),
                    );
                    return Err(WorkerError::BatchFailed {
                        kind: BatchFailureKind::Fatal,
                        attempts: attempt,
                        source: failure,
                    });
                }
            }
        }
    }

    /// One transaction: `None` for an empty claim
    async fn attempt(&self, max_batch_size: usize) -> StoreResult<Option<AttemptReport>> {
        let mut tx = self.store.begin().await?;

        match self.run_pipeline(&mut tx, max_batch_size).await {
            Ok(report) => {
                tx.commit().await?;
                Ok(report)
            }
            Err(failure) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "Rollback after failed attempt also failed");
                }
                Err(failure)
            }
        }
    }

    async fn run_pipeline(
        &self,
        tx: &mut S::Transaction,
        max_batch_size: usize,
    ) -> StoreResult<Option<AttemptReport>> {
        let batch = tx.claim_batch(max_batch_size, self.config.claim_lease).await?;
        if batch.is_empty() {
            return Ok(None);
        }

        let mut stage_rows = Vec::with_capacity(PipelineStage::ORDERED.len());
        for stage in PipelineStage::ORDERED {
            let rows = tx.run_stage(stage, &batch).await?;
            stage_rows.push((stage, rows));
        }

        Ok(Some(AttemptReport {
            claimed: batch.len(),
            stage_rows,
        }))
    }

    fn record_committed(&self, report: &AttemptReport, attempt: u32, elapsed: Duration) {
        self.stats.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .items_processed
            .fetch_add(report.claimed as u64, Ordering::Relaxed);

        let rows_of = |wanted: PipelineStage| {
            report
                .stage_rows
                .iter()
                .find(|(stage, _)| *stage == wanted)
                .map_or(0, |(_, rows)| *rows)
        };

        info!(
            claimed = report.claimed,
            attempt,
            skipped_unmapped = rows_of(PipelineStage::SkipUnmapped),
            relevance_recorded = rows_of(PipelineStage::RecordRelevance),
            skipped_irrelevant = rows_of(PipelineStage::SkipIrrelevant),
            intersections = rows_of(PipelineStage::PopulateIntersections),
            route_sections = rows_of(PipelineStage::PopulateRouteSections),
            routes_locked = rows_of(PipelineStage::LockTouchedRoutes),
            routes_refreshed = rows_of(PipelineStage::RefreshRouteStats),
            completed = rows_of(PipelineStage::MarkComplete),
            duration_ms = elapsed.as_millis() as u64,
            "Batch committed"
        );
    }
}

#[async_trait]
impl<S: WorkStore> BatchProcessor for BatchClaimEngine<S> {
    async fn process_batch(&self, max_batch_size: usize) -> WorkerResult<BatchOutcome> {
        BatchClaimEngine::process_batch(self, max_batch_size).await
    }

    async fn backlog_size(&self) -> Option<u64> {
        match self.store.backlog_size().await {
            Ok(size) => Some(size),
            Err(e) => {
                debug!(error = %e, "Could not read backlog size");
                None
            }
        }
    }
}

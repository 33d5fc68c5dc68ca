//! # PostgreSQL Work Store
//!
//! Production backend. Claims use `FOR UPDATE SKIP LOCKED` inside a
//! read-committed transaction; read committed is sufficient because every
//! statement in the pipeline is restricted to the exclusively locked claimed
//! rows instead of reading table-wide snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::queries;
use super::{StoreResult, StoreTransaction, WorkStore};
use crate::models::{Batch, PipelineStage, WorkItem};

/// Work store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    type Transaction = PgWorkTransaction;

    async fn begin(&self) -> StoreResult<PgWorkTransaction> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await?;

        Ok(PgWorkTransaction {
            tx,
            tx_id: Uuid::new_v4(),
        })
    }

    async fn backlog_size(&self) -> StoreResult<u64> {
        let backlog: i64 = sqlx::query_scalar(queries::BACKLOG_SIZE)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(backlog).unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// One processing attempt on a dedicated pooled connection
pub struct PgWorkTransaction {
    tx: Transaction<'static, Postgres>,
    tx_id: Uuid,
}

impl std::fmt::Debug for PgWorkTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgWorkTransaction")
            .field("tx_id", &self.tx_id)
            .finish()
    }
}

#[async_trait]
impl StoreTransaction for PgWorkTransaction {
    #[instrument(skip(self), fields(tx_id = %self.tx_id))]
    async fn claim_batch(&mut self, limit: usize, lease: Duration) -> StoreResult<Batch> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, WorkItemRow>(queries::CLAIM_BATCH)
            .bind(limit)
            .bind(lease.as_secs_f64())
            .fetch_all(&mut *self.tx)
            .await?;

        let batch = Batch::new(rows.into_iter().map(WorkItem::from).collect());
        debug!(claimed = batch.len(), "Claimed processing batch");
        Ok(batch)
    }

    #[instrument(skip(self, batch), fields(tx_id = %self.tx_id, stage = %stage, batch_size = batch.len()))]
    async fn run_stage(&mut self, stage: PipelineStage, batch: &Batch) -> StoreResult<u64> {
        let started = Instant::now();

        let result = sqlx::query(queries::stage_statement(stage))
            .bind(batch.ids())
            .execute(&mut *self.tx)
            .await?;

        debug!(
            rows_affected = result.rows_affected(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline stage executed"
        );
        Ok(result.rows_affected())
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        let tx_id = self.tx_id;
        if let Err(e) = self.tx.rollback().await {
            warn!(tx_id = %tx_id, error = %e, "Failed to roll back processing transaction");
            return Err(e.into());
        }
        Ok(())
    }
}

/// Internal struct for claim query results
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    activity_id: i64,
    route_id: Uuid,
    created_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    processed: bool,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        WorkItem {
            id: row.id,
            subject_ref: row.activity_id,
            target_ref: row.route_id,
            created_at: row.created_at,
            claimed_at: row.processing_started_at,
            done: row.processed,
        }
    }
}

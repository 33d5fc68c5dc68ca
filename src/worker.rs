//! # Worker Pool
//!
//! Runs `worker_concurrency` independent scheduler/engine pairs over one
//! shared store. Each pair has its own coalescing trigger; the store's
//! skip-locked claiming is the only coordination between them.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ProcessingConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::listener::{fan_out, FanOut};
use crate::processing::{
    BatchClaimConfig, BatchClaimEngine, EngineStatsSnapshot, Scheduler, SchedulerConfig,
    SchedulerExit, SchedulerStatsSnapshot, WakeSender,
};
use crate::store::WorkStore;

type EngineScheduler<S> = Scheduler<BatchClaimEngine<S>>;

/// Combined counters for one scheduler/engine pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub scheduler: SchedulerStatsSnapshot,
    pub engine: EngineStatsSnapshot,
}

/// A fixed set of schedulers sharing one store
pub struct WorkerPool<S: WorkStore> {
    store: Arc<S>,
    schedulers: Vec<Arc<EngineScheduler<S>>>,
}

impl<S: WorkStore> std::fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("backend", &self.store.backend_name())
            .field("schedulers", &self.schedulers.len())
            .finish()
    }
}

impl<S: WorkStore> WorkerPool<S> {
    pub fn new(store: Arc<S>, config: &ProcessingConfig) -> Self {
        let scheduler_config = SchedulerConfig::from(config);
        let engine_config = BatchClaimConfig::from(config);

        let schedulers = (0..config.worker_concurrency.max(1))
            .map(|index| {
                let engine = BatchClaimEngine::new(Arc::clone(&store), engine_config);
                Arc::new(Scheduler::new(
                    format!("worker-{index}"),
                    Arc::new(engine),
                    scheduler_config,
                ))
            })
            .collect();

        Self { store, schedulers }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.schedulers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.is_empty()
    }

    pub fn schedulers(&self) -> &[Arc<EngineScheduler<S>>] {
        &self.schedulers
    }

    /// One trigger per scheduler, for external wake sources
    pub fn wakers(&self) -> Vec<WakeSender> {
        self.schedulers.iter().map(|s| s.trigger()).collect()
    }

    /// Wake every scheduler once
    pub fn wake_all(&self) -> FanOut {
        fan_out(&self.wakers())
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.schedulers
            .iter()
            .map(|s| WorkerStats {
                scheduler: s.stats(),
                engine: s.processor().stats(),
            })
            .collect()
    }

    /// Run every scheduler until cancelled; the first failure stops the rest
    /// and is returned
    pub async fn run(&self, cancel: CancellationToken) -> WorkerResult<()> {
        let pool_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for scheduler in &self.schedulers {
            let scheduler = Arc::clone(scheduler);
            let token = pool_cancel.clone();
            tasks.spawn(async move { scheduler.run(token).await });
        }
        info!(
            schedulers = self.schedulers.len(),
            backend = self.store.backend_name(),
            "Worker pool started"
        );

        let mut first_error: Option<WorkerError> = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(SchedulerExit::Cancelled)) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => WorkerError::TaskFailed(join_error.to_string()),
            };
            error!(error = %failure, "Scheduler stopped with an error");
            if first_error.is_none() {
                pool_cancel.cancel();
                first_error = Some(failure);
            }
        }

        info!(stats = ?self.stats(), "Worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }
}

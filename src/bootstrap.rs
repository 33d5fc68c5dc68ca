//! # Worker Bootstrap
//!
//! Wires a validated [`WorkerConfig`] into a running system: the connection
//! pool, the PostgreSQL work store, the worker pool and the notification
//! listener.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::loader::mask_connection_url;
use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::listener::NotificationListener;
use crate::store::{PgWorkStore, WorkStore};
use crate::worker::WorkerPool;

/// Everything a worker process runs
#[derive(Debug)]
pub struct WorkerSystem {
    pool: WorkerPool<PgWorkStore>,
    listener: NotificationListener,
    config: WorkerConfig,
}

/// Connect to the database and assemble the worker
pub async fn bootstrap(config: WorkerConfig) -> WorkerResult<WorkerSystem> {
    config.validate()?;

    info!(
        database = %mask_connection_url(&config.database.url),
        max_connections = config.database.max_connections,
        "Connecting to database"
    );
    let pg_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_seconds))
        .connect(&config.database.url)
        .await?;

    // One connection per scheduler attempt plus the listener
    let needed = config.processing.worker_concurrency + 1;
    if (config.database.max_connections as usize) < needed {
        warn!(
            max_connections = config.database.max_connections,
            needed, "Connection pool is smaller than worker_concurrency + 1"
        );
    }

    Ok(WorkerSystem::from_pool(pg_pool, config))
}

impl WorkerSystem {
    /// Assemble around an existing pool
    pub fn from_pool(pg_pool: PgPool, config: WorkerConfig) -> Self {
        let store = Arc::new(PgWorkStore::new(pg_pool.clone()));
        let pool = WorkerPool::new(store, &config.processing);
        let listener =
            NotificationListener::new(pg_pool, config.database.listen_channel.clone(), pool.wakers());

        Self {
            pool,
            listener,
            config,
        }
    }

    pub fn pool(&self) -> &WorkerPool<PgWorkStore> {
        &self.pool
    }

    pub fn listener(&self) -> &NotificationListener {
        &self.listener
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until cancelled or a scheduler fails fatally
    pub async fn run(self, cancel: CancellationToken) -> WorkerResult<()> {
        info!(
            backend = self.pool.store().backend_name(),
            schedulers = self.pool.len(),
            channel = %self.listener.channel(),
            "Worker system starting"
        );

        let listener_cancel = cancel.child_token();
        let listener = Arc::new(self.listener);
        let listener_task = {
            let listener = Arc::clone(&listener);
            let token = listener_cancel.clone();
            tokio::spawn(async move { listener.run(token).await })
        };

        let result = self.pool.run(cancel).await;

        listener_cancel.cancel();
        if let Err(e) = listener_task.await {
            warn!(error = %e, "Notification listener task failed");
        }

        result
    }
}

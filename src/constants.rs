//! # Worker Constants
//!
//! Operational defaults and store-level codes shared by the claim engine,
//! the scheduler and the configuration layer.

use std::time::Duration;

/// PostgreSQL SQLSTATE codes the conflict classifier treats as retryable
pub mod sqlstate {
    /// `serialization_failure`
    pub const SERIALIZATION_FAILURE: &str = "40001";
    /// `deadlock_detected`
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

/// Default values used when no configuration source overrides them
pub mod defaults {
    use super::Duration;

    /// Fallback poll period between drains when no notification arrives
    pub const PROCESS_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Work items claimed per transaction
    pub const BATCH_SIZE: usize = 10;
    /// Independent scheduler/engine pairs per process
    pub const WORKER_CONCURRENCY: usize = 1;
    /// Attempts per `process_batch` call, first attempt included
    pub const MAX_ATTEMPTS: u32 = 4;
    /// Age after which an unfinished claim may be taken over
    pub const CLAIM_LEASE: Duration = Duration::from_secs(10 * 60);
    /// Channel the upstream ingestion process notifies on
    pub const LISTEN_CHANNEL: &str = "processing_ready";
    pub const MAX_CONNECTIONS: u32 = 10;
    pub const ACQUIRE_TIMEOUT_SECONDS: u64 = 30;
    /// Delay before the notification listener retries after a receive error
    pub const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(5);
}

/// Hard limits enforced by configuration validation
pub mod limits {
    pub const MAX_ATTEMPTS_CEILING: u32 = 10;
    pub const MAX_BATCH_SIZE: usize = 10_000;
    pub const MAX_WORKER_CONCURRENCY: usize = 256;
}

/// Environment variables recognised by the configuration loader
pub mod env {
    /// Deployment environment selector (`development`, `test`, `production`)
    pub const ENVIRONMENT: &str = "TRAIL_ENV";
    pub const ENVIRONMENT_FALLBACK: &str = "APP_ENV";
    /// Prefix for structured overrides, e.g. `TRAIL__PROCESSING__BATCH_SIZE`
    pub const OVERRIDE_PREFIX: &str = "TRAIL";
    pub const CONFIG_DIR: &str = "TRAIL_CONFIG_DIR";

    // Variables understood by earlier deployments of the worker
    pub const LEGACY_DATABASE_URL: &str = "POSTGRES_CONNECTION_URL";
    pub const LEGACY_LISTEN_CHANNEL: &str = "POSTGRES_LISTEN_CHANNEL";
    pub const LEGACY_PROCESS_INTERVAL: &str = "PROCESS_INTERVAL";
    pub const DATABASE_URL: &str = "DATABASE_URL";
}

//! # Structured Logging Module
//!
//! Environment-aware structured logging for the worker. Output goes to stdout,
//! as JSON when `LOG_FORMAT=json` and as ANSI-coloured text when attached to a
//! terminal. `RUST_LOG` takes precedence over the environment default level.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::constants::env as env_vars;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Output format for the console layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initialize tracing once per process
///
/// Safe to call repeatedly; a subscriber installed elsewhere (tests, an
/// embedding binary) is left in place.
pub fn init_tracing() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let format = LogFormat::from_env_value(std::env::var("LOG_FORMAT").ok().as_deref());

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let console_layer = match format {
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(std::io::stdout().is_terminal())
                .boxed(),
        };

        if tracing_subscriber::registry()
            .with(console_layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
            return;
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?format,
            "Structured logging initialized"
        );
    });
}

/// Current deployment environment, `development` when unset
pub fn get_environment() -> String {
    std::env::var(env_vars::ENVIRONMENT)
        .or_else(|_| std::env::var(env_vars::ENVIRONMENT_FALLBACK))
        .map(|value| value.trim().to_lowercase())
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "development".to_string())
}

/// Default filter directive for an environment
pub fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" => "warn,trail_progress_worker=debug".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log the outcome of one batch invocation
pub fn log_batch_operation(
    operation: &str,
    batch_size: usize,
    attempts: u32,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        batch_size = batch_size,
        attempts = attempts,
        status = %status,
        details = details,
        "BATCH_OPERATION"
    );
}

//! Configuration Loader
//!
//! Environment-aware, layered configuration loading. Later layers win:
//!
//! 1. Built-in defaults (`DATABASE_URL` folds into the default url)
//! 2. `<config_dir>/worker.{toml,yaml,json}`
//! 3. `<config_dir>/worker.<environment>.{toml,yaml,json}`
//! 4. `TRAIL__SECTION__KEY` variables
//! 5. `POSTGRES_CONNECTION_URL`, `POSTGRES_LISTEN_CHANNEL`, `PROCESS_INTERVAL`

use config::{Config, Environment, File};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::{parse_duration, WorkerConfig};
use crate::constants::env as env_vars;

const DEFAULT_ENVIRONMENT: &str = "development";
const DEFAULT_CONFIG_DIR: &str = "config";
const CONFIG_FILE_STEM: &str = "worker";

/// Inputs to a configuration load
///
/// [`ConfigManager::load`] fills this from the process environment; tests
/// build it by hand so they never mutate global state.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub config_dir: Option<PathBuf>,
    pub environment: Option<String>,
    pub env: HashMap<String, String>,
}

impl ConfigSources {
    pub fn from_process_env() -> Self {
        Self {
            config_dir: None,
            environment: None,
            env: std::env::vars().collect(),
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Loaded, validated configuration plus where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: WorkerConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<ConfigManager> {
        Self::load_with(ConfigSources::from_process_env())
    }

    /// Load configuration from explicit sources
    pub fn load_with(sources: ConfigSources) -> ConfigResult<ConfigManager> {
        let environment = sources
            .environment
            .clone()
            .unwrap_or_else(|| Self::detect_environment(&sources.env));
        let config_directory = sources
            .config_dir
            .clone()
            .or_else(|| sources.var(env_vars::CONFIG_DIR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading worker configuration"
        );

        let config = Self::load_and_merge(&sources, &config_directory, &environment)?;
        config.validate()?;

        debug!(
            config = %Self::debug_config(&config),
            "Configuration loaded"
        );
        info!(
            environment = %environment,
            batch_size = config.processing.batch_size,
            worker_concurrency = config.processing.worker_concurrency,
            interval_ms = config.processing.interval.as_millis() as u64,
            listen_channel = %config.database.listen_channel,
            "Configuration loaded successfully"
        );

        Ok(ConfigManager {
            config,
            environment,
            config_directory,
        })
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: WorkerConfig, environment: impl Into<String>) -> ConfigResult<Self> {
        config.validate()?;
        Ok(ConfigManager {
            config,
            environment: environment.into(),
            config_directory: PathBuf::from(DEFAULT_CONFIG_DIR),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn into_config(self) -> WorkerConfig {
        self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `TRAIL_ENV`, then `APP_ENV`, then `development`
    pub fn detect_environment(env: &HashMap<String, String>) -> String {
        [env_vars::ENVIRONMENT, env_vars::ENVIRONMENT_FALLBACK]
            .iter()
            .filter_map(|key| env.get(*key))
            .map(|value| value.trim().to_lowercase())
            .find(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
    }

    fn load_and_merge(
        sources: &ConfigSources,
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<WorkerConfig> {
        let mut defaults = WorkerConfig::default();
        if let Some(url) = sources.var(env_vars::DATABASE_URL) {
            defaults.database.url = url.to_string();
        }

        let base_file = config_directory.join(CONFIG_FILE_STEM);
        let environment_file =
            config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}"));

        let overrides: config::Map<String, String> = sources
            .env
            .iter()
            .filter(|(key, _)| key.starts_with(&format!("{}__", env_vars::OVERRIDE_PREFIX)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut builder = Config::builder()
            .add_source(Config::try_from(&defaults)?)
            .add_source(File::with_name(&base_file.to_string_lossy()).required(false))
            .add_source(File::with_name(&environment_file.to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix(env_vars::OVERRIDE_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(overrides)),
            );

        builder = builder.set_override_option(
            "database.url",
            sources.var(env_vars::LEGACY_DATABASE_URL).map(str::to_string),
        )?;
        builder = builder.set_override_option(
            "database.listen_channel",
            sources
                .var(env_vars::LEGACY_LISTEN_CHANNEL)
                .map(str::to_string),
        )?;
        if let Some(raw) = sources.var(env_vars::LEGACY_PROCESS_INTERVAL) {
            // Checked here so the error names the variable rather than the field
            parse_duration(raw).map_err(|e| {
                ConfigurationError::load_failed(env_vars::LEGACY_PROCESS_INTERVAL, e)
            })?;
            builder = builder.set_override("processing.interval", raw.to_string())?;
        }

        let merged = builder.build()?;
        merged
            .try_deserialize::<WorkerConfig>()
            .map_err(|e| ConfigurationError::load_failed(config_directory.display().to_string(), e))
    }

    /// Configuration as JSON with credentials masked
    pub fn debug_config(config: &WorkerConfig) -> String {
        let mut sanitized = config.clone();
        sanitized.database.url = mask_connection_url(&sanitized.database.url);
        serde_json::to_string(&sanitized).unwrap_or_else(|_| "[serialization error]".to_string())
    }
}

/// Replace the password in a connection url with `***`
pub fn mask_connection_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &url[authority_start..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    let Some(at) = authority.rfind('@') else {
        return url.to_string();
    };
    let credentials = &authority[..at];
    let Some(colon) = credentials.find(':') else {
        return url.to_string();
    };

    format!(
        "{}{}:***{}",
        &url[..authority_start],
        &credentials[..colon],
        &rest[at..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn empty_dir() -> TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_defaults_without_files_or_env() {
        let dir = empty_dir();
        let manager =
            ConfigManager::load_with(ConfigSources::default().with_config_dir(dir.path())).unwrap();

        assert_eq!(manager.environment(), "development");
        assert_eq!(manager.config(), &WorkerConfig::default());
    }

    #[test]
    fn test_detect_environment_precedence() {
        let mut env = HashMap::new();
        assert_eq!(ConfigManager::detect_environment(&env), "development");

        env.insert("APP_ENV".to_string(), "Staging".to_string());
        assert_eq!(ConfigManager::detect_environment(&env), "staging");

        env.insert("TRAIL_ENV".to_string(), "production".to_string());
        assert_eq!(ConfigManager::detect_environment(&env), "production");
    }

    #[test]
    fn test_files_layer_by_environment() {
        let dir = empty_dir();
        std::fs::write(
            dir.path().join("worker.toml"),
            "[processing]\nbatch_size = 25\ninterval = \"1m\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("worker.test.toml"),
            "[processing]\nbatch_size = 5\n",
        )
        .unwrap();

        let manager = ConfigManager::load_with(
            ConfigSources::default()
                .with_config_dir(dir.path())
                .with_environment("test"),
        )
        .unwrap();

        assert_eq!(manager.config().processing.batch_size, 5);
        assert_eq!(manager.config().processing.interval, Duration::from_secs(60));
        assert_eq!(manager.config().processing.max_attempts, 4);
    }

    #[test]
    fn test_prefixed_env_overrides_files() {
        let dir = empty_dir();
        std::fs::write(
            dir.path().join("worker.toml"),
            "[processing]\nbatch_size = 25\n",
        )
        .unwrap();

        let manager = ConfigManager::load_with(
            ConfigSources::default()
                .with_config_dir(dir.path())
                .with_var("TRAIL__PROCESSING__BATCH_SIZE", "50")
                .with_var("TRAIL__PROCESSING__CLAIM_LEASE", "2m"),
        )
        .unwrap();

        assert_eq!(manager.config().processing.batch_size, 50);
        assert_eq!(
            manager.config().processing.claim_lease,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_legacy_variables_win() {
        let dir = empty_dir();
        let manager = ConfigManager::load_with(
            ConfigSources::default()
                .with_config_dir(dir.path())
                .with_var("DATABASE_URL", "postgresql://db/ignored")
                .with_var("POSTGRES_CONNECTION_URL", "postgresql://app:secret@db/trails")
                .with_var("POSTGRES_LISTEN_CHANNEL", "activities_ready")
                .with_var("PROCESS_INTERVAL", "30s"),
        )
        .unwrap();

        let config = manager.config();
        assert_eq!(config.database.url, "postgresql://app:secret@db/trails");
        assert_eq!(config.database.listen_channel, "activities_ready");
        assert_eq!(config.processing.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_database_url_used_as_default() {
        let dir = empty_dir();
        let manager = ConfigManager::load_with(
            ConfigSources::default()
                .with_config_dir(dir.path())
                .with_var("DATABASE_URL", "postgresql://db/from_env"),
        )
        .unwrap();

        assert_eq!(manager.config().database.url, "postgresql://db/from_env");
    }

    #[test]
    fn test_bad_legacy_interval_names_variable() {
        let dir = empty_dir();
        let err = ConfigManager::load_with(
            ConfigSources::default()
                .with_config_dir(dir.path())
                .with_var("PROCESS_INTERVAL", "soon"),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::LoadFailed { ref source_name, .. } if source_name == "PROCESS_INTERVAL"
        ));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = empty_dir();
        let err = ConfigManager::load_with(
            ConfigSources::default()
                .with_config_dir(dir.path())
                .with_var("TRAIL__PROCESSING__BATCH_SIZE", "0"),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_mask_connection_url() {
        assert_eq!(
            mask_connection_url("postgresql://app:secret@db:5432/trails"),
            "postgresql://app:***@db:5432/trails"
        );
        assert_eq!(
            mask_connection_url("postgresql://app@db/trails"),
            "postgresql://app@db/trails"
        );
        assert_eq!(
            mask_connection_url("postgresql://localhost/trails"),
            "postgresql://localhost/trails"
        );
    }

    #[test]
    fn test_debug_config_hides_password() {
        let mut config = WorkerConfig::default();
        config.database.url = "postgresql://app:secret@db/trails".to_string();

        let rendered = ConfigManager::debug_config(&config);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("app:***@db"));
    }
}

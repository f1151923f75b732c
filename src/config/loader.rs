//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered, later ones
//! overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. `<config_dir>/orchestrator.yaml`
//! 3. `<config_dir>/orchestrator.<environment>.yaml`
//! 4. environment variables such as `PIPELINE__DISPATCH__MAX_ATTEMPTS=5`

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "PIPELINE";
const BASE_FILE: &str = "orchestrator";

pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load from a specific directory with an explicit environment, without
    /// touching process-wide environment detection
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading orchestrator configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = environment,
            max_attempts = config.dispatch.max_attempts,
            default_task_timeout_ms = config.correlator.default_task_timeout_ms,
            circuit_breaker_enabled = config.circuit_breaker.enabled,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: OrchestratorConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: PathBuf::from("config"),
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// `PIPELINE_ENV || APP_ENV || development`
    pub fn detect_environment() -> String {
        env::var("PIPELINE_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<OrchestratorConfig> {
        let defaults = Config::try_from(&OrchestratorConfig::default())
            .map_err(|e| ConfigurationError::source_error("defaults", e))?;

        let base_file = config_directory.join(format!("{BASE_FILE}.yaml"));
        let env_file = config_directory.join(format!("{BASE_FILE}.{environment}.yaml"));

        for path in [&base_file, &env_file] {
            if path.exists() {
                debug!(file = %path.display(), "Applying configuration file");
            }
        }

        let merged = Config::builder()
            .add_source(defaults)
            .add_source(File::new(&base_file.to_string_lossy(), FileFormat::Yaml).required(false))
            .add_source(File::new(&env_file.to_string_lossy(), FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                ConfigurationError::source_error(config_directory.display().to_string(), e)
            })?;

        merged
            .try_deserialize::<OrchestratorConfig>()
            .map_err(ConfigurationError::deserialization_error)
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("environment", &self.environment)
            .field("config_directory", &self.config_directory)
            .finish()
    }
}

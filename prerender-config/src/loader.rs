//! Configuration loading and environment variable handling

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::pool::{DrainStrategy, PoolConfig, Realization};
use crate::domains::PrerenderConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "PRERENDER".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<PrerenderConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: PrerenderConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<PrerenderConfig> {
        let mut config = PrerenderConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<PrerenderConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut PrerenderConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply pool config overrides
    fn apply_pool_overrides(&self, config: &mut PoolConfig) -> ConfigResult<()> {
        if let Some(size) = self.parse_env_var::<usize>("POOL_SIZE")? {
            config.pool_size = size;
        }

        if let Some(realization) = self.parse_env_var::<Realization>("REALIZATION")? {
            config.realization = realization;
        }

        if let Ok(strategy) = self.get_env_var("DRAIN_STRATEGY") {
            config.drain_strategy = Some(match strategy.to_lowercase().as_str() {
                "eager_drain" | "eager" => DrainStrategy::EagerDrain,
                "immediate_replace" | "immediate" => DrainStrategy::ImmediateReplace,
                _ => {
                    return Err(ConfigError::EnvError(format!(
                        "Invalid DRAIN_STRATEGY: {}",
                        strategy
                    )))
                }
            });
        }

        if let Some(max_memory) = self.parse_env_var::<u64>("MAX_MEMORY_MB")? {
            config.max_memory_mb = max_memory;
        }

        // Zero disables the request timeout
        if let Some(seconds) = self.parse_env_var::<u64>("REQUEST_TIMEOUT_SECONDS")? {
            config.request_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        }

        if let Some(seconds) = self.parse_env_var::<u64>("STARTUP_TIMEOUT_SECONDS")? {
            config.startup_timeout = Duration::from_secs(seconds);
        }

        if let Ok(program) = self.get_env_var("WORKER_PROGRAM") {
            config.worker.program = PathBuf::from(program);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Some(level) = self.parse_env_var::<LogLevel>("LOG_LEVEL")? {
            config.level = level;
        }

        if let Some(format) = self.parse_env_var::<LogFormat>("LOG_FORMAT")? {
            config.format = format;
        }

        Ok(())
    }

    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

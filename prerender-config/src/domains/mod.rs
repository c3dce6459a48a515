//! Domain-specific configuration modules

pub mod logging;
pub mod pool;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main prerender configuration combining all domains
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrerenderConfig {
    /// Worker pool configuration
    pub pool: pool::PoolConfig,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

impl PrerenderConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

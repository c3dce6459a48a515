//! Configuration management for prerender
//!
//! Configuration is split by domain (worker pool, logging) with serde
//! defaults, validation, YAML loading and environment variable overrides.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::{DrainStrategy, PoolConfig, ProcessWorkerConfig, Realization},
    PrerenderConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

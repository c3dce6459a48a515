//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};

/// How render workers are isolated from the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Realization {
    /// One OS process per worker, spoken to over stdio
    Process,
    /// One dedicated OS thread per worker inside the host process
    #[default]
    Thread,
}

impl Realization {
    /// Drain strategy used when none is configured explicitly
    pub fn default_drain_strategy(&self) -> DrainStrategy {
        match self {
            Realization::Process => DrainStrategy::EagerDrain,
            Realization::Thread => DrainStrategy::ImmediateReplace,
        }
    }
}

impl FromStr for Realization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "fork" => Ok(Realization::Process),
            "thread" => Ok(Realization::Thread),
            _ => Err(format!("Invalid realization: {}", s)),
        }
    }
}

/// How a slot gives up its worker when the worker is recycled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStrategy {
    /// Stop routing to the slot, let in-flight jobs finish, then terminate
    EagerDrain,
    /// Terminate right away and provision the replacement
    ImmediateReplace,
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker slots, fixed for the lifetime of the pool
    pub pool_size: usize,

    /// Worker isolation kind
    pub realization: Realization,

    /// Recycling strategy; derived from the realization when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_strategy: Option<DrainStrategy>,

    /// Memory budget for jobs submitted without one, in MiB
    pub max_memory_mb: u64,

    /// Time a caller waits for a worker reply; `None` waits forever
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    /// Time a new worker has to report ready
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Time a drained worker process has to exit before it is killed
    #[serde(with = "humantime_serde")]
    pub drain_grace_period: Duration,

    /// Time a caller waits for a restarting slot before moving on
    #[serde(with = "humantime_serde")]
    pub restart_wait: Duration,

    /// Worker process command, used by the process realization
    pub worker: ProcessWorkerConfig,
}

/// Command used to launch a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessWorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl PoolConfig {
    pub fn drain_strategy(&self) -> DrainStrategy {
        self.drain_strategy
            .unwrap_or_else(|| self.realization.default_drain_strategy())
    }

    /// Pool of `pool_size` worker processes launched with `program`
    pub fn process(pool_size: usize, program: impl Into<PathBuf>) -> Self {
        Self {
            pool_size,
            realization: Realization::Process,
            worker: ProcessWorkerConfig {
                program: program.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Pool of `pool_size` worker threads
    pub fn thread(pool_size: usize) -> Self {
        Self {
            pool_size,
            realization: Realization::Thread,
            ..Default::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            realization: Realization::default(),
            drain_strategy: None,
            max_memory_mb: default_max_memory_mb(),
            request_timeout: Some(Duration::from_secs(30)),
            startup_timeout: Duration::from_secs(10),
            drain_grace_period: Duration::from_secs(5),
            restart_wait: Duration::from_secs(10),
            worker: ProcessWorkerConfig::default(),
        }
    }
}

impl Default for ProcessWorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("prerender-worker"),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.pool_size, "pool_size", self.domain_name())?;
        validate_positive(self.max_memory_mb, "max_memory_mb", self.domain_name())?;
        validate_positive(
            self.startup_timeout.as_millis(),
            "startup_timeout",
            self.domain_name(),
        )?;
        validate_positive(
            self.restart_wait.as_millis(),
            "restart_wait",
            self.domain_name(),
        )?;

        if let Some(timeout) = self.request_timeout {
            validate_positive(timeout.as_millis(), "request_timeout", self.domain_name())?;
        }

        if self.realization == Realization::Process {
            self.worker.validate()?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

impl Validatable for ProcessWorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(
            &self.program.to_string_lossy(),
            "program",
            self.domain_name(),
        )
    }

    fn domain_name(&self) -> &'static str {
        "pool.worker"
    }
}

// Default value functions
fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, 2)
}

fn default_max_memory_mb() -> u64 {
    250
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config_is_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.realization, Realization::Thread);
        assert_eq!(config.drain_strategy(), DrainStrategy::ImmediateReplace);
    }

    #[test]
    fn test_process_realization_prefers_eager_drain() {
        let config = PoolConfig::process(4, "/usr/local/bin/prerender-worker");
        assert_eq!(config.drain_strategy(), DrainStrategy::EagerDrain);

        let overridden = PoolConfig {
            drain_strategy: Some(DrainStrategy::ImmediateReplace),
            ..config
        };
        assert_eq!(overridden.drain_strategy(), DrainStrategy::ImmediateReplace);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config = PoolConfig::thread(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_process_realization_requires_program() {
        let config = PoolConfig::process(2, "");
        assert!(config.validate().is_err());

        // Thread pools never launch the program
        let config = PoolConfig {
            realization: Realization::Thread,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_realization_parsing() {
        assert_eq!("fork".parse::<Realization>().unwrap(), Realization::Process);
        assert_eq!("Thread".parse::<Realization>().unwrap(), Realization::Thread);
        assert!("fiber".parse::<Realization>().is_err());
    }

    #[test]
    fn test_humantime_durations() {
        let config: PoolConfig = serde_yaml::from_str(
            r#"
pool_size: 3
realization: process
request_timeout: 2m
drain_grace_period: 750ms
"#,
        )
        .unwrap();

        assert_eq!(config.pool_size, 3);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.drain_grace_period, Duration::from_millis(750));
        assert_eq!(config.startup_timeout, Duration::from_secs(10));
    }
}

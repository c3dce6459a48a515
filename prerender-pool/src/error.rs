//! Error types for the worker pool

use prerender_config::ConfigError;
use prerender_ipc::IpcError;
use std::time::Duration;
use thiserror::Error;

/// Failures of an individual worker handle
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker {worker_id} did not report ready within {timeout:?}")]
    StartupTimeout { worker_id: String, timeout: Duration },

    #[error("Worker initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Worker {0} is not running")]
    NotRunning(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

/// Failures constructing a pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use prerender_core::{CorrelationId, RenderResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Messages sent from the coordinator to a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Render one job
    Render {
        correlation_id: CorrelationId,
        payload: JsonValue,
        max_memory_bytes: u64,
    },

    /// Stop accepting jobs and exit once every in-flight job has replied
    Drain,

    /// Health check ping
    Ping { correlation_id: CorrelationId },

    /// Exit immediately
    Shutdown,
}

/// Messages sent from a worker process to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Worker finished starting up and accepts jobs
    Ready { worker_id: String, pid: u32 },

    /// Render finished. `kill` is set when the worker's memory usage reached
    /// the job's budget and the worker should be recycled.
    RenderResult {
        correlation_id: CorrelationId,
        response: RenderResult,
        kill: bool,
        memory_usage_bytes: u64,
    },

    /// Worker-side failure, tied to a request when one is known
    Error {
        correlation_id: Option<CorrelationId>,
        error: WorkerError,
    },

    /// Health check response
    Pong {
        correlation_id: CorrelationId,
        status: WorkerStatus,
    },
}

/// Worker status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub jobs_rendered: u64,
    pub jobs_in_flight: u64,
    pub memory_usage_bytes: Option<u64>,
    pub draining: bool,
}

impl WorkerStatus {
    /// Create a new worker status
    pub fn new(worker_id: String, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid,
            started_at: now,
            last_activity: now,
            jobs_rendered: 0,
            jobs_in_flight: 0,
            memory_usage_bytes: None,
            draining: false,
        }
    }

    /// Update activity timestamp
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Record a job being accepted
    pub fn record_job_started(&mut self) {
        self.jobs_in_flight += 1;
        self.update_activity();
    }

    /// Record a job reply being sent
    pub fn record_job_finished(&mut self, memory_usage_bytes: u64) {
        self.jobs_in_flight = self.jobs_in_flight.saturating_sub(1);
        self.jobs_rendered += 1;
        self.memory_usage_bytes = Some(memory_usage_bytes);
        self.update_activity();
    }

    /// Record a job that ended without a render result
    pub fn record_job_failed(&mut self) {
        self.jobs_in_flight = self.jobs_in_flight.saturating_sub(1);
        self.update_activity();
    }
}

/// Worker error types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum WorkerError {
    /// Job arrived after the worker was told to drain
    Draining,

    /// Worker could not start; sent in place of `ready`
    InitializationFailed { error: String },

    /// Worker panic/crash
    WorkerPanic { error: String },

    /// Message parse error
    MessageParseError { error: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Draining => write!(f, "Worker is draining and accepts no new jobs"),
            WorkerError::InitializationFailed { error } => {
                write!(f, "Worker initialization failed: {}", error)
            }
            WorkerError::WorkerPanic { error } => write!(f, "Worker panic: {}", error),
            WorkerError::MessageParseError { error } => {
                write!(f, "Message parse error: {}", error)
            }
        }
    }
}

impl std::error::Error for WorkerError {}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

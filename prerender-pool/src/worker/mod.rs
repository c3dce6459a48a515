//! Worker handles and the factories that provision them
//!
//! A [`Worker`] is one isolated render context. It accepts jobs tagged with
//! a correlation id and resolves each job's [`Completion`] exactly once: with
//! the reply, with a transport error, or with an exit when the worker dies.
//! Two realizations exist, selected by [`Realization`] at pool construction.

pub mod process;
pub mod thread;

use async_trait::async_trait;
use prerender_config::{PoolConfig, Realization};
use prerender_core::{CorrelationId, MemoryBudget, Renderer};
use serde_json::Value as JsonValue;

use crate::correlation::Completion;
use crate::error::WorkerError;

pub use process::{ProcessWorker, ProcessWorkerFactory};
pub use thread::{ThreadWorker, ThreadWorkerFactory};

/// One job as handed to a worker
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub correlation_id: CorrelationId,
    pub payload: JsonValue,
    pub budget: MemoryBudget,
}

/// Handle to a running worker
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// False once the underlying thread or process is gone
    fn is_alive(&self) -> bool;

    /// Hand a job to the worker. On `Ok` the completion will be resolved
    /// later by the worker. On `Err` it was not delivered and the caller
    /// must produce the result itself.
    async fn send(&self, request: RenderRequest, completion: Completion)
        -> Result<(), WorkerError>;

    /// Stop waiting for a job the caller gave up on
    fn abandon(&self, _correlation_id: &CorrelationId) {}

    /// Ask the worker to finish what it has and accept nothing new
    async fn drain(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Release the worker. Drained workers get a grace period to exit on
    /// their own; everything else is stopped right away.
    async fn terminate(&self) -> Result<(), WorkerError>;

    async fn health_check(&self) -> Result<(), WorkerError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(WorkerError::NotRunning(self.id().to_string()))
        }
    }
}

/// Provisions workers for pool slots
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: Worker;

    /// Start a worker and wait until it accepts jobs
    async fn spawn(&self, worker_id: String) -> Result<Self::Worker, WorkerError>;
}

/// A worker of either realization
pub enum AnyWorker {
    Process(ProcessWorker),
    Thread(ThreadWorker),
}

#[async_trait]
impl Worker for AnyWorker {
    fn id(&self) -> &str {
        match self {
            AnyWorker::Process(worker) => worker.id(),
            AnyWorker::Thread(worker) => worker.id(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            AnyWorker::Process(worker) => worker.is_alive(),
            AnyWorker::Thread(worker) => worker.is_alive(),
        }
    }

    async fn send(
        &self,
        request: RenderRequest,
        completion: Completion,
    ) -> Result<(), WorkerError> {
        match self {
            AnyWorker::Process(worker) => worker.send(request, completion).await,
            AnyWorker::Thread(worker) => worker.send(request, completion).await,
        }
    }

    fn abandon(&self, correlation_id: &CorrelationId) {
        match self {
            AnyWorker::Process(worker) => worker.abandon(correlation_id),
            AnyWorker::Thread(worker) => worker.abandon(correlation_id),
        }
    }

    async fn drain(&self) -> Result<(), WorkerError> {
        match self {
            AnyWorker::Process(worker) => worker.drain().await,
            AnyWorker::Thread(worker) => worker.drain().await,
        }
    }

    async fn terminate(&self) -> Result<(), WorkerError> {
        match self {
            AnyWorker::Process(worker) => worker.terminate().await,
            AnyWorker::Thread(worker) => worker.terminate().await,
        }
    }

    async fn health_check(&self) -> Result<(), WorkerError> {
        match self {
            AnyWorker::Process(worker) => worker.health_check().await,
            AnyWorker::Thread(worker) => worker.health_check().await,
        }
    }
}

/// Factory chosen from [`PoolConfig::realization`]
pub enum RealizationFactory<R: Renderer> {
    Process(ProcessWorkerFactory),
    Thread(ThreadWorkerFactory<R>),
}

impl<R: Renderer> RealizationFactory<R> {
    /// `make_renderer` builds the renderer each worker thread owns. Process
    /// workers host their renderer in the worker binary and never call it.
    pub fn from_config<M>(config: &PoolConfig, make_renderer: M) -> Self
    where
        M: Fn() -> R + Send + Sync + 'static,
    {
        match config.realization {
            Realization::Process => RealizationFactory::Process(ProcessWorkerFactory::new(config)),
            Realization::Thread => RealizationFactory::Thread(ThreadWorkerFactory::new(make_renderer)),
        }
    }

    pub fn realization(&self) -> Realization {
        match self {
            RealizationFactory::Process(_) => Realization::Process,
            RealizationFactory::Thread(_) => Realization::Thread,
        }
    }
}

#[async_trait]
impl<R: Renderer> WorkerFactory for RealizationFactory<R> {
    type Worker = AnyWorker;

    async fn spawn(&self, worker_id: String) -> Result<AnyWorker, WorkerError> {
        match self {
            RealizationFactory::Process(factory) => {
                factory.spawn(worker_id).await.map(AnyWorker::Process)
            }
            RealizationFactory::Thread(factory) => {
                factory.spawn(worker_id).await.map(AnyWorker::Thread)
            }
        }
    }
}

#[async_trait]
impl<F: WorkerFactory> WorkerFactory for std::sync::Arc<F> {
    type Worker = F::Worker;

    async fn spawn(&self, worker_id: String) -> Result<F::Worker, WorkerError> {
        (**self).spawn(worker_id).await
    }
}

//! Render worker pool supervisor
//!
//! Keeps a fixed number of isolated render workers (threads or processes),
//! spreads jobs across them round-robin, matches replies to callers by
//! correlation id, and replaces workers that crash, stall, or exceed their
//! memory budget.
//!
//! ```no_run
//! use prerender_config::PoolConfig;
//! use prerender_pool::{NoRenderer, RenderPool};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), prerender_pool::PoolError> {
//! let config = PoolConfig::process(2, "prerender-worker");
//! let pool = RenderPool::from_config(config, || NoRenderer).await?;
//! let result = pool.render(json!({"url": "/"})).await;
//! println!("{} {}", result.status(), result.html);
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod recycler;
pub mod slot;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use balancer::Balancer;
pub use correlation::{Completion, CompletionReceiver, PendingRequests, WorkerOutcome};
pub use error::{PoolError, WorkerError};
pub use pool::RenderPool;
pub use recycler::{Recycler, RestartReason};
pub use slot::{SlotState, SlotStats, WorkerSlot};
pub use worker::{
    AnyWorker, ProcessWorker, ProcessWorkerFactory, RealizationFactory, RenderRequest,
    ThreadWorker, ThreadWorkerFactory, Worker, WorkerFactory,
};

use async_trait::async_trait;
use prerender_core::{RenderResult, Renderer};
use serde_json::Value as JsonValue;

/// Placeholder renderer for process pools, whose renderer lives in the
/// worker binary
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRenderer;

#[async_trait]
impl Renderer for NoRenderer {
    async fn render(&self, _payload: &JsonValue) -> RenderResult {
        RenderResult::failure("No renderer configured in this process")
    }
}

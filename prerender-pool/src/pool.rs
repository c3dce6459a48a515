//! The render pool

use prerender_config::{PoolConfig, Validatable};
use prerender_core::{RenderJob, RenderResult, Renderer};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::balancer::Balancer;
use crate::dispatcher::Dispatcher;
use crate::error::{PoolError, WorkerError};
use crate::recycler::{Recycler, RestartReason};
use crate::slot::{SlotState, SlotStats, SlotTable, WorkerSlot};
use crate::worker::{RealizationFactory, Worker, WorkerFactory};

/// A fixed-size pool of render workers.
///
/// Jobs are spread round-robin over the slots. Workers that crash, stop
/// answering, or outgrow their memory budget are replaced in place, and
/// every submitted job resolves to exactly one [`RenderResult`].
pub struct RenderPool<F: WorkerFactory> {
    config: PoolConfig,
    slots: SlotTable<F::Worker>,
    balancer: Balancer,
    recycler: Recycler<F>,
    dispatcher: Dispatcher<F>,
}

impl<R: Renderer> RenderPool<RealizationFactory<R>> {
    /// Build a pool of the realization named in `config`. Thread workers
    /// each get a renderer from `make_renderer`.
    pub async fn from_config<M>(config: PoolConfig, make_renderer: M) -> Result<Self, PoolError>
    where
        M: Fn() -> R + Send + Sync + 'static,
    {
        let factory = RealizationFactory::from_config(&config, make_renderer);
        Self::start(config, factory).await
    }
}

impl<F: WorkerFactory> RenderPool<F> {
    /// Validate `config` and start one worker per slot.
    ///
    /// Slots whose worker fails to start are left degraded and retried when
    /// selection reaches them, so a pool starts even if no worker does.
    pub async fn start(config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        config.validate()?;

        let size = config.pool_size;
        let strategy = config.drain_strategy();
        info!(
            "Starting render pool: {} {:?} workers, {:?}",
            size, config.realization, strategy
        );

        let recycler = Recycler::new(Arc::new(factory), strategy, config.restart_wait);
        let dispatcher = Dispatcher::new(recycler.clone(), config.request_timeout);
        let slots = SlotTable::new(size);

        let mut provisioning = JoinSet::new();
        for slot in slots.iter() {
            let slot = slot.clone();
            let recycler = recycler.clone();
            provisioning
                .spawn(async move { recycler.restart(&slot, RestartReason::Startup).await });
        }
        let mut ready = 0;
        while let Some(started) = provisioning.join_next().await {
            if matches!(started, Ok(true)) {
                ready += 1;
            }
        }

        if ready < size {
            warn!("Render pool started with {}/{} workers ready", ready, size);
        } else {
            info!("Render pool started with {} workers", size);
        }

        Ok(Self {
            balancer: Balancer::new(size),
            config,
            slots,
            recycler,
            dispatcher,
        })
    }

    /// Render `job` and return its result. Never fails: problems with the
    /// worker come back as a result with status 500.
    pub async fn submit(&self, job: RenderJob) -> RenderResult {
        if self.recycler.is_closed() {
            return RenderResult::failure("Render pool is shut down");
        }
        let slot = self.get_renderer().await;
        self.dispatcher.dispatch(&slot, job).await
    }

    /// Render `payload` under the pool's default memory budget
    pub async fn render(&self, payload: JsonValue) -> RenderResult {
        let job = RenderJob::new(payload).with_max_memory_mb(self.config.max_memory_mb);
        self.submit(job).await
    }

    /// Pick the slot for the next job.
    ///
    /// Visits at most one slot per pool member. A slot mid-restart is waited
    /// on; any other unavailable slot gets a restart. Each visit costs at
    /// most one restart attempt. If nothing became available the last slot
    /// visited is returned anyway and dispatch reports the failure.
    pub async fn get_renderer(&self) -> Arc<WorkerSlot<F::Worker>> {
        let size = self.slots.len();
        let mut restart_attempts = 0;

        for _ in 0..size {
            let index = self
                .balancer
                .next(|i| self.slots.get(i).state() == SlotState::Restarting);
            let slot = self.slots.get(index);
            if slot.is_available() {
                return slot.clone();
            }

            let recovered = match slot.state() {
                SlotState::Restarting => {
                    debug!(slot = index, "Waiting for restarting slot");
                    slot.wait_ready(self.config.restart_wait).await
                }
                SlotState::Ready | SlotState::Degraded => {
                    restart_attempts += 1;
                    match slot.handle() {
                        Some(dead) => {
                            self.recycler
                                .retire(slot, &dead, RestartReason::Unavailable)
                                .await
                        }
                        None => {
                            self.recycler
                                .restart(slot, RestartReason::Unavailable)
                                .await
                        }
                    }
                }
            };
            if recovered && slot.is_available() {
                return slot.clone();
            }
        }

        let slot = self.slots.get(self.balancer.current()).clone();
        if restart_attempts < size {
            warn!(
                slot = slot.index(),
                "No render worker available after a full rotation, forcing a restart"
            );
            self.recycler
                .restart(&slot, RestartReason::Unavailable)
                .await;
        }
        slot
    }

    /// Slots currently accepting jobs
    pub fn available_workers(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_available()).count()
    }

    pub fn stats(&self) -> Vec<SlotStats> {
        self.slots.iter().map(|slot| slot.stats()).collect()
    }

    /// Check every slot's worker
    pub async fn health_check(&self) -> Vec<(usize, Result<(), WorkerError>)> {
        let mut results = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter() {
            let result = match slot.handle() {
                Some(worker) => worker.health_check().await,
                None => Err(WorkerError::NotRunning(format!("slot {}", slot.index()))),
            };
            results.push((slot.index(), result));
        }
        results
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.recycler.is_closed()
    }

    /// Stop accepting jobs, let in-flight jobs finish, and release every
    /// worker. Later submissions fail with status 500.
    pub async fn shutdown(&self) {
        if !self.recycler.close() {
            return;
        }
        info!("Shutting down render pool");

        for slot in self.slots.iter() {
            // A restart already running finishes first and then sees the
            // pool closed
            slot.wait_ready(self.config.restart_wait).await;
            let Some(guard) = slot.begin_restart() else {
                warn!(slot = slot.index(), "Slot still restarting at shutdown");
                continue;
            };

            if let Some(worker) = slot.take_handle() {
                if let Err(e) = worker.drain().await {
                    debug!("Failed to drain worker {}: {}", worker.id(), e);
                }
                slot.wait_idle().await;
                if let Err(e) = worker.terminate().await {
                    warn!("Failed to terminate worker {}: {}", worker.id(), e);
                }
            }
            guard.fail();
        }

        info!("Render pool shut down");
    }
}

//! Worker replacement: memory recycling and crash recovery
//!
//! Every path that retires a worker ends in [`Recycler::restart`] or
//! [`Recycler::retire`]. A restart owns its slot for its whole duration, so
//! concurrent triggers for the same slot join the one already running
//! instead of spawning twice, and `retire` checks once it owns the slot that
//! its worker was not replaced in the meantime.

use prerender_config::DrainStrategy;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::slot::WorkerSlot;
use crate::worker::{Worker, WorkerFactory};

/// Why a slot's worker is being replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// First worker for the slot
    Startup,
    /// A reply reported usage at or above the job's budget
    MemoryBudget,
    /// The worker exited with requests outstanding
    Crash,
    /// A job could not be handed to the worker
    TransportError,
    /// The worker reported a failure for a job
    RemoteError,
    /// A caller gave up waiting for a reply
    Timeout,
    /// Selection found the slot empty or its worker dead
    Unavailable,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RestartReason::Startup => "startup",
            RestartReason::MemoryBudget => "memory budget exceeded",
            RestartReason::Crash => "worker exited",
            RestartReason::TransportError => "transport error",
            RestartReason::RemoteError => "worker error",
            RestartReason::Timeout => "request timeout",
            RestartReason::Unavailable => "worker unavailable",
        };
        f.write_str(reason)
    }
}

pub struct Recycler<F: WorkerFactory> {
    factory: Arc<F>,
    strategy: DrainStrategy,
    restart_wait: Duration,
    closed: Arc<AtomicBool>,
}

impl<F: WorkerFactory> Clone for Recycler<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            strategy: self.strategy,
            restart_wait: self.restart_wait,
            closed: self.closed.clone(),
        }
    }
}

impl<F: WorkerFactory> Recycler<F> {
    pub fn new(factory: Arc<F>, strategy: DrainStrategy, restart_wait: Duration) -> Self {
        Self {
            factory,
            strategy,
            restart_wait,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn strategy(&self) -> DrainStrategy {
        self.strategy
    }

    pub fn restart_wait(&self) -> Duration {
        self.restart_wait
    }

    /// A dead worker has nothing left to drain
    pub fn strategy_for(&self, worker_alive: bool) -> DrainStrategy {
        if worker_alive {
            self.strategy
        } else {
            DrainStrategy::ImmediateReplace
        }
    }

    /// Stop provisioning workers. Returns false if already closed.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Restart `slot` in the background.
    ///
    /// `retiring` names the worker the trigger came from. If the slot has
    /// already moved on to another worker the trigger is stale and ignored.
    pub fn schedule(
        &self,
        slot: Arc<WorkerSlot<F::Worker>>,
        retiring: Option<&Arc<F::Worker>>,
        reason: RestartReason,
    ) {
        if let Some(worker) = retiring {
            if !slot.holds(worker) {
                debug!(
                    slot = slot.index(),
                    "Ignoring {} for retired worker {}",
                    reason,
                    worker.id()
                );
                return;
            }
        }

        let recycler = self.clone();
        let retiring = retiring.cloned();
        tokio::spawn(async move {
            match retiring {
                Some(worker) => recycler.retire(&slot, &worker, reason).await,
                None => recycler.restart(&slot, reason).await,
            };
        });
    }

    /// Replace the slot's worker, or join a restart already in progress.
    /// Returns whether the slot ended up ready.
    pub async fn restart(&self, slot: &WorkerSlot<F::Worker>, reason: RestartReason) -> bool {
        self.replace(slot, None, reason).await
    }

    /// Replace `worker` if the slot still holds it once the restart owns
    /// the slot. Triggers for a worker that was already replaced leave the
    /// slot's current worker alone.
    pub async fn retire(
        &self,
        slot: &WorkerSlot<F::Worker>,
        worker: &Arc<F::Worker>,
        reason: RestartReason,
    ) -> bool {
        self.replace(slot, Some(worker), reason).await
    }

    async fn replace(
        &self,
        slot: &WorkerSlot<F::Worker>,
        retiring: Option<&Arc<F::Worker>>,
        reason: RestartReason,
    ) -> bool {
        if self.is_closed() {
            return false;
        }

        let Some(guard) = slot.begin_restart() else {
            debug!(slot = slot.index(), "Restart already running, waiting for it");
            return slot.wait_ready(self.restart_wait).await;
        };

        if let (Some(retiring), Some(current)) = (retiring, slot.handle()) {
            if !Arc::ptr_eq(retiring, &current) {
                debug!(
                    slot = slot.index(),
                    "Worker {} already replaced by {}, ignoring {}",
                    retiring.id(),
                    current.id(),
                    reason
                );
                guard.release();
                return true;
            }
        }

        if let Some(old) = slot.take_handle() {
            let strategy = self.strategy_for(old.is_alive());
            info!(
                slot = slot.index(),
                "Recycling worker {} ({}, {:?})",
                old.id(),
                reason,
                strategy
            );
            match strategy {
                DrainStrategy::EagerDrain => {
                    if let Err(e) = old.drain().await {
                        warn!("Failed to drain worker {}: {}", old.id(), e);
                    }
                    slot.wait_idle().await;
                    if let Err(e) = old.terminate().await {
                        warn!("Failed to terminate worker {}: {}", old.id(), e);
                    }
                }
                DrainStrategy::ImmediateReplace => {
                    tokio::spawn(async move {
                        if let Err(e) = old.terminate().await {
                            warn!("Failed to terminate worker {}: {}", old.id(), e);
                        }
                    });
                }
            }
        }

        let worker_id = slot.next_worker_id();
        match self.factory.spawn(worker_id.clone()).await {
            Ok(worker) if !self.is_closed() => {
                debug!(slot = slot.index(), "Worker {} installed", worker_id);
                guard.complete(worker);
                true
            }
            Ok(worker) => {
                // Pool shut down while the worker was starting
                let _ = worker.terminate().await;
                guard.fail();
                false
            }
            Err(e) => {
                error!(
                    slot = slot.index(),
                    "Failed to start worker {}: {}", worker_id, e
                );
                guard.fail();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotState;
    use crate::testing::{FakeFactory, FakeMode};

    fn recycler(factory: &Arc<FakeFactory>, strategy: DrainStrategy) -> Recycler<FakeFactory> {
        Recycler::new(factory.clone(), strategy, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_startup_provisions_slot() {
        let factory = FakeFactory::replying();
        let recycler = recycler(&factory, DrainStrategy::ImmediateReplace);
        let slot = WorkerSlot::new(0);

        assert!(recycler.restart(&slot, RestartReason::Startup).await);
        assert_eq!(slot.state(), SlotState::Ready);
        assert_eq!(slot.handle().unwrap().id(), "worker-0-0");
    }

    #[tokio::test]
    async fn test_concurrent_restarts_spawn_once() {
        let factory = FakeFactory::replying();
        let recycler = recycler(&factory, DrainStrategy::ImmediateReplace);
        let slot = WorkerSlot::new(0);
        assert!(recycler.restart(&slot, RestartReason::Startup).await);

        factory.set_spawn_delay(Duration::from_millis(50));
        let (first, second, third) = tokio::join!(
            recycler.restart(&slot, RestartReason::Crash),
            recycler.restart(&slot, RestartReason::TransportError),
            recycler.restart(&slot, RestartReason::Crash),
        );

        assert!(first && second && third);
        assert_eq!(factory.spawn_attempts(), 2);
        assert_eq!(slot.handle().unwrap().id(), "worker-0-1");
        assert_eq!(slot.stats().restarts, 1);
    }

    #[tokio::test]
    async fn test_failed_spawn_degrades_then_recovers() {
        let factory = FakeFactory::replying();
        let recycler = recycler(&factory, DrainStrategy::ImmediateReplace);
        let slot = WorkerSlot::new(0);

        factory.set_fail_spawns(true);
        assert!(!recycler.restart(&slot, RestartReason::Startup).await);
        assert_eq!(slot.state(), SlotState::Degraded);
        assert!(slot.handle().is_none());

        factory.set_fail_spawns(false);
        assert!(recycler.restart(&slot, RestartReason::Unavailable).await);
        assert!(slot.is_available());
    }

    #[tokio::test]
    async fn test_eager_drain_waits_for_in_flight() {
        let factory = FakeFactory::new(FakeMode::Hold);
        let recycler = recycler(&factory, DrainStrategy::EagerDrain);
        let slot = Arc::new(WorkerSlot::new(0));
        assert!(recycler.restart(&slot, RestartReason::Startup).await);
        let old = factory.worker("worker-0-0").unwrap();

        let request = slot.begin_request();
        let restart = {
            let recycler = recycler.clone();
            let slot = slot.clone();
            tokio::spawn(async move { recycler.restart(&slot, RestartReason::MemoryBudget).await })
        };

        assert!(crate::testing::eventually(|| old.is_drained()).await);
        assert_eq!(slot.state(), SlotState::Restarting);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!old.is_terminated());

        drop(request);
        assert!(restart.await.unwrap());
        assert!(old.is_terminated());
        assert_eq!(slot.handle().unwrap().id(), "worker-0-1");
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced_without_drain() {
        let factory = FakeFactory::new(FakeMode::Hold);
        let recycler = recycler(&factory, DrainStrategy::EagerDrain);
        let slot = Arc::new(WorkerSlot::new(0));
        assert!(recycler.restart(&slot, RestartReason::Startup).await);
        let old = factory.worker("worker-0-0").unwrap();
        old.alive.store(false, Ordering::SeqCst);

        // An in-flight request would block an eager drain forever
        let _request = slot.begin_request();
        assert!(recycler.restart(&slot, RestartReason::Crash).await);
        assert!(!old.is_drained());
    }

    #[tokio::test]
    async fn test_stale_trigger_is_ignored() {
        let factory = FakeFactory::replying();
        let recycler = recycler(&factory, DrainStrategy::ImmediateReplace);
        let slot = Arc::new(WorkerSlot::new(0));
        assert!(recycler.restart(&slot, RestartReason::Startup).await);
        let retired = slot.handle().unwrap();
        assert!(recycler.restart(&slot, RestartReason::Crash).await);

        recycler.schedule(slot.clone(), Some(&retired), RestartReason::Crash);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(factory.spawn_attempts(), 2);
    }

    #[tokio::test]
    async fn test_retire_after_replacement_keeps_new_worker() {
        let factory = FakeFactory::replying();
        let recycler = recycler(&factory, DrainStrategy::ImmediateReplace);
        let slot = Arc::new(WorkerSlot::new(0));
        assert!(recycler.restart(&slot, RestartReason::Startup).await);
        let crashed = slot.handle().unwrap();

        // Two jobs on the crashed worker each report the same exit
        assert!(recycler.retire(&slot, &crashed, RestartReason::Crash).await);
        assert!(recycler.retire(&slot, &crashed, RestartReason::Crash).await);

        assert_eq!(factory.spawn_attempts(), 2);
        assert_eq!(slot.state(), SlotState::Ready);
        assert_eq!(slot.handle().unwrap().id(), "worker-0-1");
        assert!(!factory.workers()[1].is_terminated());
    }

    #[tokio::test]
    async fn test_closed_recycler_does_not_spawn() {
        let factory = FakeFactory::replying();
        let recycler = recycler(&factory, DrainStrategy::ImmediateReplace);
        let slot = WorkerSlot::new(0);

        assert!(recycler.close());
        assert!(!recycler.close());
        assert!(!recycler.restart(&slot, RestartReason::Startup).await);
        assert_eq!(factory.spawn_attempts(), 0);
    }
}

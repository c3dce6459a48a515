//! Job dispatch and outcome handling
//!
//! A dispatched job always produces exactly one [`RenderResult`]. Whatever
//! ends the job, the dispatcher decides whether the slot needs a new worker
//! and hands that to the [`Recycler`] without making the caller wait for it.

use prerender_core::{CorrelationId, RenderJob, RenderResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use crate::correlation::{Completion, WorkerOutcome};
use crate::recycler::{Recycler, RestartReason};
use crate::slot::{InFlightGuard, WorkerSlot};
use crate::worker::{RenderRequest, Worker, WorkerFactory};

pub struct Dispatcher<F: WorkerFactory> {
    recycler: Recycler<F>,
    request_timeout: Option<Duration>,
}

impl<F: WorkerFactory> Dispatcher<F> {
    pub fn new(recycler: Recycler<F>, request_timeout: Option<Duration>) -> Self {
        Self {
            recycler,
            request_timeout,
        }
    }

    /// Run `job` on the worker in `slot`
    pub async fn dispatch(&self, slot: &Arc<WorkerSlot<F::Worker>>, job: RenderJob) -> RenderResult {
        let correlation_id = CorrelationId::new();
        let span = tracing::debug_span!("dispatch", %correlation_id, slot = slot.index());
        self.run(slot, correlation_id, job).instrument(span).await
    }

    async fn run(
        &self,
        slot: &Arc<WorkerSlot<F::Worker>>,
        correlation_id: CorrelationId,
        job: RenderJob,
    ) -> RenderResult {
        let (payload, budget) = job.into_parts();
        let mut retried = false;

        let (worker, _in_flight, receiver) = loop {
            let Some((worker, in_flight)) = self.acquire(slot).await else {
                warn!("Slot {} has no worker to run the job", slot.index());
                self.recycler
                    .schedule(slot.clone(), None, RestartReason::Unavailable);
                return RenderResult::failure(format!(
                    "No render worker available in slot {}",
                    slot.index()
                ));
            };

            let request = RenderRequest {
                correlation_id,
                payload: payload.clone(),
                budget,
            };
            let (completion, receiver) = Completion::new(correlation_id);

            debug!("Sending job to worker {}", worker.id());
            match worker.send(request, completion).await {
                Ok(()) => break (worker, in_flight, receiver),
                // Retired between acquire and send; the slot has moved on
                Err(e) if !retried && !slot.holds(&worker) => {
                    debug!("Worker {} retired before the job was sent: {}", worker.id(), e);
                    retried = true;
                }
                Err(e) => {
                    warn!("Worker {} rejected job: {}", worker.id(), e);
                    self.recycler
                        .schedule(slot.clone(), Some(&worker), RestartReason::TransportError);
                    return RenderResult::failure(format!(
                        "Failed to send job to worker {}: {}",
                        worker.id(),
                        e
                    ));
                }
            }
        };

        let outcome = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver.outcome()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    worker.abandon(&correlation_id);
                    warn!(
                        "Worker {} did not reply within {:?}, recycling it",
                        worker.id(),
                        limit
                    );
                    self.recycler
                        .schedule(slot.clone(), Some(&worker), RestartReason::Timeout);
                    return RenderResult::failure(format!(
                        "Render timed out after {:?} on worker {}",
                        limit,
                        worker.id()
                    ));
                }
            },
            None => receiver.outcome().await,
        };

        self.settle(slot, &worker, outcome)
    }

    /// The slot's current worker, counted as in flight. A restart in
    /// progress is waited out without holding the count, since an eager
    /// drain waits for the count to reach zero.
    async fn acquire<'a>(
        &self,
        slot: &'a WorkerSlot<F::Worker>,
    ) -> Option<(Arc<F::Worker>, InFlightGuard<'a, F::Worker>)> {
        // Counted before the handle is read so a drain cannot miss this job
        let in_flight = slot.begin_request();
        if let Some(worker) = slot.handle() {
            return Some((worker, in_flight));
        }
        drop(in_flight);

        if !slot.wait_ready(self.recycler.restart_wait()).await {
            return None;
        }
        let in_flight = slot.begin_request();
        slot.handle().map(|worker| (worker, in_flight))
    }

    fn settle(
        &self,
        slot: &Arc<WorkerSlot<F::Worker>>,
        worker: &Arc<F::Worker>,
        outcome: WorkerOutcome,
    ) -> RenderResult {
        match outcome {
            WorkerOutcome::Reply {
                response,
                memory_exceeded,
            } => {
                slot.record_completed();
                if memory_exceeded {
                    info!(
                        "Worker {} reached its memory budget, recycling",
                        worker.id()
                    );
                    self.recycler
                        .schedule(slot.clone(), Some(worker), RestartReason::MemoryBudget);
                }
                response
            }
            WorkerOutcome::Error(error) => {
                warn!("Worker {} failed a job: {}", worker.id(), error);
                self.recycler
                    .schedule(slot.clone(), Some(worker), RestartReason::RemoteError);
                RenderResult::failure(error)
            }
            WorkerOutcome::Exit(detail) => {
                warn!("Worker {} exited mid-job: {}", worker.id(), detail);
                self.recycler
                    .schedule(slot.clone(), Some(worker), RestartReason::Crash);
                RenderResult::failure(detail)
            }
        }
    }
}

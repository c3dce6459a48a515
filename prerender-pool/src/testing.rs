//! Scripted workers for exercising the pool without threads or processes

use async_trait::async_trait;
use parking_lot::Mutex;
use prerender_core::{CorrelationId, RenderResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::correlation::{Completion, PendingRequests, WorkerOutcome};
use crate::error::WorkerError;
use crate::worker::{RenderRequest, Worker, WorkerFactory};

/// How a fake worker treats the jobs it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeMode {
    /// Reply at once
    Reply { memory_exceeded: bool },
    /// Park the completion until the test resolves it
    Hold,
    /// Refuse the send as if the channel were closed
    RejectSend,
}

/// Everything a test can observe or drive on a fake worker
pub(crate) struct FakeState {
    pub id: String,
    pub mode: FakeMode,
    pub alive: AtomicBool,
    pub pending: PendingRequests,
    pub held: Mutex<Vec<CorrelationId>>,
    pub received: AtomicUsize,
    pub drained: AtomicBool,
    pub terminated: AtomicBool,
    send_delay: Option<Duration>,
}

impl FakeState {
    pub fn held(&self) -> Vec<CorrelationId> {
        self.held.lock().clone()
    }

    /// Resolve a parked job with a successful reply
    pub fn reply_to(&self, correlation_id: &CorrelationId, memory_exceeded: bool) -> bool {
        self.pending.resolve(
            correlation_id,
            WorkerOutcome::Reply {
                response: RenderResult::ok(format!("rendered by {}", self.id)),
                memory_exceeded,
            },
        )
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeWorker {
    state: Arc<FakeState>,
}

impl FakeWorker {
    fn new(id: &str, mode: FakeMode, send_delay: Option<Duration>) -> Self {
        Self {
            state: Arc::new(FakeState {
                id: id.to_string(),
                mode,
                alive: AtomicBool::new(true),
                pending: PendingRequests::new(),
                held: Mutex::new(Vec::new()),
                received: AtomicUsize::new(0),
                drained: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                send_delay,
            }),
        }
    }

    /// A replying worker not tracked by any factory
    pub fn standalone(id: &str) -> Self {
        Self::new(
            id,
            FakeMode::Reply {
                memory_exceeded: false,
            },
            None,
        )
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        request: RenderRequest,
        completion: Completion,
    ) -> Result<(), WorkerError> {
        self.state.received.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.state.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.is_drained() {
            return Err(WorkerError::NotRunning(format!(
                "{} is draining",
                self.state.id
            )));
        }
        match self.state.mode {
            FakeMode::RejectSend => Err(WorkerError::Transport(format!(
                "channel to {} is closed",
                self.state.id
            ))),
            FakeMode::Reply { memory_exceeded } => {
                completion.complete(WorkerOutcome::Reply {
                    response: RenderResult::ok(format!("rendered by {}", self.state.id)),
                    memory_exceeded,
                });
                Ok(())
            }
            FakeMode::Hold => {
                self.state.pending.register(completion);
                self.state.held.lock().push(request.correlation_id);
                Ok(())
            }
        }
    }

    fn abandon(&self, correlation_id: &CorrelationId) {
        self.state.pending.remove(correlation_id);
    }

    async fn drain(&self) -> Result<(), WorkerError> {
        self.state.drained.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), WorkerError> {
        self.state.terminated.store(true, Ordering::SeqCst);
        self.state.alive.store(false, Ordering::SeqCst);
        self.state
            .pending
            .fail_all(WorkerOutcome::Exit(format!("{} terminated", self.state.id)));
        Ok(())
    }
}

/// Factory handing out [`FakeWorker`]s and remembering each one
pub(crate) struct FakeFactory {
    mode: Mutex<FakeMode>,
    fail_spawns: AtomicBool,
    spawn_delay: Mutex<Option<Duration>>,
    send_delay: Mutex<Option<Duration>>,
    spawn_attempts: AtomicUsize,
    workers: Mutex<Vec<Arc<FakeState>>>,
}

impl FakeFactory {
    pub fn new(mode: FakeMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            fail_spawns: AtomicBool::new(false),
            spawn_delay: Mutex::new(None),
            send_delay: Mutex::new(None),
            spawn_attempts: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn replying() -> Arc<Self> {
        Self::new(FakeMode::Reply {
            memory_exceeded: false,
        })
    }

    pub fn set_mode(&self, mode: FakeMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.spawn_delay.lock() = Some(delay);
    }

    /// Delay every send on workers spawned from now on
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub fn spawn_attempts(&self) -> usize {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    /// Workers successfully started, in spawn order
    pub fn workers(&self) -> Vec<Arc<FakeState>> {
        self.workers.lock().clone()
    }

    pub fn worker(&self, id: &str) -> Option<Arc<FakeState>> {
        self.workers
            .lock()
            .iter()
            .find(|state| state.id == id)
            .cloned()
    }
}

#[async_trait]
impl WorkerFactory for FakeFactory {
    type Worker = FakeWorker;

    async fn spawn(&self, worker_id: String) -> Result<FakeWorker, WorkerError> {
        self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.spawn_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(WorkerError::SpawnFailed(format!(
                "{} refused to start",
                worker_id
            )));
        }

        let mode = *self.mode.lock();
        let worker = FakeWorker::new(&worker_id, mode, *self.send_delay.lock());
        self.workers.lock().push(worker.state.clone());
        Ok(worker)
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

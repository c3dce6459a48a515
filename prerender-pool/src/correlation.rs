//! Request correlation and single-resolution completions
//!
//! Every dispatched job gets a [`Completion`], a one-shot resolver that can
//! deliver exactly one [`WorkerOutcome`] to the waiting caller. Workers that
//! multiplex many jobs over one channel park completions in
//! [`PendingRequests`]; removing the entry under the map lock is what makes
//! the first of several competing events win.

use parking_lot::Mutex;
use prerender_core::{CorrelationId, RenderResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// The three ways a dispatched job can end
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    /// The worker replied; `memory_exceeded` asks for the worker to be recycled
    Reply {
        response: RenderResult,
        memory_exceeded: bool,
    },
    /// Transport or worker-side failure
    Error(String),
    /// The worker terminated before replying
    Exit(String),
}

/// Resolver half of a dispatched job. Consumed on first use.
#[derive(Debug)]
pub struct Completion {
    correlation_id: CorrelationId,
    sender: oneshot::Sender<WorkerOutcome>,
}

/// Caller half of a dispatched job
#[derive(Debug)]
pub struct CompletionReceiver {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<WorkerOutcome>,
}

impl Completion {
    pub fn new(correlation_id: CorrelationId) -> (Self, CompletionReceiver) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                correlation_id,
                sender,
            },
            CompletionReceiver {
                correlation_id,
                receiver,
            },
        )
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Deliver the outcome. Returns false when the caller stopped waiting.
    pub fn complete(self, outcome: WorkerOutcome) -> bool {
        self.sender.send(outcome).is_ok()
    }
}

impl CompletionReceiver {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the outcome. A completion dropped without being resolved
    /// means the worker holding it went away, which reads as an exit.
    pub async fn outcome(self) -> WorkerOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => WorkerOutcome::Exit(format!(
                "Worker dropped request {} without replying",
                self.correlation_id
            )),
        }
    }
}

/// In-flight requests on a shared worker channel, keyed by correlation id
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<CorrelationId, Completion>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, completion: Completion) {
        self.inner
            .lock()
            .insert(completion.correlation_id(), completion);
    }

    /// Resolve one request. Returns false if it was already resolved or
    /// never registered.
    pub fn resolve(&self, correlation_id: &CorrelationId, outcome: WorkerOutcome) -> bool {
        let completion = self.inner.lock().remove(correlation_id);
        match completion {
            Some(completion) => {
                completion.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve every outstanding request with the same outcome, returning
    /// how many were still waiting
    pub fn fail_all(&self, outcome: WorkerOutcome) -> usize {
        let drained: Vec<Completion> = self.inner.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for completion in drained {
            completion.complete(outcome.clone());
        }
        count
    }

    /// Forget a request without resolving it
    pub fn remove(&self, correlation_id: &CorrelationId) -> Option<Completion> {
        self.inner.lock().remove(correlation_id)
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

//! Worker threads inside the host process
//!
//! Each worker owns a dedicated OS thread running a single-threaded tokio
//! runtime and its own [`Renderer`]. Jobs arrive over a command channel and
//! run one at a time. A renderer panic unwinds the thread, which drops every
//! queued completion; waiting callers observe that as a worker exit.

use async_trait::async_trait;
use parking_lot::Mutex;
use prerender_core::Renderer;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{RenderRequest, Worker, WorkerFactory};
use crate::correlation::{Completion, WorkerOutcome};
use crate::error::WorkerError;

type MakeRenderer<R> = Arc<dyn Fn() -> R + Send + Sync>;

/// Commands sent to a worker thread
enum ThreadCommand {
    Render {
        request: RenderRequest,
        completion: Completion,
    },
}

/// Starts worker threads, building a fresh renderer for each one
pub struct ThreadWorkerFactory<R: Renderer> {
    make_renderer: MakeRenderer<R>,
}

impl<R: Renderer> ThreadWorkerFactory<R> {
    pub fn new<M>(make_renderer: M) -> Self
    where
        M: Fn() -> R + Send + Sync + 'static,
    {
        Self {
            make_renderer: Arc::new(make_renderer),
        }
    }
}

#[async_trait]
impl<R: Renderer> WorkerFactory for ThreadWorkerFactory<R> {
    type Worker = ThreadWorker;

    async fn spawn(&self, worker_id: String) -> Result<ThreadWorker, WorkerError> {
        let renderer = (self.make_renderer)();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = oneshot::channel::<Result<(), String>>();

        let thread = std::thread::Builder::new()
            .name(format!("prerender-{}", worker_id))
            .spawn(move || run_worker_thread(renderer, command_rx, init_tx))
            .map_err(|e| WorkerError::SpawnFailed(format!("thread {}: {}", worker_id, e)))?;

        match init_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(WorkerError::InitializationFailed(e)),
            Err(_) => {
                return Err(WorkerError::InitializationFailed(
                    "worker thread exited during startup".to_string(),
                ))
            }
        }

        info!("Worker thread {} ready", worker_id);
        Ok(ThreadWorker {
            id: worker_id,
            commands: Mutex::new(Some(command_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

fn run_worker_thread<R: Renderer>(
    renderer: R,
    mut commands: mpsc::UnboundedReceiver<ThreadCommand>,
    init: oneshot::Sender<Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = init.send(Err(format!("failed to build worker runtime: {}", e)));
            return;
        }
    };
    let _ = init.send(Ok(()));

    runtime.block_on(async move {
        // Keeps going after the handle closes the channel until the queue is empty
        while let Some(command) = commands.recv().await {
            match command {
                ThreadCommand::Render {
                    request,
                    completion,
                } => {
                    let response = renderer.render(&request.payload).await;
                    // Host RSS is shared by every thread worker; only the
                    // renderer's own figure is attributable to this one
                    let memory_exceeded = renderer
                        .memory_usage()
                        .is_some_and(|usage| request.budget.is_exceeded_by(usage));
                    completion.complete(WorkerOutcome::Reply {
                        response,
                        memory_exceeded,
                    });
                }
            }
        }
    });
}

/// Handle to a running worker thread
pub struct ThreadWorker {
    id: String,
    commands: Mutex<Option<mpsc::UnboundedSender<ThreadCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Worker for ThreadWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        let accepting = self
            .commands
            .lock()
            .as_ref()
            .is_some_and(|commands| !commands.is_closed());
        let running = self
            .thread
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.is_finished());
        accepting && running
    }

    async fn send(
        &self,
        request: RenderRequest,
        completion: Completion,
    ) -> Result<(), WorkerError> {
        let commands = self.commands.lock();
        let Some(commands) = commands.as_ref() else {
            return Err(WorkerError::NotRunning(self.id.clone()));
        };

        // A rejected command drops its completion along with it
        commands
            .send(ThreadCommand::Render {
                request,
                completion,
            })
            .map_err(|_| WorkerError::Transport(format!("worker thread {} is gone", self.id)))
    }

    async fn terminate(&self) -> Result<(), WorkerError> {
        // Queued jobs still finish; the thread exits once they have
        if self.commands.lock().take().is_some() {
            debug!("Released worker thread {}", self.id);
        }
        self.thread.lock().take();
        Ok(())
    }
}

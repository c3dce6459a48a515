//! Worker process message loop
//!
//! Jobs are rendered concurrently, each on its own task. A single writer
//! task owns stdout so replies from different jobs never interleave. After
//! a `drain` the loop turns away new jobs and exits once the last in-flight
//! job has replied.

use parking_lot::Mutex;
use prerender_core::{CorrelationId, MemoryBudget, MemoryProbe, Renderer};
use prerender_ipc::{
    CoordinatorMessage, IpcError, MessageReader, MessageWriter, WorkerError, WorkerMessage,
    WorkerStatus,
};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

type Outbox = mpsc::UnboundedSender<CoordinatorMessage>;

/// Hosts a [`Renderer`] behind the worker side of the IPC protocol
pub struct WorkerRuntime<R: Renderer> {
    worker_id: String,
    renderer: Arc<R>,
    probe: Arc<MemoryProbe>,
    status: Arc<Mutex<WorkerStatus>>,
}

impl<R: Renderer> WorkerRuntime<R> {
    pub fn new(worker_id: impl Into<String>, renderer: R) -> Self {
        let worker_id = worker_id.into();
        let status = WorkerStatus::new(worker_id.clone(), std::process::id());
        Self {
            worker_id,
            renderer: Arc::new(renderer),
            probe: Arc::new(MemoryProbe::new()),
            status: Arc::new(Mutex::new(status)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    /// Serve the coordinator over this process's stdin and stdout
    pub async fn run_stdio(&self) -> Result<(), IpcError> {
        self.run(MessageReader::stdin(), MessageWriter::stdout()).await
    }

    /// Serve the coordinator until it shuts the worker down, closes the
    /// stream, or a drain completes
    pub async fn run<Rd, Wr>(
        &self,
        mut reader: MessageReader<Rd>,
        writer: MessageWriter<Wr>,
    ) -> Result<(), IpcError>
    where
        Rd: AsyncRead + Unpin,
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, replies) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_replies(self.worker_id.clone(), writer, replies));

        let _ = outbox.send(CoordinatorMessage::Ready {
            worker_id: self.worker_id.clone(),
            pid: std::process::id(),
        });
        info!("Worker {} ready", self.worker_id);

        let in_flight = Arc::new(watch::channel(0usize).0);
        let mut idle = in_flight.subscribe();
        let mut renders = JoinSet::new();
        let mut draining = false;
        let mut drained = false;
        let mut result = Ok(());

        loop {
            while renders.try_join_next().is_some() {}

            let received = if draining {
                tokio::select! {
                    received = reader.receive::<WorkerMessage>() => received,
                    _ = idle.wait_for(|count| *count == 0) => {
                        info!("Worker {} drained, exiting", self.worker_id);
                        drained = true;
                        break;
                    }
                }
            } else {
                reader.receive::<WorkerMessage>().await
            };

            match received {
                Ok(envelope) => match envelope.message {
                    WorkerMessage::Render {
                        correlation_id,
                        payload,
                        max_memory_bytes,
                    } => {
                        if draining {
                            debug!("Turning away job {} while draining", correlation_id);
                            let _ = outbox.send(CoordinatorMessage::Error {
                                correlation_id: Some(correlation_id),
                                error: WorkerError::Draining,
                            });
                        } else {
                            self.spawn_render(
                                &mut renders,
                                &outbox,
                                &in_flight,
                                correlation_id,
                                payload,
                                MemoryBudget::from_bytes(max_memory_bytes),
                            );
                        }
                    }
                    WorkerMessage::Drain => {
                        info!(
                            "Worker {} draining with {} jobs in flight",
                            self.worker_id,
                            *in_flight.borrow()
                        );
                        draining = true;
                        self.status.lock().draining = true;
                    }
                    WorkerMessage::Ping { correlation_id } => {
                        let _ = outbox.send(CoordinatorMessage::Pong {
                            correlation_id,
                            status: self.status(),
                        });
                    }
                    WorkerMessage::Shutdown => {
                        info!("Worker {} received shutdown", self.worker_id);
                        break;
                    }
                },
                Err(IpcError::ConnectionClosed) => {
                    info!("Worker {} received EOF, shutting down", self.worker_id);
                    break;
                }
                Err(e) if e.is_malformed_message() => {
                    warn!("Worker {} failed to parse message: {}", self.worker_id, e);
                    let _ = outbox.send(CoordinatorMessage::Error {
                        correlation_id: None,
                        error: WorkerError::MessageParseError {
                            error: e.to_string(),
                        },
                    });
                }
                Err(e) => {
                    error!("Worker {} failed to read from stdin: {}", self.worker_id, e);
                    result = Err(e);
                    break;
                }
            }
        }

        if drained {
            while renders.join_next().await.is_some() {}
        } else {
            renders.shutdown().await;
        }

        drop(outbox);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if result.is_ok() {
                    result = Err(e);
                }
            }
            Err(e) => error!("Worker {} writer task failed: {}", self.worker_id, e),
        }

        result
    }

    fn spawn_render(
        &self,
        renders: &mut JoinSet<()>,
        outbox: &Outbox,
        in_flight: &Arc<watch::Sender<usize>>,
        correlation_id: CorrelationId,
        payload: JsonValue,
        budget: MemoryBudget,
    ) {
        in_flight.send_modify(|count| *count += 1);
        self.status.lock().record_job_started();

        let worker_id = self.worker_id.clone();
        let renderer = self.renderer.clone();
        let probe = self.probe.clone();
        let status = self.status.clone();
        let outbox = outbox.clone();
        let in_flight = in_flight.clone();

        renders.spawn(async move {
            // Rendered on its own task so a panic comes back as a JoinError
            let render = {
                let renderer = renderer.clone();
                tokio::spawn(async move { renderer.render(&payload).await })
            };

            let message = match render.await {
                Ok(response) => {
                    let usage = probe.current_usage(renderer.as_ref());
                    let kill = budget.is_exceeded_by(usage);
                    if kill {
                        info!(
                            "Worker {} at {} bytes reached its {} budget",
                            worker_id, usage, budget
                        );
                    }
                    status.lock().record_job_finished(usage);
                    CoordinatorMessage::RenderResult {
                        correlation_id,
                        response,
                        kill,
                        memory_usage_bytes: usage,
                    }
                }
                Err(e) => {
                    let detail = join_failure(e);
                    error!("Worker {} job {} failed: {}", worker_id, correlation_id, detail);
                    status.lock().record_job_failed();
                    CoordinatorMessage::Error {
                        correlation_id: Some(correlation_id),
                        error: WorkerError::WorkerPanic { error: detail },
                    }
                }
            };

            // Queued before the count drops so a drain never exits ahead of it
            let _ = outbox.send(message);
            in_flight.send_modify(|count| *count = count.saturating_sub(1));
        });
    }
}

/// Tell the coordinator this worker cannot start. Sent instead of `ready`.
pub async fn report_startup_failure<Wr>(
    writer: &mut MessageWriter<Wr>,
    error: impl Into<String>,
) -> Result<(), IpcError>
where
    Wr: AsyncWrite + Unpin,
{
    writer
        .send(CoordinatorMessage::Error {
            correlation_id: None,
            error: WorkerError::InitializationFailed {
                error: error.into(),
            },
        })
        .await
}

async fn write_replies<Wr>(
    worker_id: String,
    mut writer: MessageWriter<Wr>,
    mut replies: mpsc::UnboundedReceiver<CoordinatorMessage>,
) -> Result<(), IpcError>
where
    Wr: AsyncWrite + Unpin,
{
    while let Some(message) = replies.recv().await {
        if let Err(e) = writer.send(message).await {
            error!("Worker {} failed to write reply: {}", worker_id, e);
            return Err(e);
        }
    }
    Ok(())
}

fn join_failure(error: JoinError) -> String {
    if error.is_panic() {
        panic_message(error.into_panic())
    } else {
        error.to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "render panicked".to_string()
    }
}

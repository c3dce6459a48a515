//! Worker processes spoken to over stdin/stdout

use async_trait::async_trait;
use parking_lot::Mutex;
use prerender_config::{PoolConfig, ProcessWorkerConfig};
use prerender_core::CorrelationId;
use prerender_ipc::{
    CoordinatorMessage, IpcError, MessageReader, MessageWriter, WorkerMessage, WorkerStatus,
};
use std::collections::HashMap;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{RenderRequest, Worker, WorkerFactory};
use crate::correlation::{Completion, PendingRequests, WorkerOutcome};
use crate::error::WorkerError;

/// Environment variable carrying the worker id into the child
pub const WORKER_ID_ENV: &str = "PRERENDER_WORKER_ID";

type PendingPings = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<WorkerStatus>>>>;

/// Launches worker processes from a [`ProcessWorkerConfig`]
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    command: ProcessWorkerConfig,
    startup_timeout: Duration,
    drain_grace_period: Duration,
}

impl ProcessWorkerFactory {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            command: config.worker.clone(),
            startup_timeout: config.startup_timeout,
            drain_grace_period: config.drain_grace_period,
        }
    }

    fn build_command(&self, worker_id: &str) -> Command {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(WORKER_ID_ENV, worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    type Worker = ProcessWorker;

    async fn spawn(&self, worker_id: String) -> Result<ProcessWorker, WorkerError> {
        debug!("Spawning worker process {}", worker_id);

        let mut child = self.build_command(&worker_id).spawn().map_err(|e| {
            WorkerError::SpawnFailed(format!("{}: {}", self.command.program.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("worker stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("worker stdout was not captured".to_string()))?;

        let mut reader = MessageReader::new(stdout);
        let pid = match tokio::time::timeout(self.startup_timeout, await_ready(&mut reader)).await
        {
            Ok(Ok(pid)) => pid,
            Ok(Err(e)) => {
                let _ = child.start_kill();
                return Err(e);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(WorkerError::StartupTimeout {
                    worker_id,
                    timeout: self.startup_timeout,
                });
            }
        };

        info!("Worker process {} ready (pid {})", worker_id, pid);
        Ok(ProcessWorker::start(
            worker_id,
            pid,
            child,
            stdin,
            reader,
            self.drain_grace_period,
        ))
    }
}

/// Wait for the child's `ready` message, returning its pid
async fn await_ready(reader: &mut MessageReader<ChildStdout>) -> Result<u32, WorkerError> {
    loop {
        match reader.receive::<CoordinatorMessage>().await {
            Ok(envelope) => match envelope.message {
                CoordinatorMessage::Ready { pid, .. } => return Ok(pid),
                CoordinatorMessage::Error { error, .. } => {
                    return Err(WorkerError::InitializationFailed(error.to_string()))
                }
                other => debug!("Ignoring message before ready: {:?}", other),
            },
            Err(IpcError::ConnectionClosed) => {
                return Err(WorkerError::InitializationFailed(
                    "worker exited before reporting ready".to_string(),
                ))
            }
            Err(e) if e.is_malformed_message() => {
                warn!("Skipping malformed startup line from worker: {}", e)
            }
            Err(e) => return Err(WorkerError::Ipc(e)),
        }
    }
}

/// A running worker process.
///
/// Two background tasks watch the child: one reads replies off stdout and
/// resolves them by correlation id, the other waits for the process to exit
/// and fails every request still pending. Dropping the handle kills the
/// child.
pub struct ProcessWorker {
    id: String,
    pid: u32,
    writer: tokio::sync::Mutex<MessageWriter<ChildStdin>>,
    pending: PendingRequests,
    pings: PendingPings,
    alive: Arc<AtomicBool>,
    draining: AtomicBool,
    exited: watch::Receiver<bool>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    drain_grace_period: Duration,
}

impl ProcessWorker {
    fn start(
        id: String,
        pid: u32,
        child: Child,
        stdin: ChildStdin,
        reader: MessageReader<ChildStdout>,
        drain_grace_period: Duration,
    ) -> Self {
        let pending = PendingRequests::new();
        let pings: PendingPings = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (exited_tx, exited) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(read_replies(
            id.clone(),
            reader,
            pending.clone(),
            pings.clone(),
        ));
        tokio::spawn(monitor_exit(
            id.clone(),
            child,
            kill_rx,
            pending.clone(),
            alive.clone(),
            exited_tx,
        ));

        Self {
            id,
            pid,
            writer: tokio::sync::Mutex::new(MessageWriter::new(stdin)),
            pending,
            pings,
            alive,
            draining: AtomicBool::new(false),
            exited,
            kill: Mutex::new(Some(kill_tx)),
            drain_grace_period,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Requests written to the child and not yet resolved
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Round-trip a ping and return the worker's own view of its status
    pub async fn ping(&self, timeout: Duration) -> Result<WorkerStatus, WorkerError> {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(correlation_id, tx);

        if let Err(e) = self.write(WorkerMessage::Ping { correlation_id }).await {
            self.pings.lock().remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(WorkerError::NotRunning(self.id.clone())),
            Err(_) => {
                self.pings.lock().remove(&correlation_id);
                Err(WorkerError::HealthCheckFailed(format!(
                    "worker {} did not answer a ping within {:?}",
                    self.id, timeout
                )))
            }
        }
    }

    async fn write(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|e| WorkerError::Transport(format!("worker {}: {}", self.id, e)))
    }

    fn signal_kill(&self) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }

    async fn wait_exited(&self) {
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|exited| *exited).await;
    }
}

impl fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("draining", &self.draining.load(Ordering::SeqCst))
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        request: RenderRequest,
        completion: Completion,
    ) -> Result<(), WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::NotRunning(self.id.clone()));
        }

        let correlation_id = request.correlation_id;
        let message = WorkerMessage::Render {
            correlation_id,
            payload: request.payload,
            max_memory_bytes: request.budget.as_bytes(),
        };

        // Checked under the writer lock so no job is written after `drain`
        let mut writer = self.writer.lock().await;
        if self.draining.load(Ordering::SeqCst) {
            return Err(WorkerError::NotRunning(format!("{} is draining", self.id)));
        }

        // Registered before the write so a fast reply always finds its entry
        self.pending.register(completion);
        if let Err(e) = writer.send(message).await {
            self.pending.remove(&correlation_id);
            return Err(WorkerError::Transport(format!("worker {}: {}", self.id, e)));
        }

        Ok(())
    }

    fn abandon(&self, correlation_id: &CorrelationId) {
        if self.pending.remove(correlation_id).is_some() {
            debug!("Worker {} abandoned request {}", self.id, correlation_id);
        }
    }

    async fn drain(&self) -> Result<(), WorkerError> {
        self.draining.store(true, Ordering::SeqCst);
        if !self.is_alive() {
            return Ok(());
        }
        debug!("Draining worker process {}", self.id);
        self.write(WorkerMessage::Drain).await
    }

    async fn terminate(&self) -> Result<(), WorkerError> {
        if !self.is_alive() {
            return Ok(());
        }

        if self.draining.load(Ordering::SeqCst) {
            let grace = self.drain_grace_period;
            if tokio::time::timeout(grace, self.wait_exited()).await.is_ok() {
                debug!("Worker process {} exited after draining", self.id);
                return Ok(());
            }
            warn!(
                "Worker process {} still running {:?} after drain, killing it",
                self.id, grace
            );
        } else {
            let _ = self.write(WorkerMessage::Shutdown).await;
        }

        self.signal_kill();
        self.wait_exited().await;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), WorkerError> {
        if !self.is_alive() {
            return Err(WorkerError::NotRunning(self.id.clone()));
        }
        let status = self.ping(Duration::from_secs(5)).await?;
        debug!(
            "Worker {} healthy: {} rendered, {} in flight",
            status.worker_id, status.jobs_rendered, status.jobs_in_flight
        );
        Ok(())
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.signal_kill();
    }
}

/// Resolve replies read from the child's stdout
async fn read_replies(
    worker_id: String,
    mut reader: MessageReader<ChildStdout>,
    pending: PendingRequests,
    pings: PendingPings,
) {
    loop {
        match reader.receive::<CoordinatorMessage>().await {
            Ok(envelope) => match envelope.message {
                CoordinatorMessage::RenderResult {
                    correlation_id,
                    response,
                    kill,
                    memory_usage_bytes,
                } => {
                    let outcome = WorkerOutcome::Reply {
                        response,
                        memory_exceeded: kill,
                    };
                    if !pending.resolve(&correlation_id, outcome) {
                        debug!(
                            "Worker {} replied to {} after it was settled ({} bytes in use)",
                            worker_id, correlation_id, memory_usage_bytes
                        );
                    }
                }
                CoordinatorMessage::Error {
                    correlation_id: Some(correlation_id),
                    error,
                } => {
                    pending.resolve(&correlation_id, WorkerOutcome::Error(error.to_string()));
                }
                CoordinatorMessage::Error {
                    correlation_id: None,
                    error,
                } => warn!("Worker {} reported an error: {}", worker_id, error),
                CoordinatorMessage::Pong {
                    correlation_id,
                    status,
                } => {
                    if let Some(tx) = pings.lock().remove(&correlation_id) {
                        let _ = tx.send(status);
                    }
                }
                CoordinatorMessage::Ready { .. } => {
                    debug!("Worker {} repeated its ready message", worker_id)
                }
            },
            // Exit is reported by the monitor once the child is reaped
            Err(IpcError::ConnectionClosed) => break,
            Err(e) if e.is_malformed_message() => {
                warn!("Skipping malformed line from worker {}: {}", worker_id, e)
            }
            Err(e) => {
                let failed = pending.fail_all(WorkerOutcome::Error(format!(
                    "Transport error on worker {}: {}",
                    worker_id, e
                )));
                warn!(
                    "Lost the reply channel of worker {} ({} requests failed): {}",
                    worker_id, failed, e
                );
                break;
            }
        }
    }
    pings.lock().clear();
}

/// Wait for the child to exit, or kill it on request, then fail whatever
/// is still pending
async fn monitor_exit(
    worker_id: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    pending: PendingRequests,
    alive: Arc<AtomicBool>,
    exited: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // A dropped sender means the handle is gone, which also kills
        _ = kill => {
            if let Err(e) = child.start_kill() {
                debug!("Kill of worker {} failed: {}", worker_id, e);
            }
            child.wait().await
        }
    };
    alive.store(false, Ordering::SeqCst);

    let detail = match status {
        Ok(status) => describe_exit(&status),
        Err(e) => format!("exit status unavailable: {}", e),
    };
    let failed = pending.fail_all(WorkerOutcome::Exit(format!(
        "Worker {} terminated: {}",
        worker_id, detail
    )));
    if failed > 0 {
        warn!(
            "Worker process {} {} with {} requests in flight",
            worker_id, detail, failed
        );
    } else {
        debug!("Worker process {} {}", worker_id, detail);
    }

    exited.send_replace(true);
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was killed by signal {}", signal);
        }
    }

    "exited".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::Completion;
    use prerender_core::{MemoryBudget, RenderResult};
    use serde_json::json;

    const READY_LINE: &str = r#"{"protocol_version":1,"timestamp":"2024-01-01T00:00:00Z","message":{"type":"ready","worker_id":"w","pid":1}}"#;

    fn shell_factory(script: &str) -> ProcessWorkerFactory {
        let mut config = PoolConfig::process(1, "sh");
        config.worker.args = vec!["-c".to_string(), script.to_string()];
        config.startup_timeout = Duration::from_secs(5);
        config.drain_grace_period = Duration::from_millis(200);
        ProcessWorkerFactory::new(&config)
    }

    fn request() -> RenderRequest {
        RenderRequest {
            correlation_id: CorrelationId::new(),
            payload: json!({"url": "/"}),
            budget: MemoryBudget::default(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let mut config = PoolConfig::process(1, "/nonexistent/prerender-worker");
        config.startup_timeout = Duration::from_secs(1);
        let factory = ProcessWorkerFactory::new(&config);

        let err = factory.spawn("worker-0-0".to_string()).await.unwrap_err();
        assert!(matches!(err, WorkerError::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_before_ready_is_initialization_failure() {
        let factory = shell_factory("exit 3");

        let err = factory.spawn("worker-0-0".to_string()).await.unwrap_err();
        assert!(matches!(err, WorkerError::InitializationFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let mut config = PoolConfig::process(1, "sh");
        config.worker.args = vec!["-c".to_string(), "sleep 5".to_string()];
        config.startup_timeout = Duration::from_millis(100);
        let factory = ProcessWorkerFactory::new(&config);

        let err = factory.spawn("worker-0-0".to_string()).await.unwrap_err();
        assert!(matches!(err, WorkerError::StartupTimeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_fails_pending_request_with_exit() {
        let factory = shell_factory(&format!("echo '{}'; read line; exit 1", READY_LINE));
        let worker = factory.spawn("worker-0-0".to_string()).await.unwrap();
        assert!(worker.is_alive());

        let request = request();
        let (completion, receiver) = Completion::new(request.correlation_id);
        worker.send(request, completion).await.unwrap();

        match receiver.outcome().await {
            WorkerOutcome::Exit(detail) => assert!(detail.contains("exited with code 1")),
            other => panic!("Expected exit outcome, got {:?}", other),
        }
        worker.wait_exited().await;
        assert!(!worker.is_alive());
        assert_eq!(worker.pending_requests(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_debug_output_names_worker() {
        let factory = shell_factory(&format!("echo '{}'; sleep 30", READY_LINE));
        let worker = factory.spawn("worker-0-0".to_string()).await.unwrap();

        let rendered = format!("{:?}", worker);
        assert!(rendered.starts_with("ProcessWorker"));
        assert!(rendered.contains("worker-0-0"));
        assert!(rendered.contains("alive: true"));

        worker.terminate().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_unresponsive_worker() {
        let factory = shell_factory(&format!("echo '{}'; sleep 30", READY_LINE));
        let worker = factory.spawn("worker-0-0".to_string()).await.unwrap();

        worker.terminate().await.unwrap();
        assert!(!worker.is_alive());

        let request = request();
        let (completion, _receiver) = Completion::new(request.correlation_id);
        let err = worker.send(request, completion).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotRunning(_)));
    }

    #[test]
    fn test_render_result_envelope_shape() {
        // Keep the reply the reader expects in sync with the worker side
        let message = CoordinatorMessage::RenderResult {
            correlation_id: CorrelationId::new(),
            response: RenderResult::ok("<html></html>"),
            kill: true,
            memory_usage_bytes: 1024,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "render_result");
        assert_eq!(value["kill"], true);
    }
}

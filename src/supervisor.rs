//! Sidecar supervisor - owns the worker process lifecycle and the
//! pending-request table.
//!
//! One actor task owns the child handle and every piece of mutable state;
//! all events (send, ack, response, timeout, exit, stop) are serialized
//! through a single command channel. The public [`Supervisor`] handle is a
//! cheap clone in front of that channel.
//!
//! Flow:
//! 1. Spawn worker via the configured spawner
//! 2. Bounded readiness probe (health checks until one succeeds)
//! 3. Deliver the secret in a configure request, if any
//! 4. Correlated request/response traffic, acks routed to notifiers
//! 5. On exit (any cause): fail all in-flight requests, clear the table

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{EVENT_PROCESSING_STARTED, RequestId, WorkerMessage, WorkerRequest};
use crate::spawn::{SpawnError, SpawnOptions, SpawnedWorker, WorkerMode, WorkerSpawner};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Caller must start the worker before retrying.
    #[error("worker process not running")]
    ProcessNotRunning,

    /// Worker alive but the readiness probe has not succeeded.
    #[error("worker is not ready")]
    NotReady,

    /// One in-flight request exceeded its caller-specified window.
    /// Terminal for that request only; the process is left alone.
    #[error("request timed out after {0}ms")]
    RequestTimeout(u64),

    /// Uniform failure applied to every in-flight request on exit.
    #[error("worker process exited")]
    ProcessExited,

    #[error("worker failed readiness probe within {0:?}")]
    StartTimeout(Duration),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The worker answered with success=false.
    #[error("{0}")]
    Worker(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Per-attempt bound on a single readiness health check.
    pub probe_attempt_timeout: Duration,
    /// Pause between readiness probe attempts.
    pub probe_interval: Duration,
    /// Overall deadline for the readiness probe.
    pub probe_deadline: Duration,
    /// Bound on the post-probe configure (secret delivery) request.
    pub configure_timeout: Duration,
    /// Grace window between the shutdown line and a forced kill.
    pub shutdown_grace: Duration,
    /// Settle delay between stop and respawn, avoiding a race with OS
    /// teardown of the previous process.
    pub restart_settle: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_attempt_timeout: Duration::from_secs(1),
            probe_interval: Duration::from_millis(500),
            probe_deadline: Duration::from_secs(10),
            configure_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            restart_settle: Duration::from_secs(1),
        }
    }
}

impl SupervisorConfig {
    pub fn with_probe_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.probe_attempt_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_deadline(mut self, deadline: Duration) -> Self {
        self.probe_deadline = deadline;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }
}

enum Command {
    Spawn {
        mode: WorkerMode,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Send {
        request: WorkerRequest,
        timeout: Duration,
        started: Option<oneshot::Sender<()>>,
        reply: oneshot::Sender<Result<serde_json::Value, SupervisorError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Line {
        epoch: u64,
        value: serde_json::Value,
    },
    Exited {
        epoch: u64,
    },
    RequestTimedOut {
        id: RequestId,
        timeout_ms: u64,
    },
    ForceKill {
        epoch: u64,
    },
}

/// An outstanding correlated request. Removed on final response, timeout,
/// or process exit - never left unresolved.
struct PendingRequest {
    reply: oneshot::Sender<Result<serde_json::Value, SupervisorError>>,
    /// Fired at most once, on the processing_started ack.
    started: Option<oneshot::Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn settle(mut self, result: Result<serde_json::Value, SupervisorError>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.reply.send(result);
    }
}

type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonLinesCodec>;

struct ChildState {
    epoch: u64,
    writer: Writer,
    /// Trigger for the process-tree kill; absent for in-process test workers.
    kill_tx: Option<oneshot::Sender<()>>,
}

struct TerminatingChild {
    epoch: u64,
    /// Held until exit or forced kill so the shutdown line stays deliverable
    /// and, for pipe-backed workers, dropping it signals EOF.
    _writer: Writer,
    /// Fires the process-tree kill after the grace window. Aborted if the
    /// worker's own exit arrives first.
    kill_timer: JoinHandle<()>,
}

/// Handle to the supervisor actor. Cloneable; all clones address the same
/// worker.
#[derive(Clone)]
pub struct Supervisor {
    cmd_tx: mpsc::Sender<Command>,
    running: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: SupervisorConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let running = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(AtomicBool::new(false));

        let actor = Actor {
            rx: cmd_rx,
            // Weak: the actor must not keep its own channel alive, or it
            // would never observe the last handle being dropped.
            tx: cmd_tx.downgrade(),
            spawner,
            config: config.clone(),
            running: Arc::clone(&running),
            ready: Arc::clone(&ready),
            child: None,
            terminating: Vec::new(),
            pending: HashMap::new(),
            epoch: 0,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            running,
            ready,
            config,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Start the worker and wait for it to become ready. No-op if already
    /// running.
    ///
    /// The readiness probe bounds the caller-visible wait: health checks are
    /// issued at a fixed interval, each with a short per-attempt timeout,
    /// until one succeeds or the overall deadline elapses. The secret, if
    /// any, is delivered in a configure request once the worker answers.
    pub async fn start(
        &self,
        mode: WorkerMode,
        secret: Option<&str>,
    ) -> Result<(), SupervisorError> {
        if self.is_running() {
            tracing::debug!("worker already running");
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Spawn {
                mode,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SupervisorError::Protocol("supervisor task stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SupervisorError::Protocol("supervisor task stopped".to_string()))??;

        let deadline = tokio::time::Instant::now() + self.config.probe_deadline;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self
                .send(
                    WorkerRequest::HealthCheck,
                    self.config.probe_attempt_timeout,
                    None,
                )
                .await
            {
                Ok(_) => {
                    tracing::debug!(attempt, "readiness probe succeeded");
                    break;
                }
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    tracing::error!(attempt, error = %e, "readiness probe deadline elapsed");
                    self.stop().await;
                    return Err(SupervisorError::StartTimeout(self.config.probe_deadline));
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "readiness probe attempt failed");
                    tokio::time::sleep(self.config.probe_interval).await;
                }
            }
        }

        if let Some(key) = secret {
            if let Err(e) = self
                .send(
                    WorkerRequest::Configure {
                        api_key: key.to_string(),
                    },
                    self.config.configure_timeout,
                    None,
                )
                .await
            {
                tracing::error!(error = %e, "worker rejected configure");
                self.stop().await;
                return Err(e);
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(%mode, "worker ready");
        Ok(())
    }

    /// Send a correlated request and wait for its final response.
    ///
    /// A zero `timeout` disables the per-request timer: the caller manages
    /// timing externally (used for extraction, whose real duration is
    /// unknown until the worker acks). On timer fire only the logical
    /// request fails; the process is left running.
    pub async fn send(
        &self,
        request: WorkerRequest,
        timeout: Duration,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<serde_json::Value, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                request,
                timeout,
                started,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SupervisorError::ProcessNotRunning)?;
        reply_rx.await.map_err(|_| SupervisorError::ProcessExited)?
    }

    /// Run an extraction. Fails fast, without touching the worker, unless
    /// the readiness probe has succeeded.
    ///
    /// `started` fires (at most once) when the worker acks that processing
    /// has begun - the anchor for the work queue's own timeout clock.
    pub async fn extract(
        &self,
        file_path: &str,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<serde_json::Value, SupervisorError> {
        if !self.is_ready() {
            return Err(SupervisorError::NotReady);
        }
        self.send(
            WorkerRequest::Extract {
                file_path: file_path.to_string(),
            },
            Duration::ZERO,
            started,
        )
        .await
    }

    /// Graceful-then-forced shutdown. No-op if not running.
    ///
    /// Writes a best-effort shutdown line and arms a forced-kill timer that
    /// terminates the whole process tree if the worker has not exited by
    /// then. Returns once the shutdown is initiated, not once the process is
    /// gone.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Stop { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Stop, wait for a fixed settle delay, then start with the new mode.
    pub async fn restart_with_mode(
        &self,
        mode: WorkerMode,
        secret: Option<&str>,
    ) -> Result<(), SupervisorError> {
        tracing::info!(%mode, "restarting worker");
        self.stop().await;
        tokio::time::sleep(self.config.restart_settle).await;
        self.start(mode, secret).await
    }
}

struct Actor {
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
    spawner: Arc<dyn WorkerSpawner>,
    config: SupervisorConfig,
    running: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    child: Option<ChildState>,
    terminating: Vec<TerminatingChild>,
    pending: HashMap<RequestId, PendingRequest>,
    epoch: u64,
}

impl Actor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Spawn { mode, reply } => {
                    let result = self.handle_spawn(mode);
                    let _ = reply.send(result);
                }
                Command::Send {
                    request,
                    timeout,
                    started,
                    reply,
                } => {
                    self.handle_send(request, timeout, started, reply).await;
                }
                Command::Stop { reply } => {
                    self.handle_stop().await;
                    let _ = reply.send(());
                }
                Command::Line { epoch, value } => {
                    self.handle_line(epoch, value);
                }
                Command::Exited { epoch } => {
                    self.handle_exited(epoch);
                }
                Command::RequestTimedOut { id, timeout_ms } => {
                    if let Some(pending) = self.pending.remove(&id) {
                        tracing::warn!(%id, timeout_ms, "request timed out");
                        pending.settle(Err(SupervisorError::RequestTimeout(timeout_ms)));
                    }
                }
                Command::ForceKill { epoch } => {
                    self.handle_force_kill(epoch);
                }
            }
        }

        // All handles dropped: tear the worker down before exiting. The
        // detached kill timers outlive the actor, so a hung worker is still
        // reaped after the grace window.
        self.handle_stop().await;
        tracing::debug!("supervisor actor exiting");
    }

    fn handle_spawn(&mut self, mode: WorkerMode) -> Result<(), SupervisorError> {
        if self.child.is_some() {
            tracing::debug!("spawn requested but worker already running");
            return Ok(());
        }

        let Some(tx) = self.tx.upgrade() else {
            return Err(SupervisorError::Protocol(
                "supervisor shutting down".to_string(),
            ));
        };

        self.epoch += 1;
        let epoch = self.epoch;

        let SpawnedWorker {
            stdin,
            stdout,
            child,
        } = self.spawner.spawn(&SpawnOptions { mode })?;

        let writer = FramedWrite::new(stdin, JsonLinesCodec::new());

        let mut reader = FramedRead::new(stdout, JsonLinesCodec::new());
        let reader_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(value)) => {
                        if reader_tx.send(Command::Line { epoch, value }).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "worker stdout read error");
                        break;
                    }
                    None => break,
                }
            }
            let _ = reader_tx.send(Command::Exited { epoch }).await;
        });

        let kill_tx = child.map(|c| watch_child(c, epoch, tx));

        self.child = Some(ChildState {
            epoch,
            writer,
            kill_tx,
        });
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_send(
        &mut self,
        request: WorkerRequest,
        timeout: Duration,
        started: Option<oneshot::Sender<()>>,
        reply: oneshot::Sender<Result<serde_json::Value, SupervisorError>>,
    ) {
        let Some(child) = self.child.as_mut() else {
            let _ = reply.send(Err(SupervisorError::ProcessNotRunning));
            return;
        };

        let id = RequestId::new();
        let mut value = match serde_json::to_value(&request) {
            Ok(v) => v,
            Err(e) => {
                let _ = reply.send(Err(SupervisorError::Protocol(format!(
                    "failed to serialize request: {e}"
                ))));
                return;
            }
        };
        value["id"] = serde_json::Value::String(id.to_string());

        if let Err(e) = child.writer.send(value).await {
            let _ = reply.send(Err(SupervisorError::Protocol(format!(
                "failed to write request: {e}"
            ))));
            return;
        }

        let timer = if timeout > Duration::ZERO {
            let tx = self.tx.clone();
            let timeout_ms = timeout.as_millis() as u64;
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Command::RequestTimedOut { id, timeout_ms }).await;
                }
            }))
        } else {
            None
        };

        tracing::debug!(%id, timeout_ms = timeout.as_millis() as u64, "request dispatched");
        self.pending.insert(
            id,
            PendingRequest {
                reply,
                started,
                timer,
            },
        );
    }

    async fn handle_stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);

        tracing::info!("stopping worker");

        // Stop destroys the sidecar handle: nothing in flight can complete.
        self.fail_all_pending();

        // Best-effort; a dead pipe here is not an error.
        if let Ok(value) = serde_json::to_value(WorkerRequest::Shutdown) {
            let _ = child.writer.send(value).await;
        }

        let epoch = child.epoch;
        let grace = self.config.shutdown_grace;
        let tx = self.tx.clone();
        let kill_tx = child.kill_tx.take();
        // The kill itself is fired from the timer task directly, so a hung
        // worker is reaped even if the actor is gone by then. The ForceKill
        // command only releases the terminating entry.
        let kill_timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            tracing::warn!("worker did not exit within grace window, force killing");
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::ForceKill { epoch }).await;
            }
        });

        self.terminating.push(TerminatingChild {
            epoch,
            _writer: child.writer,
            kill_timer,
        });
    }

    fn handle_line(&mut self, epoch: u64, value: serde_json::Value) {
        if self.child.as_ref().map(|c| c.epoch) != Some(epoch) {
            tracing::debug!("dropping line from stale worker generation");
            return;
        }

        match WorkerMessage::classify(value) {
            WorkerMessage::Status { status } => {
                tracing::info!(%status, "worker status");
            }
            WorkerMessage::Ack { id, event } => match self.pending.get_mut(&id) {
                Some(pending) => {
                    if event == EVENT_PROCESSING_STARTED {
                        if let Some(started) = pending.started.take() {
                            tracing::debug!(%id, "processing started");
                            let _ = started.send(());
                        }
                    } else {
                        tracing::debug!(%id, %event, "unhandled ack event");
                    }
                }
                None => {
                    tracing::warn!(%id, %event, "ack for unknown request");
                }
            },
            WorkerMessage::Response {
                id,
                success,
                data,
                error,
            } => match self.pending.remove(&id) {
                Some(pending) => {
                    if success {
                        pending.settle(Ok(data.unwrap_or(serde_json::Value::Null)));
                    } else {
                        pending.settle(Err(SupervisorError::Worker(
                            error.unwrap_or_else(|| "Unknown error".to_string()),
                        )));
                    }
                }
                None => {
                    // Late or duplicate response; the request was already
                    // settled by a timeout or exit. Dropped by design.
                    tracing::warn!(%id, "response for unknown request, dropping");
                }
            },
            WorkerMessage::Unrecognized(value) => {
                tracing::warn!(%value, "unrecognized message from worker");
            }
        }
    }

    fn handle_exited(&mut self, epoch: u64) {
        if self.child.as_ref().map(|c| c.epoch) == Some(epoch) {
            tracing::warn!("worker exited");
            self.child = None;
            self.running.store(false, Ordering::SeqCst);
            self.ready.store(false, Ordering::SeqCst);
            self.fail_all_pending();
            return;
        }

        // An expected exit of a stopping worker: disarm its forced kill.
        if let Some(idx) = self.terminating.iter().position(|t| t.epoch == epoch) {
            let t = self.terminating.swap_remove(idx);
            t.kill_timer.abort();
            tracing::debug!("stopping worker exited within grace window");
        }
    }

    fn handle_force_kill(&mut self, epoch: u64) {
        // Dropping the entry closes the worker's stdin, which is the kill
        // signal for in-process test workers; OS children were already
        // signalled from the timer task.
        if let Some(idx) = self.terminating.iter().position(|t| t.epoch == epoch) {
            self.terminating.swap_remove(idx);
        }
    }

    fn fail_all_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::warn!(
            count = self.pending.len(),
            "failing all in-flight requests"
        );
        for (_, pending) in self.pending.drain() {
            pending.settle(Err(SupervisorError::ProcessExited));
        }
    }
}

/// Own the OS child: reap it on exit, kill the whole process tree on
/// request. Returns the kill trigger.
fn watch_child(mut child: Child, epoch: u64, tx: mpsc::Sender<Command>) -> oneshot::Sender<()> {
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let pid = child.id();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                tracing::info!(?status, "worker process exited");
            }
            res = &mut kill_rx => {
                if res.is_ok() {
                    tracing::warn!(?pid, "killing worker process tree");
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    let _ = child.start_kill();
                }
                let status = child.wait().await;
                tracing::info!(?status, "worker process exited");
            }
        }
        let _ = tx.send(Command::Exited { epoch }).await;
    });
    kill_tx
}

/// The worker may spawn subprocesses of its own; it was placed in a fresh
/// process group at spawn time so one signal reaches all of them.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!(pid, error = %e, "failed to kill worker process group");
    }
}

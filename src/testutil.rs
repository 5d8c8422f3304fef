//! Test doubles for the worker process.
//!
//! [`DuplexSpawner`] plugs into the [`WorkerSpawner`] seam and hands each
//! spawned worker's far ends to the test, which scripts the protocol over
//! in-memory pipes. Dropping a [`WorkerEnd`] closes both pipes, which the
//! supervisor observes exactly like a worker crash.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::spawn::{SpawnError, SpawnOptions, SpawnedWorker, WorkerMode, WorkerSpawner};
use crate::supervisor::Supervisor;

/// The worker-side ends of a spawned duplex pair.
pub struct WorkerEnd {
    /// Carries requests from the supervisor (its stdin pipe).
    requests: Framed<DuplexStream, LinesCodec>,
    /// Carries our responses back (its stdout pipe).
    responses: Framed<DuplexStream, LinesCodec>,
}

impl WorkerEnd {
    /// Next request line from the supervisor, parsed as JSON.
    pub async fn next_request(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.requests.next().await? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return serde_json::from_str(&line).ok(),
                Err(_) => return None,
            }
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        let _ = self.responses.send(line.to_string()).await;
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        let _ = self.responses.send(value.to_string()).await;
    }

    pub async fn status(&mut self, status: &str) {
        self.send_json(serde_json::json!({"status": status})).await;
    }

    pub async fn ack(&mut self, request: &serde_json::Value, event: &str) {
        self.send_json(serde_json::json!({
            "type": "ack",
            "id": request["id"],
            "event": event,
        }))
        .await;
    }

    pub async fn respond_ok(&mut self, request: &serde_json::Value, data: serde_json::Value) {
        self.send_json(serde_json::json!({
            "id": request["id"],
            "success": true,
            "data": data,
        }))
        .await;
    }

    pub async fn respond_err(&mut self, request: &serde_json::Value, error: &str) {
        self.send_json(serde_json::json!({
            "id": request["id"],
            "success": false,
            "error": error,
        }))
        .await;
    }
}

/// Spawner producing in-memory workers. Each spawn delivers a [`WorkerEnd`]
/// on the channel returned by [`DuplexSpawner::new`].
pub struct DuplexSpawner {
    workers_tx: mpsc::UnboundedSender<WorkerEnd>,
    spawns: AtomicUsize,
    modes: Mutex<Vec<WorkerMode>>,
}

impl DuplexSpawner {
    pub fn new() -> (
        std::sync::Arc<Self>,
        mpsc::UnboundedReceiver<WorkerEnd>,
    ) {
        let (workers_tx, workers_rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                workers_tx,
                spawns: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
            }),
            workers_rx,
        )
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<WorkerMode> {
        self.modes.lock().expect("modes lock").clone()
    }
}

impl WorkerSpawner for DuplexSpawner {
    fn spawn(&self, opts: &SpawnOptions) -> Result<SpawnedWorker, SpawnError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.modes.lock().expect("modes lock").push(opts.mode);

        let (stdin_parent, stdin_worker) = tokio::io::duplex(64 * 1024);
        let (stdout_parent, stdout_worker) = tokio::io::duplex(64 * 1024);

        let end = WorkerEnd {
            requests: Framed::new(stdin_worker, LinesCodec::new()),
            responses: Framed::new(stdout_worker, LinesCodec::new()),
        };
        self.workers_tx
            .send(end)
            .map_err(|_| SpawnError::Other("test dropped the worker channel".to_string()))?;

        Ok(SpawnedWorker {
            stdin: Box::new(stdin_parent),
            stdout: Box::new(stdout_parent),
            child: None,
        })
    }
}

/// Install a test-writer tracing subscriber, once per process. Controlled
/// by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start the supervisor and play a worker that answers the first health
/// probe, returning the ready worker end.
pub async fn start_ready(
    supervisor: &Supervisor,
    workers: &mut mpsc::UnboundedReceiver<WorkerEnd>,
) -> WorkerEnd {
    init_tracing();
    let start = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start(WorkerMode::Local, None).await })
    };

    let mut worker = workers.recv().await.expect("worker spawned");
    let probe = worker.next_request().await.expect("health probe");
    assert_eq!(probe["action"], "health_check");
    worker
        .respond_ok(&probe, serde_json::json!({"status": "healthy"}))
        .await;

    start.await.expect("start task").expect("start succeeds");
    worker
}

//! Durable single-consumer work queue.
//!
//! Jobs are persisted on enqueue and drained one at a time against the
//! sidecar worker. There is no busy flag to race on: the drain task is the
//! single consumer, fed by a coalescing nudge channel, so two concurrent
//! enqueues can never claim two jobs.
//!
//! The per-job timeout is anchored to the worker's processing_started ack,
//! not to submission: a job that waited in the queue still gets its full
//! window once real work begins.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::store::{JobStatus, JobStore, JobUpdate, NewJob, QueueItem, StoreError};
use crate::supervisor::Supervisor;

/// Failure text persisted when a job exceeds its processing window.
const JOB_TIMEOUT_MESSAGE: &str =
    "Extraction timed out. The extraction worker may be overloaded - try again.";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Window per job, measured from the worker's processing_started ack.
    pub job_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(120),
        }
    }
}

impl QueueConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Transient status notification for an observer. Best-effort: never
/// persisted, and a missing or dead observer is silently tolerated.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl StatusUpdate {
    fn new(id: &str, status: JobStatus) -> Self {
        Self {
            id: id.to_string(),
            status,
            data: None,
            error: None,
            parse_confidence: None,
            project_id: None,
            file_name: None,
            file_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle to the work queue. Cloneable; all clones feed the same drain
/// task.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn JobStore>,
    drain_tx: mpsc::Sender<()>,
    in_flight: Arc<AtomicBool>,
    observer: Option<mpsc::UnboundedSender<StatusUpdate>>,
}

impl WorkQueue {
    /// Run crash recovery, then start the drain task.
    ///
    /// Jobs left at `processing` by an unclean shutdown are requeued before
    /// any enqueue or drain is observable, and drained without waiting for
    /// the next enqueue.
    pub async fn start(
        store: Arc<dyn JobStore>,
        supervisor: Supervisor,
        config: QueueConfig,
        observer: Option<mpsc::UnboundedSender<StatusUpdate>>,
    ) -> Result<Self, QueueError> {
        let reset = store.reset_stuck_processing_jobs().await?;
        if reset > 0 {
            tracing::info!(count = reset, "requeued jobs left in processing by a previous run");
        }

        let (drain_tx, drain_rx) = mpsc::channel(1);
        let in_flight = Arc::new(AtomicBool::new(false));

        let drain = DrainLoop {
            rx: drain_rx,
            store: Arc::clone(&store),
            supervisor,
            job_timeout: config.job_timeout,
            observer: observer.clone(),
            in_flight: Arc::clone(&in_flight),
        };
        tokio::spawn(drain.run());

        let queue = Self {
            store,
            drain_tx,
            in_flight,
            observer,
        };
        queue.nudge();
        Ok(queue)
    }

    /// Persist a job as queued and trigger a drain attempt. Returns the
    /// generated id without waiting for processing.
    pub async fn enqueue(&self, job: NewJob) -> Result<String, QueueError> {
        let id = self.store.insert_queued_job(job.clone()).await?;
        tracing::info!(%id, file_name = %job.file_name, "job enqueued");

        self.notify(StatusUpdate {
            project_id: job.project_id,
            file_name: Some(job.file_name),
            file_path: Some(job.file_path),
            ..StatusUpdate::new(&id, JobStatus::Queued)
        });

        self.nudge();
        Ok(id)
    }

    /// Whether a job is currently in flight against the worker.
    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Coalescing wake-up: a full channel means a drain attempt is already
    /// pending, which is exactly the re-entrancy guard the single-in-flight
    /// invariant needs.
    fn nudge(&self) {
        let _ = self.drain_tx.try_send(());
    }

    fn notify(&self, update: StatusUpdate) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(update);
        }
    }
}

struct DrainLoop {
    rx: mpsc::Receiver<()>,
    store: Arc<dyn JobStore>,
    supervisor: Supervisor,
    job_timeout: Duration,
    observer: Option<mpsc::UnboundedSender<StatusUpdate>>,
    in_flight: Arc<AtomicBool>,
}

impl DrainLoop {
    async fn run(mut self) {
        while self.rx.recv().await.is_some() {
            loop {
                let job = match self.store.next_queued_job().await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to fetch next queued job");
                        break;
                    }
                };
                self.in_flight.store(true, Ordering::SeqCst);
                let result = self.process(job).await;
                self.in_flight.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    // The job is still queued; retrying in a tight loop
                    // would spin against a broken store. Park until the
                    // next wake-up.
                    tracing::error!(error = %e, "store failure interrupted the drain");
                    break;
                }
            }
        }
        tracing::debug!("drain loop exiting");
    }

    async fn process(&self, job: QueueItem) -> Result<(), StoreError> {
        let id = job.id.clone();
        tracing::info!(%id, file_path = %job.file_path, "processing job");

        self.store
            .update_job_status(&id, JobStatus::Processing, JobUpdate::none())
            .await?;
        self.notify(StatusUpdate {
            project_id: job.project_id.clone(),
            ..StatusUpdate::new(&id, JobStatus::Processing)
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        let extract = self.supervisor.extract(&job.file_path, Some(ack_tx));
        tokio::pin!(extract);
        let mut ack_rx = ack_rx;

        // Armed only when the ack arrives; parked far in the future until
        // then.
        let timeout = tokio::time::sleep(Duration::from_secs(365 * 24 * 3600));
        tokio::pin!(timeout);

        let mut started = false;
        let mut timed_out = false;

        loop {
            tokio::select! {
                result = &mut extract => {
                    if timed_out {
                        // The job was already failed by the timeout; the
                        // late outcome is dropped, never reapplied.
                        match result {
                            Ok(_) => tracing::warn!(%id, "late result after job timeout, discarding"),
                            Err(e) => tracing::debug!(%id, error = %e, "in-flight call settled after job timeout"),
                        }
                    } else {
                        match result {
                            Ok(data) => self.complete(&job, data).await,
                            Err(e) => self.fail(&job, e.to_string()).await,
                        }
                    }
                    break;
                }

                ack = &mut ack_rx, if !started => {
                    started = true;
                    if ack.is_ok() {
                        tracing::debug!(
                            %id,
                            timeout_ms = self.job_timeout.as_millis() as u64,
                            "worker confirmed processing started, timeout clock armed"
                        );
                        if let Err(e) = self
                            .store
                            .update_job_status(
                                &id,
                                JobStatus::Processing,
                                JobUpdate::started(Utc::now()),
                            )
                            .await
                        {
                            tracing::error!(%id, error = %e, "failed to record processing start");
                        }
                        timeout.as_mut().reset(tokio::time::Instant::now() + self.job_timeout);
                    }
                    // Sender dropped without firing: the call is settling on
                    // its own, nothing to arm.
                }

                _ = &mut timeout, if started && !timed_out => {
                    timed_out = true;
                    tracing::warn!(%id, "job exceeded its processing window");
                    self.fail(&job, JOB_TIMEOUT_MESSAGE.to_string()).await;
                    // Keep waiting: there is only one worker slot, so the
                    // next job cannot start until this call settles anyway.
                }
            }
        }

        Ok(())
    }

    async fn complete(&self, job: &QueueItem, data: serde_json::Value) {
        let parse_confidence = data.get("parse_confidence").and_then(|v| v.as_f64());

        if let Err(e) = self.store.complete_job(&job.id, data.clone()).await {
            tracing::error!(id = %job.id, error = %e, "failed to persist completed job");
        }
        tracing::info!(id = %job.id, ?parse_confidence, "job completed");

        self.notify(StatusUpdate {
            data: Some(data),
            parse_confidence,
            project_id: job.project_id.clone(),
            ..StatusUpdate::new(&job.id, JobStatus::Completed)
        });
    }

    async fn fail(&self, job: &QueueItem, error: String) {
        if let Err(e) = self
            .store
            .update_job_status(&job.id, JobStatus::Failed, JobUpdate::error(error.clone()))
            .await
        {
            tracing::error!(id = %job.id, error = %e, "failed to persist failed job");
        }
        tracing::warn!(id = %job.id, %error, "job failed");

        self.notify(StatusUpdate {
            error: Some(error),
            project_id: job.project_id.clone(),
            ..StatusUpdate::new(&job.id, JobStatus::Failed)
        });
    }

    fn notify(&self, update: StatusUpdate) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(update);
        }
    }
}

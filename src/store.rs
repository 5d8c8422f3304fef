//! Persistence seam for the work queue.
//!
//! The queue is the only writer of job rows; the store is the single source
//! of truth for queue contents. The schema and query implementation live
//! behind [`JobStore`]; [`MemoryStore`] is the reference implementation used
//! by tests and embedders that do not need durability across restarts.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A persisted extraction job. Created on enqueue, mutated only by the work
/// queue, never deleted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub project_id: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set exactly once per processing attempt, when the worker's
    /// processing_started ack arrives. Cleared if the job is requeued by
    /// crash recovery.
    pub processing_started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// Input for [`JobStore::insert_queued_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub file_name: String,
    pub file_path: String,
    pub project_id: Option<String>,
}

/// Optional fields for [`JobStore::update_job_status`].
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            started_at: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence operations the queue relies on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with status `queued` and return its generated id.
    async fn insert_queued_job(&self, job: NewJob) -> Result<String, StoreError>;

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<(), StoreError>;

    /// Persist the extraction result and mark the job `completed`.
    async fn complete_job(&self, id: &str, result: serde_json::Value) -> Result<(), StoreError>;

    /// Oldest job with status `queued`, FIFO by insertion order.
    async fn next_queued_job(&self) -> Result<Option<QueueItem>, StoreError>;

    /// Requeue every job left at `processing` by an unclean shutdown.
    /// Returns how many were reset.
    async fn reset_stuck_processing_jobs(&self) -> Result<u64, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<QueueItem>, StoreError>;
}

struct StoredJob {
    seq: u64,
    item: QueueItem,
}

/// In-memory [`JobStore`] backed by a concurrent map, with an insertion
/// sequence to preserve FIFO order.
#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<String, StoredJob>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_queued_job(&self, job: NewJob) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem {
            id: id.clone(),
            file_path: job.file_path,
            file_name: job.file_name,
            project_id: job.project_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            processing_started_at: None,
            error_message: None,
            result: None,
        };
        self.jobs.insert(id.clone(), StoredJob { seq, item });
        Ok(id)
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.item.status = status;
        if let Some(at) = update.started_at {
            entry.item.processing_started_at = Some(at);
        }
        if let Some(error) = update.error {
            entry.item.error_message = Some(error);
        }
        Ok(())
    }

    async fn complete_job(&self, id: &str, result: serde_json::Value) -> Result<(), StoreError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.item.status = JobStatus::Completed;
        entry.item.result = Some(result);
        Ok(())
    }

    async fn next_queued_job(&self) -> Result<Option<QueueItem>, StoreError> {
        let mut oldest: Option<(u64, QueueItem)> = None;
        for entry in self.jobs.iter() {
            if entry.item.status != JobStatus::Queued {
                continue;
            }
            match &oldest {
                Some((seq, _)) if *seq <= entry.seq => {}
                _ => oldest = Some((entry.seq, entry.item.clone())),
            }
        }
        Ok(oldest.map(|(_, item)| item))
    }

    async fn reset_stuck_processing_jobs(&self) -> Result<u64, StoreError> {
        let mut count = 0;
        for mut entry in self.jobs.iter_mut() {
            if entry.item.status == JobStatus::Processing {
                entry.item.status = JobStatus::Queued;
                entry.item.processing_started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_job(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.jobs.get(id).map(|e| e.item.clone()))
    }
}

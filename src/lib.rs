//! Sidecar worker supervision and a durable extraction queue.
//!
//! `docqueue` manages a single long-lived worker process that speaks
//! newline-delimited JSON over stdin/stdout, and feeds it document
//! extraction jobs one at a time from a persistent FIFO queue.
//!
//! The [`supervisor::Supervisor`] owns the worker's lifecycle: spawn,
//! readiness probing, request/response correlation, graceful and forced
//! shutdown, and restart. The [`queue::WorkQueue`] sits on top of it and a
//! [`store::JobStore`], persisting every job before it runs and surviving
//! crashes by requeueing interrupted work at startup.

pub mod bridge;
pub mod queue;
pub mod spawn;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testutil;

pub use queue::{QueueConfig, QueueError, StatusUpdate, WorkQueue};
pub use spawn::{ExecSpawner, SpawnError, SpawnOptions, SpawnedWorker, WorkerMode, WorkerSpawner};
pub use store::{JobStatus, JobStore, JobUpdate, MemoryStore, NewJob, QueueItem, StoreError};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};

//! Worker process spawning.
//!
//! [`WorkerSpawner`] is the extension point for how the worker comes to
//! exist. [`ExecSpawner`] launches the packaged worker executable;
//! tests drive the protocol over in-memory pipes through the same seam.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};

use serde::{Deserialize, Serialize};

/// Operating mode handed to the worker through its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Local,
    Cloud,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Environment variable carrying the operating mode. Secrets are never
/// exported here; they travel over the wire in a configure request.
pub const WORKER_MODE_ENV: &str = "DOCQUEUE_WORKER_MODE";

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub mode: WorkerMode,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker {0} not captured")]
    Stdio(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// A freshly spawned worker: its stdio streams plus the OS child handle
/// when one exists. Test workers run in-process and have no child.
pub struct SpawnedWorker {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub child: Option<Child>,
}

// Manual impl: the boxed stream halves are opaque.
impl std::fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, opts: &SpawnOptions) -> Result<SpawnedWorker, SpawnError>;
}

/// Spawns the worker executable with piped stdio.
///
/// The child is placed in its own process group (unix) so a forced kill
/// reaches any subprocesses the worker spawned itself. Stderr is streamed
/// line-by-line into tracing diagnostics.
pub struct ExecSpawner {
    program: PathBuf,
}

impl ExecSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl WorkerSpawner for ExecSpawner {
    fn spawn(&self, opts: &SpawnOptions) -> Result<SpawnedWorker, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .env(WORKER_MODE_ENV, opts.mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;

        let stdin = child.stdin.take().ok_or(SpawnError::Stdio("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Stdio("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "docqueue::worker", "{}", line);
                }
            });
        }

        tracing::info!(
            program = %self.program.display(),
            mode = %opts.mode,
            pid = ?child.id(),
            "worker process spawned"
        );

        Ok(SpawnedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Some(child),
        })
    }
}

//! The capability interface shared by both execution engines.

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use ferry_protocol::{EngineKind, ErrorKind, FerryError, Task, TaskKind};

use crate::progress::ProgressCallback;

/// Result of the pre-flight check on a pending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    /// The destination already holds an identical-size copy.
    Skip,
    /// Run the task, writing to `dst`.
    Proceed {
        /// Destination after conflict naming (or the checkpoint's target).
        dst: String,
        bytes_total: Option<u64>,
        /// Fingerprint of the backing checkpoint, chunked tasks only.
        checkpoint: Option<String>,
    },
}

/// How an attempt that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Stopped at a boundary after a pause request.
    Paused,
    /// Stopped at a boundary after a cancel request.
    Canceled,
}

/// Failure of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Failed(#[from] FerryError),

    /// A chunked attempt ended with some chunks done; they are recorded in
    /// the checkpoint.
    #[error("{source} ({completed} of {total} bytes recorded)")]
    Partial {
        source: FerryError,
        completed: u64,
        total: u64,
    },
}

impl EngineError {
    pub fn error(&self) -> &FerryError {
        match self {
            Self::Failed(e) => e,
            Self::Partial { source, .. } => source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error().kind()
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial { .. })
    }
}

/// Signals and sinks handed to one execution attempt.
#[derive(Clone)]
pub struct AttemptContext {
    pub cancel: CancellationToken,
    pub pause: CancellationToken,
    pub progress: ProgressCallback,
}

impl AttemptContext {
    pub fn new(progress: ProgressCallback) -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
            progress,
        }
    }

    /// Returns the outcome to stop with if a stop was requested.
    ///
    /// Cancel wins over pause.
    pub fn interrupted(&self) -> Option<Outcome> {
        if self.cancel.is_cancelled() {
            Some(Outcome::Canceled)
        } else if self.pause.is_cancelled() {
            Some(Outcome::Paused)
        } else {
            None
        }
    }
}

/// Picks the engine for a task of `kind` moving `size` bytes.
///
/// Only transfers whose size is known and at least `threshold` use the
/// chunked engine.
pub fn select_engine(kind: TaskKind, size: Option<u64>, threshold: u64) -> EngineKind {
    match size {
        Some(size) if kind.is_transfer() && size >= threshold => EngineKind::Chunked,
        _ => EngineKind::Protocol,
    }
}

/// An execution engine selected per task by the scheduler.
pub trait TransferEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Validates paths and inspects the destination without writing anything.
    fn preflight<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<Preflight, FerryError>>;

    /// Runs one attempt of `task`.
    ///
    /// Stop requests in `ctx` are honoured at chunk or block boundaries.
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        ctx: AttemptContext,
    ) -> BoxFuture<'a, Result<Outcome, EngineError>>;
}

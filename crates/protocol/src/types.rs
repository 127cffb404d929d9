use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FerryError};

/// Unique task identifier (UUID v4 string).
pub type TaskId = String;

/// Generates a fresh task identifier.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "download")]
    Download,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "mkdir")]
    Mkdir,
    #[serde(rename = "rename")]
    Rename,
}

impl TaskKind {
    /// Returns `true` for kinds that move file bytes.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Upload | Self::Download)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
            Self::Mkdir => "mkdir",
            Self::Rename => "rename",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which engine executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "protocol")]
    Protocol,
    #[serde(rename = "chunked")]
    Chunked,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Protocol => "protocol",
            Self::Chunked => "chunked",
        })
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "skipped")]
    Skipped,
}

impl TaskStatus {
    /// Every status, in declaration order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Done,
        Self::Failed,
        Self::Canceled,
        Self::Skipped,
    ];

    /// `done`, `failed`, `canceled` and `skipped` admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Canceled | Self::Skipped
        )
    }

    /// Checks the transition table.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Pending, Skipped)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Canceled)
                | (Paused, Running)
                | (Paused, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One unit of scheduled work.
///
/// Owned and mutated by the scheduler only; observers receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub engine: EngineKind,
    /// Local path for uploads, remote path otherwise. Empty for `mkdir`.
    pub src: String,
    /// Remote path for uploads, local path for downloads. Empty for `delete`.
    pub dst: String,
    /// `None` until the size is known.
    pub bytes_total: Option<u64>,
    pub bytes_done: u64,
    pub status: TaskStatus,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Fingerprint of the checkpoint backing a chunked transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    /// Directory batch this task was expanded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
    /// Task that must reach `done` before this one may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<TaskId>,
    #[serde(default)]
    pub speed_bps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl Task {
    /// Creates a pending task with a fresh identifier.
    pub fn new(
        kind: TaskKind,
        engine: EngineKind,
        src: impl Into<String>,
        dst: impl Into<String>,
        bytes_total: Option<u64>,
    ) -> Self {
        Self {
            id: new_task_id(),
            kind,
            engine,
            src: src.into(),
            dst: dst.into(),
            bytes_total,
            bytes_done: 0,
            status: TaskStatus::Pending,
            retries: 0,
            error_kind: None,
            error_message: None,
            checkpoint: None,
            batch: None,
            depends_on: None,
            speed_bps: 0.0,
            eta_secs: None,
        }
    }

    /// Applies a transition from the table, or rejects it.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == TaskStatus::Done
            && let Some(total) = self.bytes_total
        {
            self.bytes_done = total;
        }
        if next != TaskStatus::Running {
            self.speed_bps = 0.0;
            self.eta_secs = None;
        }
        Ok(())
    }

    /// Marks the task failed with a classified error.
    pub fn fail(&mut self, error: &FerryError) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.message().to_string());
        Ok(())
    }

    /// Returns a running task to `pending` ahead of a retry attempt.
    ///
    /// This edge is reserved for the scheduler's retry path and is not part
    /// of the externally requestable table.
    pub fn requeue(&mut self, error: &FerryError) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.retries += 1;
        self.error_kind = Some(error.kind());
        self.error_message = Some(error.message().to_string());
        self.speed_bps = 0.0;
        self.eta_secs = None;
        Ok(())
    }

    /// Records transferred bytes. Never moves `bytes_done` backwards and never
    /// past a known `bytes_total`.
    pub fn record_progress(&mut self, bytes_done: u64) {
        let mut next = bytes_done.max(self.bytes_done);
        if let Some(total) = self.bytes_total {
            next = next.min(total);
        }
        self.bytes_done = next;
    }

    /// Progress as a percentage (0-100); 0 while the size is unknown.
    pub fn percentage(&self) -> f64 {
        match self.bytes_total {
            Some(0) if self.status == TaskStatus::Done => 100.0,
            Some(total) if total > 0 => self.bytes_done as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }
}

/// Type of a directory entry as reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "dir")]
    Directory,
    #[serde(rename = "symlink")]
    Symlink,
    #[serde(rename = "other")]
    Other,
}

impl EntryKind {
    /// Classifies a POSIX `st_mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => Self::File,
            0o040000 => Self::Directory,
            0o120000 => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// Attributes of one remote filesystem entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

//! Events, summaries and tunables of the scheduler.

use serde::{Deserialize, Serialize};

use ferry_protocol::{Task, TaskId, TaskStatus};
use ferry_transfer::DEFAULT_CHUNK_THRESHOLD;

use crate::retry::RetryPolicy;

/// Notification emitted by the scheduler.
///
/// Every variant carries an owned snapshot; observers never see live state.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A task changed state (or was admitted).
    TaskChanged(Task),
    /// Byte progress of a running task.
    Progress(Task),
    /// Every task of a directory batch reached a terminal state.
    BatchFinished(BatchSummary),
}

/// Per-status counts of one directory batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
    pub skipped: usize,
}

impl BatchSummary {
    pub fn tally(batch: &str, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        let mut summary = Self {
            batch: batch.to_string(),
            ..Self::default()
        };
        for status in statuses {
            summary.total += 1;
            match status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Paused => summary.paused += 1,
                TaskStatus::Done => summary.done += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Canceled => summary.canceled += 1,
                TaskStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// Returns `true` once no task of the batch can change any more.
    pub fn is_finished(&self) -> bool {
        self.pending + self.running + self.paused == 0
    }
}

/// What a directory submission admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTicket {
    pub batch: String,
    pub tasks: Vec<TaskId>,
    pub total_bytes: u64,
    /// Entries left out of the batch (symlinks, special files).
    pub rejected: Vec<String>,
}

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Protocol-engine tasks running at once.
    pub protocol_workers: usize,
    /// Chunked-engine tasks running at once.
    pub chunked_concurrency: usize,
    /// Transfers of at least this many bytes use the chunked engine.
    pub chunk_threshold: u64,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            protocol_workers: 4,
            chunked_concurrency: 1,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

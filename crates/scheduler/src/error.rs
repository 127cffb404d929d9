//! Scheduler error types.

use ferry_protocol::{FerryError, InvalidTransition, TaskId, TaskStatus};

/// Errors returned to callers of the [`Scheduler`](crate::Scheduler) handle.
///
/// Task failures are not reported here; they end up on the task itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("task {id} is {status}, not terminal")]
    NotTerminal { id: TaskId, status: TaskStatus },

    #[error("task {id} cannot be restarted from {status}")]
    NotRestartable { id: TaskId, status: TaskStatus },

    #[error("task {0} already has a control request in progress")]
    RequestPending(TaskId),

    #[error("request rejected: {0}")]
    Rejected(#[from] FerryError),

    #[error("scheduler stopped")]
    Stopped,
}

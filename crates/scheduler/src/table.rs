//! The task table: the only place task state is written.
//!
//! Every status change goes through [`TaskTable`], which applies the
//! transition, logs it, publishes a snapshot and keeps batch tallies current.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use ferry_protocol::{FerryError, Task, TaskId, TaskStatus};
use ferry_transfer::{AttemptContext, SpeedCalculator};

use crate::error::SchedulerError;
use crate::retry::RetryHistory;
use crate::types::{BatchSummary, SchedulerEvent};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

/// Which engine call an in-flight attempt is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Preflight,
    Execute,
}

pub(crate) struct Attempt {
    pub ctx: AttemptContext,
    pub phase: Phase,
}

/// Scheduler-side bookkeeping for one task.
pub(crate) struct Entry {
    pub task: Task,
    /// The single active engine call, if any.
    pub attempt: Option<Attempt>,
    /// Waiting out a retry delay.
    pub backoff: bool,
    /// Preflight already settled the destination.
    pub resolved: bool,
    pub history: RetryHistory,
    /// Pause or cancel acknowledged once the engine stops.
    pub stop_ack: Option<Reply<Task>>,
    /// Resume waiting for a free engine slot.
    pub resume_ack: Option<Reply<Task>>,
    pub speed: SpeedCalculator,
    pub started: Option<Instant>,
}

impl Entry {
    fn new(task: Task, resolved: bool) -> Self {
        Self {
            task,
            attempt: None,
            backoff: false,
            resolved,
            history: RetryHistory::default(),
            stop_ack: None,
            resume_ack: None,
            speed: SpeedCalculator::default(),
            started: None,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.attempt.is_some()
    }
}

pub(crate) struct TaskTable {
    entries: HashMap<TaskId, Entry>,
    /// Admission order, used for dispatch fairness.
    order: Vec<TaskId>,
    batches: HashMap<String, HashMap<TaskId, TaskStatus>>,
    finished_batches: HashSet<String>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl TaskTable {
    pub fn new(events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            batches: HashMap::new(),
            finished_batches: HashSet::new(),
            events,
        }
    }

    pub fn admit(&mut self, task: Task, resolved: bool) -> TaskId {
        let id = task.id.clone();
        info!(
            task = %id,
            kind = %task.kind,
            engine = %task.engine,
            src = %task.src,
            dst = %task.dst,
            "task admitted"
        );
        if let Some(batch) = &task.batch {
            self.batches
                .entry(batch.clone())
                .or_default()
                .insert(id.clone(), task.status);
        }
        self.emit(SchedulerEvent::TaskChanged(task.clone()));
        self.order.push(id.clone());
        self.entries.insert(id.clone(), Entry::new(task, resolved));
        id
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.get_mut(id)
    }

    pub fn entry(&self, id: &str) -> Result<&Entry, SchedulerError> {
        self.entries
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }

    /// Task ids in admission order.
    pub fn order(&self) -> &[TaskId] {
        &self.order
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.values_mut()
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Moves `id` to `next` following the state machine.
    pub fn transition(&mut self, id: &str, next: TaskStatus) -> Result<Task, SchedulerError> {
        self.apply(id, |task| Ok(task.transition(next)?))
    }

    /// Moves a running task to `failed`, recording the error.
    pub fn fail(&mut self, id: &str, error: &FerryError) -> Result<Task, SchedulerError> {
        self.apply(id, |task| Ok(task.fail(error)?))
    }

    /// Returns a running task to `pending` for a retry.
    pub fn requeue(&mut self, id: &str, error: &FerryError) -> Result<Task, SchedulerError> {
        self.apply(id, |task| Ok(task.requeue(error)?))
    }

    fn apply(
        &mut self,
        id: &str,
        change: impl FnOnce(&mut Task) -> Result<(), SchedulerError>,
    ) -> Result<Task, SchedulerError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))?;
        let from = entry.task.status;
        change(&mut entry.task)?;
        let task = &entry.task;
        if task.status == TaskStatus::Running && entry.started.is_none() {
            entry.started = Some(Instant::now());
        }
        if task.status != TaskStatus::Running {
            entry.speed.reset();
        }
        info!(
            task = %task.id,
            kind = %task.kind,
            engine = %task.engine,
            from = %from,
            to = %task.status,
            retries = task.retries,
            error_kind = ?task.error_kind,
            "task transition"
        );
        let snapshot = task.clone();
        self.emit(SchedulerEvent::TaskChanged(snapshot.clone()));
        self.track_batch(&snapshot);
        Ok(snapshot)
    }

    /// Records cumulative attempt progress for a running task.
    pub fn progress(&mut self, id: &str, bytes: u64) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.task.status != TaskStatus::Running {
            return;
        }
        let before = entry.task.bytes_done;
        entry.task.record_progress(bytes);
        let delta = entry.task.bytes_done - before;
        if delta == 0 {
            return;
        }
        entry.speed.add_sample(delta);
        entry.task.speed_bps = entry.speed.bytes_per_second();
        entry.task.eta_secs = entry
            .task
            .bytes_total
            .and_then(|total| entry.speed.eta(total.saturating_sub(entry.task.bytes_done)))
            .map(|eta| eta.as_secs_f64());
        let snapshot = entry.task.clone();
        self.emit(SchedulerEvent::Progress(snapshot));
    }

    /// Removes a terminal task from the active set.
    pub fn evict(&mut self, id: &str) -> Result<Task, SchedulerError> {
        let entry = self.entry(id)?;
        if !entry.task.status.is_terminal() {
            return Err(SchedulerError::NotTerminal {
                id: id.to_string(),
                status: entry.task.status,
            });
        }
        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))?;
        self.order.retain(|other| other != id);
        debug!(task = %id, "task evicted");
        Ok(entry.task)
    }

    pub fn summary(&self, batch: &str) -> Option<BatchSummary> {
        self.batches
            .get(batch)
            .map(|statuses| BatchSummary::tally(batch, statuses.values().copied()))
    }

    fn track_batch(&mut self, task: &Task) {
        let Some(batch) = &task.batch else {
            return;
        };
        let Some(statuses) = self.batches.get_mut(batch) else {
            return;
        };
        statuses.insert(task.id.clone(), task.status);
        let summary = BatchSummary::tally(batch, statuses.values().copied());
        if summary.is_finished() && self.finished_batches.insert(batch.clone()) {
            info!(
                batch = %batch,
                done = summary.done,
                failed = summary.failed,
                skipped = summary.skipped,
                canceled = summary.canceled,
                "batch finished"
            );
            self.emit(SchedulerEvent::BatchFinished(summary));
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

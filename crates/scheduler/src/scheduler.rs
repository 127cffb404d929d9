//! Scheduler actor and its handle.
//!
//! A single actor task owns the [`TaskTable`] and is the only writer of task
//! state. Callers talk to it through [`Scheduler`]; engine attempts run on
//! their own tasks and report back over a channel. Each task has at most one
//! attempt in flight.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use ferry_protocol::{
    EngineKind, ErrorKind, FerryError, InvalidTransition, RemoteSession, SandboxBoundary,
    SessionFactory, Task, TaskId, TaskKind, TaskStatus,
};
use ferry_transfer::{
    AttemptContext, CheckpointStore, ChunkedConfig, ChunkedEngine, EngineError, ExpansionPlan,
    Outcome, Preflight, ProtocolEngine, TransferEngine, ensure_dir_all, plan_download_tree,
    plan_upload_tree, select_engine,
};

use crate::advisor::{PresetAdvisor, TransferRecord};
use crate::error::SchedulerError;
use crate::retry::{RetryDecision, RetryReason};
use crate::table::{Attempt, Phase, Reply, TaskTable};
use crate::types::{BatchSummary, BatchTicket, SchedulerConfig, SchedulerEvent};

/// The two engines tasks are dispatched to.
#[derive(Clone)]
pub struct Engines {
    pub protocol: Arc<dyn TransferEngine>,
    pub chunked: Arc<dyn TransferEngine>,
}

impl Engines {
    /// Builds the standard protocol and chunked engines over `factory`.
    ///
    /// The chunked engine is also returned on its own so its preset can be
    /// tuned.
    pub fn standard(
        factory: Arc<dyn SessionFactory>,
        store: Arc<CheckpointStore>,
        protocol_workers: usize,
        chunked: ChunkedConfig,
    ) -> (Self, Arc<ChunkedEngine>) {
        let protocol = Arc::new(
            ProtocolEngine::new(Arc::clone(&factory), protocol_workers)
                .with_progress_interval(chunked.progress_interval),
        );
        let chunked = Arc::new(ChunkedEngine::new(factory, store, chunked));
        let engines = Self {
            protocol,
            chunked: Arc::clone(&chunked) as Arc<dyn TransferEngine>,
        };
        (engines, chunked)
    }

    fn for_kind(&self, kind: EngineKind) -> Arc<dyn TransferEngine> {
        match kind {
            EngineKind::Protocol => Arc::clone(&self.protocol),
            EngineKind::Chunked => Arc::clone(&self.chunked),
        }
    }
}

/// Feeds chunked transfer outcomes to a [`PresetAdvisor`] and applies its
/// recommendations to the chunked engine.
pub struct PresetTuner {
    pub advisor: PresetAdvisor,
    pub engine: Arc<ChunkedEngine>,
}

enum Command {
    Submit {
        tasks: Vec<Task>,
        resolved: bool,
        reply: Reply<Vec<TaskId>>,
    },
    Pause {
        id: TaskId,
        reply: Reply<Task>,
    },
    Resume {
        id: TaskId,
        reply: Reply<Task>,
    },
    Cancel {
        id: TaskId,
        reply: Reply<Task>,
    },
    Restart {
        id: TaskId,
        reply: Reply<TaskId>,
    },
    Acknowledge {
        id: TaskId,
        reply: Reply<Task>,
    },
    Get {
        id: TaskId,
        reply: oneshot::Sender<Option<Task>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Task>>,
    },
    Batch {
        batch: String,
        reply: oneshot::Sender<Option<BatchSummary>>,
    },
}

/// Messages from attempts back to the actor.
enum Report {
    Preflighted {
        id: TaskId,
        result: Result<Preflight, FerryError>,
    },
    Finished {
        id: TaskId,
        result: Result<Outcome, EngineError>,
    },
    Progress {
        id: TaskId,
        bytes: u64,
    },
    Readmit {
        id: TaskId,
    },
}

/// Handle to a running scheduler.
///
/// Dropping the last handle stops the actor and cancels every attempt in
/// flight.
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    factory: Arc<dyn SessionFactory>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Starts the scheduler actor. Must be called inside a Tokio runtime.
    pub fn new(factory: Arc<dyn SessionFactory>, engines: Engines, config: SchedulerConfig) -> Self {
        Self::spawn(factory, engines, config, None)
    }

    /// Like [`new`](Self::new), with adaptive preset selection for chunked
    /// transfers.
    pub fn with_tuner(
        factory: Arc<dyn SessionFactory>,
        engines: Engines,
        config: SchedulerConfig,
        tuner: PresetTuner,
    ) -> Self {
        Self::spawn(factory, engines, config, Some(tuner))
    }

    fn spawn(
        factory: Arc<dyn SessionFactory>,
        engines: Engines,
        config: SchedulerConfig,
        tuner: Option<PresetTuner>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            table: TaskTable::new(events_tx),
            engines,
            config: config.clone(),
            reports: reports_tx,
            protocol_busy: 0,
            chunked_busy: 0,
            tuner,
        };
        tokio::spawn(actor.run(commands_rx, reports_rx));

        Self {
            commands: commands_tx,
            events: Mutex::new(Some(events_rx)),
            factory,
            config,
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SchedulerEvent>> {
        self.events.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn boundary(&self) -> &SandboxBoundary {
        self.factory.boundary()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Admits a task as is. Path problems surface as a failed task.
    pub async fn submit(&self, task: Task) -> Result<TaskId, SchedulerError> {
        let ids = self
            .request(|reply| Command::Submit {
                tasks: vec![task],
                resolved: false,
                reply,
            })
            .await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| SchedulerError::Rejected(FerryError::unknown("nothing admitted")))
    }

    /// Queues the upload of one local file.
    pub async fn submit_upload(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
    ) -> Result<TaskId, SchedulerError> {
        let local = local.as_ref();
        let remote = self.boundary().check(remote)?;
        let meta = tokio::fs::symlink_metadata(local)
            .await
            .map_err(|e| FerryError::from(e).context(format!("stat {}", local.display())))?;
        if meta.file_type().is_symlink() {
            return Err(FerryError::validation(format!(
                "{} is a symbolic link",
                local.display()
            ))
            .into());
        }
        if meta.is_dir() {
            return Err(FerryError::validation(format!(
                "{} is a directory, upload it as a tree",
                local.display()
            ))
            .into());
        }
        if !meta.is_file() {
            return Err(FerryError::validation(format!(
                "{} is not a regular file",
                local.display()
            ))
            .into());
        }
        let size = meta.len();
        let task = Task::new(
            TaskKind::Upload,
            select_engine(TaskKind::Upload, Some(size), self.config.chunk_threshold),
            local.to_string_lossy(),
            remote.into_string(),
            Some(size),
        );
        self.submit(task).await
    }

    /// Queues the download of one remote file.
    pub async fn submit_download(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
    ) -> Result<TaskId, SchedulerError> {
        let remote = self.boundary().check(remote)?;
        let path = remote.clone();
        let entry = self
            .with_session(|session| Box::pin(async move { session.stat(&path).await }))
            .await?;
        let size = match entry {
            Some(entry) if entry.is_file() => entry.size,
            Some(entry) if entry.is_dir() => {
                return Err(FerryError::validation(format!(
                    "{remote} is a directory, download it as a tree"
                ))
                .into());
            }
            Some(_) => {
                return Err(FerryError::validation(format!("{remote} is not a regular file")).into());
            }
            None => {
                return Err(
                    FerryError::new(ErrorKind::PathNotFound, format!("{remote} does not exist")).into(),
                );
            }
        };
        let task = Task::new(
            TaskKind::Download,
            select_engine(TaskKind::Download, Some(size), self.config.chunk_threshold),
            remote.into_string(),
            local.as_ref().to_string_lossy(),
            Some(size),
        );
        self.submit(task).await
    }

    /// Expands a local directory into a batch of `mkdir` and upload tasks.
    ///
    /// The remote destination directory is created before the batch is
    /// admitted.
    pub async fn submit_upload_dir(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
    ) -> Result<BatchTicket, SchedulerError> {
        let root = self.boundary().check(remote)?;
        let local = local.as_ref().to_path_buf();
        let boundary = self.boundary().clone();
        let threshold = self.config.chunk_threshold;
        let remote_root = root.to_string();
        let plan = tokio::task::spawn_blocking(move || {
            plan_upload_tree(&local, &remote_root, &boundary, threshold)
        })
        .await
        .map_err(|e| FerryError::unknown(format!("directory scan aborted: {e}")))??;

        let boundary = self.boundary().clone();
        self.with_session(|session| {
            Box::pin(async move { ensure_dir_all(session, &root, &boundary).await })
        })
        .await?;

        self.submit_plan(plan).await
    }

    /// Expands a remote directory into a batch of download tasks.
    pub async fn submit_download_dir(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
    ) -> Result<BatchTicket, SchedulerError> {
        let root = self.boundary().check(remote)?;
        let local: PathBuf = local.as_ref().to_path_buf();
        let boundary = self.boundary().clone();
        let threshold = self.config.chunk_threshold;
        let plan = self
            .with_session(|session| {
                Box::pin(async move {
                    plan_download_tree(session, root.as_str(), &local, &boundary, threshold).await
                })
            })
            .await?;
        self.submit_plan(plan).await
    }

    pub async fn submit_mkdir(&self, path: &str) -> Result<TaskId, SchedulerError> {
        let path = self.boundary().check(path)?;
        let task = Task::new(TaskKind::Mkdir, EngineKind::Protocol, "", path.into_string(), None);
        self.submit(task).await
    }

    pub async fn submit_delete(&self, path: &str) -> Result<TaskId, SchedulerError> {
        let path = self.boundary().check(path)?;
        let task = Task::new(TaskKind::Delete, EngineKind::Protocol, path.into_string(), "", None);
        self.submit(task).await
    }

    pub async fn submit_rename(&self, from: &str, to: &str) -> Result<TaskId, SchedulerError> {
        let from = self.boundary().check(from)?;
        let to = self.boundary().check(to)?;
        let task = Task::new(
            TaskKind::Rename,
            EngineKind::Protocol,
            from.into_string(),
            to.into_string(),
            None,
        );
        self.submit(task).await
    }

    async fn submit_plan(&self, plan: ExpansionPlan) -> Result<BatchTicket, SchedulerError> {
        let ExpansionPlan {
            batch,
            tasks,
            total_bytes,
            rejected,
        } = plan;
        info!(batch = %batch, tasks = tasks.len(), total_bytes, rejected = rejected.len(), "submitting batch");
        let ids = self
            .request(|reply| Command::Submit {
                tasks,
                resolved: false,
                reply,
            })
            .await?;
        Ok(BatchTicket {
            batch,
            tasks: ids,
            total_bytes,
            rejected,
        })
    }

    /// Runs `op` on a short-lived session, closing it afterwards.
    async fn with_session<T>(
        &self,
        op: impl for<'s> FnOnce(
            &'s mut dyn RemoteSession,
        ) -> futures_util::future::BoxFuture<'s, Result<T, FerryError>>,
    ) -> Result<T, SchedulerError> {
        let mut session = self.factory.connect().await?;
        let result = op(session.as_mut()).await;
        if let Err(e) = session.close().await {
            debug!(error = %e, "session close failed");
        }
        Ok(result?)
    }

    /// Pauses a running task. Resolves once the engine has stopped and the
    /// task is `paused`.
    pub async fn pause(&self, id: &str) -> Result<Task, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    /// Resumes a paused task. Resolves once it is `running` again.
    pub async fn resume(&self, id: &str) -> Result<Task, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Resume { id, reply }).await
    }

    /// Cancels a task. Resolves once the engine has released it.
    ///
    /// The returned snapshot shows the final state, which is `done` if the
    /// attempt completed before it saw the request.
    pub async fn cancel(&self, id: &str) -> Result<Task, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Re-admits a copy of a failed or canceled task.
    pub async fn restart(&self, id: &str) -> Result<TaskId, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Restart { id, reply }).await
    }

    /// Evicts a terminal task from the active set.
    pub async fn acknowledge(&self, id: &str) -> Result<Task, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Acknowledge { id, reply }).await
    }

    pub async fn task(&self, id: &str) -> Result<Option<Task>, SchedulerError> {
        let id = id.to_string();
        self.query(|reply| Command::Get { id, reply }).await
    }

    /// Snapshot of every task in the active set, in admission order.
    pub async fn tasks(&self) -> Result<Vec<Task>, SchedulerError> {
        self.query(|reply| Command::Snapshot { reply }).await
    }

    pub async fn batch_summary(&self, batch: &str) -> Result<Option<BatchSummary>, SchedulerError> {
        let batch = batch.to_string();
        self.query(|reply| Command::Batch { batch, reply }).await
    }
}

/// Readiness of a task's dependency.
enum Dependency {
    Ready,
    Waiting,
    Broken(TaskId),
}

struct Actor {
    table: TaskTable,
    engines: Engines,
    config: SchedulerConfig,
    reports: mpsc::UnboundedSender<Report>,
    protocol_busy: usize,
    chunked_busy: usize,
    tuner: Option<PresetTuner>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        info!(
            protocol_workers = self.config.protocol_workers,
            chunked_concurrency = self.config.chunked_concurrency,
            chunk_threshold = self.config.chunk_threshold,
            "scheduler started"
        );
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(report) = reports.recv() => self.handle_report(report),
            }
            self.dispatch();
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let mut stopped = 0;
        for entry in self.table.entries_mut() {
            if let Some(attempt) = &entry.attempt {
                attempt.ctx.cancel.cancel();
                stopped += 1;
            }
        }
        info!(stopped, "scheduler stopped");
    }

    fn has_slot(&self, engine: EngineKind) -> bool {
        match engine {
            EngineKind::Protocol => self.protocol_busy < self.config.protocol_workers.max(1),
            EngineKind::Chunked => self.chunked_busy < self.config.chunked_concurrency.max(1),
        }
    }

    fn take_slot(&mut self, engine: EngineKind) {
        match engine {
            EngineKind::Protocol => self.protocol_busy += 1,
            EngineKind::Chunked => self.chunked_busy += 1,
        }
    }

    fn free_slot(&mut self, engine: EngineKind) {
        match engine {
            EngineKind::Protocol => self.protocol_busy = self.protocol_busy.saturating_sub(1),
            EngineKind::Chunked => self.chunked_busy = self.chunked_busy.saturating_sub(1),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                tasks,
                resolved,
                reply,
            } => {
                let ids = tasks
                    .into_iter()
                    .map(|task| self.table.admit(task, resolved))
                    .collect();
                let _ = reply.send(Ok(ids));
            }
            Command::Pause { id, reply } => self.pause(id, reply),
            Command::Resume { id, reply } => self.resume(id, reply),
            Command::Cancel { id, reply } => self.cancel(id, reply),
            Command::Restart { id, reply } => {
                let _ = reply.send(self.restart(&id));
            }
            Command::Acknowledge { id, reply } => {
                let _ = reply.send(self.table.evict(&id));
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.table.get(&id).map(|e| e.task.clone()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.table.snapshot());
            }
            Command::Batch { batch, reply } => {
                let _ = reply.send(self.table.summary(&batch));
            }
        }
    }

    fn pause(&mut self, id: TaskId, reply: Reply<Task>) {
        let Some(entry) = self.table.get_mut(&id) else {
            let _ = reply.send(Err(SchedulerError::UnknownTask(id)));
            return;
        };
        if entry.stop_ack.is_some() {
            let _ = reply.send(Err(SchedulerError::RequestPending(id)));
            return;
        }
        match &entry.attempt {
            Some(attempt) if attempt.phase == Phase::Execute => {
                debug!(task = %id, "pause requested");
                attempt.ctx.pause.cancel();
                entry.stop_ack = Some(reply);
            }
            _ => {
                let _ = reply.send(Err(invalid(entry.task.status, TaskStatus::Paused)));
            }
        }
    }

    fn resume(&mut self, id: TaskId, reply: Reply<Task>) {
        let Some(entry) = self.table.get_mut(&id) else {
            let _ = reply.send(Err(SchedulerError::UnknownTask(id)));
            return;
        };
        if entry.task.status != TaskStatus::Paused {
            let _ = reply.send(Err(invalid(entry.task.status, TaskStatus::Running)));
            return;
        }
        if entry.resume_ack.is_some() {
            let _ = reply.send(Err(SchedulerError::RequestPending(id)));
            return;
        }
        // Picked up by dispatch as soon as the engine has a free slot.
        debug!(task = %id, "resume requested");
        entry.resume_ack = Some(reply);
    }

    fn cancel(&mut self, id: TaskId, reply: Reply<Task>) {
        let Some(entry) = self.table.get_mut(&id) else {
            let _ = reply.send(Err(SchedulerError::UnknownTask(id)));
            return;
        };
        if entry.task.status.is_terminal() {
            let _ = reply.send(Err(invalid(entry.task.status, TaskStatus::Canceled)));
            return;
        }
        if entry.stop_ack.is_some() {
            let _ = reply.send(Err(SchedulerError::RequestPending(id)));
            return;
        }
        if let Some(attempt) = &entry.attempt {
            debug!(task = %id, "cancel requested");
            attempt.ctx.cancel.cancel();
            entry.stop_ack = Some(reply);
            return;
        }

        // Queued, backing off or paused: nothing to stop.
        let resume_ack = entry.resume_ack.take();
        let result = self.table.transition(&id, TaskStatus::Canceled);
        if let (Some(ack), Ok(task)) = (resume_ack, &result) {
            let _ = ack.send(Ok(task.clone()));
        }
        let _ = reply.send(result);
    }

    fn restart(&mut self, id: &str) -> Result<TaskId, SchedulerError> {
        let entry = self.table.entry(id)?;
        let old = &entry.task;
        if !matches!(old.status, TaskStatus::Failed | TaskStatus::Canceled) {
            return Err(SchedulerError::NotRestartable {
                id: id.to_string(),
                status: old.status,
            });
        }
        let mut copy = Task::new(
            old.kind,
            old.engine,
            old.src.clone(),
            old.dst.clone(),
            old.bytes_total,
        );
        copy.checkpoint = old.checkpoint.clone();
        let resolved = entry.resolved;
        info!(task = %id, copy = %copy.id, "task restarted");
        Ok(self.table.admit(copy, resolved))
    }

    fn dependency(&self, task: &Task) -> Dependency {
        let Some(dep) = &task.depends_on else {
            return Dependency::Ready;
        };
        match self.table.get(dep).map(|e| e.task.status) {
            // Evicted dependencies were acknowledged terminal.
            None | Some(TaskStatus::Done | TaskStatus::Skipped) => Dependency::Ready,
            Some(TaskStatus::Failed | TaskStatus::Canceled) => Dependency::Broken(dep.clone()),
            Some(_) => Dependency::Waiting,
        }
    }

    /// Starts every eligible task while engine slots are free.
    fn dispatch(&mut self) {
        let ids: Vec<TaskId> = self.table.order().to_vec();
        for id in ids {
            let Some(entry) = self.table.get(&id) else {
                continue;
            };
            if entry.in_flight() || entry.backoff {
                continue;
            }
            let engine = entry.task.engine;
            let status = entry.task.status;
            let resume_waiting = entry.resume_ack.is_some();
            match status {
                TaskStatus::Paused if resume_waiting => {
                    if self.has_slot(engine) {
                        self.resume_now(&id);
                    }
                    continue;
                }
                TaskStatus::Pending => {}
                _ => continue,
            }
            let dependency = self.dependency(&entry.task);
            match dependency {
                Dependency::Waiting => continue,
                Dependency::Broken(dep) => {
                    self.fail_orphan(&id, &dep);
                    continue;
                }
                Dependency::Ready => {}
            }
            if self.has_slot(engine) {
                self.start(&id);
            }
        }
    }

    /// Fails a task whose parent directory was never created.
    fn fail_orphan(&mut self, id: &str, dep: &str) {
        let err = FerryError::new(
            ErrorKind::PathNotFound,
            format!("parent directory task {dep} did not complete"),
        );
        warn!(task = %id, dependency = %dep, "dependency failed, failing dependent");
        let result = self
            .table
            .transition(id, TaskStatus::Running)
            .and_then(|_| self.table.fail(id, &err));
        if let Err(e) = result {
            error!(task = %id, error = %e, "could not fail dependent task");
        }
    }

    fn attempt_context(&self, id: &str) -> AttemptContext {
        let reports = self.reports.clone();
        let id = id.to_string();
        AttemptContext::new(Arc::new(move |bytes| {
            let _ = reports.send(Report::Progress {
                id: id.clone(),
                bytes,
            });
        }))
    }

    fn start(&mut self, id: &str) {
        let Some(entry) = self.table.get(id) else {
            return;
        };
        let engine = entry.task.engine;
        let resolved = entry.resolved;
        let ctx = self.attempt_context(id);
        self.take_slot(engine);

        if resolved {
            if let Err(e) = self.table.transition(id, TaskStatus::Running) {
                error!(task = %id, error = %e, "could not start task");
                self.free_slot(engine);
                return;
            }
            self.spawn_execute(id, ctx);
        } else {
            self.spawn_preflight(id, ctx);
        }
    }

    fn resume_now(&mut self, id: &str) {
        let Some(entry) = self.table.get_mut(id) else {
            return;
        };
        let Some(ack) = entry.resume_ack.take() else {
            return;
        };
        let engine = entry.task.engine;
        let result = self.table.transition(id, TaskStatus::Running);
        if result.is_ok() {
            self.take_slot(engine);
            let ctx = self.attempt_context(id);
            self.spawn_execute(id, ctx);
        }
        let _ = ack.send(result);
    }

    fn spawn_preflight(&mut self, id: &str, ctx: AttemptContext) {
        let Some(entry) = self.table.get_mut(id) else {
            return;
        };
        entry.attempt = Some(Attempt {
            ctx,
            phase: Phase::Preflight,
        });
        let task = entry.task.clone();
        let engine = self.engines.for_kind(task.engine);
        let reports = self.reports.clone();
        debug!(task = %task.id, "preflight starting");
        tokio::spawn(async move {
            let result = engine.preflight(&task).await;
            let _ = reports.send(Report::Preflighted {
                id: task.id,
                result,
            });
        });
    }

    fn spawn_execute(&mut self, id: &str, ctx: AttemptContext) {
        let Some(entry) = self.table.get_mut(id) else {
            return;
        };
        entry.attempt = Some(Attempt {
            ctx: ctx.clone(),
            phase: Phase::Execute,
        });
        let task = entry.task.clone();
        let engine = self.engines.for_kind(task.engine);
        let reports = self.reports.clone();
        tokio::spawn(async move {
            let result = engine.execute(&task, ctx).await;
            let _ = reports.send(Report::Finished {
                id: task.id,
                result,
            });
        });
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Progress { id, bytes } => self.table.progress(&id, bytes),
            Report::Readmit { id } => {
                if let Some(entry) = self.table.get_mut(&id) {
                    entry.backoff = false;
                }
            }
            Report::Preflighted { id, result } => self.preflighted(&id, result),
            Report::Finished { id, result } => self.finished(&id, result),
        }
    }

    fn preflighted(&mut self, id: &str, result: Result<Preflight, FerryError>) {
        let Some(entry) = self.table.get_mut(id) else {
            return;
        };
        let Some(attempt) = entry.attempt.take() else {
            return;
        };
        let engine = entry.task.engine;
        // Only cancel can be pending during preflight.
        let ack = entry.stop_ack.take();

        if attempt.ctx.cancel.is_cancelled() {
            self.free_slot(engine);
            let result = self.table.transition(id, TaskStatus::Canceled);
            reply_stop(ack, result);
            return;
        }

        match result {
            Ok(Preflight::Skip) => {
                self.free_slot(engine);
                if let Err(e) = self.table.transition(id, TaskStatus::Skipped) {
                    error!(task = %id, error = %e, "could not skip task");
                }
            }
            Ok(Preflight::Proceed {
                dst,
                bytes_total,
                checkpoint,
            }) => {
                entry.task.dst = dst;
                if bytes_total.is_some() {
                    entry.task.bytes_total = bytes_total;
                }
                entry.task.checkpoint = checkpoint;
                entry.resolved = true;
                // The slot taken for preflight carries over to execution.
                match self.table.transition(id, TaskStatus::Running) {
                    Ok(_) => self.spawn_execute(id, attempt.ctx),
                    Err(e) => {
                        error!(task = %id, error = %e, "could not start task");
                        self.free_slot(engine);
                    }
                }
            }
            Err(e) => {
                self.free_slot(engine);
                warn!(task = %id, error = %e, "preflight failed");
                match self.table.transition(id, TaskStatus::Running) {
                    Ok(_) => self.handle_failure(id, EngineError::Failed(e)),
                    Err(t) => error!(task = %id, error = %t, "could not record preflight failure"),
                }
            }
        }
    }

    fn finished(&mut self, id: &str, result: Result<Outcome, EngineError>) {
        let Some(entry) = self.table.get_mut(id) else {
            return;
        };
        let Some(attempt) = entry.attempt.take() else {
            return;
        };
        let engine = entry.task.engine;
        let ack = entry.stop_ack.take();
        self.free_slot(engine);

        let next = match result {
            Ok(Outcome::Completed) => TaskStatus::Done,
            Ok(Outcome::Paused) => TaskStatus::Paused,
            Ok(Outcome::Canceled) => TaskStatus::Canceled,
            Err(e) if attempt.ctx.cancel.is_cancelled() => {
                debug!(task = %id, error = %e, "attempt failed while canceling");
                TaskStatus::Canceled
            }
            Err(e) => {
                self.handle_failure(id, e);
                self.record_outcome(id);
                let snapshot = self
                    .table
                    .entry(id)
                    .map(|e| e.task.clone());
                reply_stop(ack, snapshot);
                return;
            }
        };
        let result = self.table.transition(id, next);
        if let Err(e) = &result {
            error!(task = %id, error = %e, "could not apply attempt outcome");
        }
        self.record_outcome(id);
        reply_stop(ack, result);
    }

    fn handle_failure(&mut self, id: &str, err: EngineError) {
        let Some(entry) = self.table.get_mut(id) else {
            return;
        };
        let decision = self.config.retry.decide(&err, entry.history);
        match decision {
            RetryDecision::Retry { delay, reason } => {
                match reason {
                    RetryReason::Transient => entry.history.transient += 1,
                    RetryReason::Partial => entry.history.partial += 1,
                }
                entry.backoff = true;
                if let Err(e) = self.table.requeue(id, err.error()) {
                    error!(task = %id, error = %e, "could not requeue task");
                    return;
                }
                warn!(
                    task = %id,
                    ?reason,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying after backoff"
                );
                let reports = self.reports.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = reports.send(Report::Readmit { id });
                });
            }
            RetryDecision::GiveUp => {
                error!(task = %id, error = %err, "task failed");
                if let Err(e) = self.table.fail(id, err.error()) {
                    error!(task = %id, error = %e, "could not mark task failed");
                }
            }
        }
    }

    /// Reports a finished chunked transfer to the preset tuner.
    fn record_outcome(&mut self, id: &str) {
        let Some(tuner) = &mut self.tuner else {
            return;
        };
        let Some(entry) = self.table.get(id) else {
            return;
        };
        let task = &entry.task;
        if task.engine != EngineKind::Chunked
            || !matches!(task.status, TaskStatus::Done | TaskStatus::Failed)
        {
            return;
        }
        let record = TransferRecord {
            preset: tuner.engine.config().preset,
            bytes: task.bytes_total.unwrap_or(task.bytes_done),
            duration_secs: entry
                .started
                .map(|at| at.elapsed().as_secs_f64())
                .unwrap_or_default(),
            success: task.status == TaskStatus::Done,
            at: chrono::Utc::now(),
        };
        if let Some(preset) = tuner.advisor.record(record) {
            tuner.engine.set_preset(preset);
        }
    }
}

fn invalid(from: TaskStatus, to: TaskStatus) -> SchedulerError {
    SchedulerError::Transition(InvalidTransition { from, to })
}

fn reply_stop(ack: Option<Reply<Task>>, result: Result<Task, SchedulerError>) {
    if let Some(ack) = ack {
        let _ = ack.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use ferry_file_ops::DirSessionFactory;
    use ferry_transfer::ThroughputPreset;
    use ferry_transfer::testing::{FaultPlan, FaultySessionFactory};
    use tempfile::TempDir;
    use tokio::time::Instant;

    enum Step {
        Return(Result<Outcome, EngineError>),
        /// Runs until paused or canceled.
        WaitForStop,
    }

    /// Engine whose attempts follow a per-destination script.
    #[derive(Default)]
    struct ScriptedEngine {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        runs: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedEngine {
        fn script(&self, dst: &str, steps: Vec<Step>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(dst.to_string(), steps.into());
        }

        fn runs(&self, dst: &str) -> Vec<Instant> {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| d == dst)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    impl TransferEngine for ScriptedEngine {
        fn kind(&self) -> EngineKind {
            EngineKind::Protocol
        }

        fn preflight<'a>(
            &'a self,
            task: &'a Task,
        ) -> futures_util::future::BoxFuture<'a, Result<Preflight, FerryError>> {
            Box::pin(async move {
                Ok(Preflight::Proceed {
                    dst: task.dst.clone(),
                    bytes_total: task.bytes_total,
                    checkpoint: None,
                })
            })
        }

        fn execute<'a>(
            &'a self,
            task: &'a Task,
            ctx: AttemptContext,
        ) -> futures_util::future::BoxFuture<'a, Result<Outcome, EngineError>> {
            Box::pin(async move {
                self.runs
                    .lock()
                    .unwrap()
                    .push((task.dst.clone(), Instant::now()));
                let step = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&task.dst)
                    .and_then(|steps| steps.pop_front());
                match step {
                    None => Ok(Outcome::Completed),
                    Some(Step::Return(result)) => result,
                    Some(Step::WaitForStop) => {
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => {}
                            _ = ctx.pause.cancelled() => {}
                        }
                        Ok(ctx.interrupted().unwrap_or(Outcome::Canceled))
                    }
                }
            })
        }
    }

    struct Scripted {
        _mount: TempDir,
        engine: Arc<ScriptedEngine>,
        scheduler: Scheduler,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
    }

    fn scripted(config: SchedulerConfig) -> Scripted {
        scripted_with(config, None)
    }

    fn scripted_with(config: SchedulerConfig, tuner: Option<PresetTuner>) -> Scripted {
        let mount = TempDir::new().unwrap();
        let factory = Arc::new(DirSessionFactory::new(
            mount.path(),
            SandboxBoundary::new("/").unwrap(),
        ));
        let engine = Arc::new(ScriptedEngine::default());
        let engines = Engines {
            protocol: engine.clone(),
            chunked: engine.clone(),
        };
        let scheduler = match tuner {
            Some(tuner) => Scheduler::with_tuner(factory, engines, config, tuner),
            None => Scheduler::new(factory, engines, config),
        };
        let events = scheduler.take_events().unwrap();
        Scripted {
            _mount: mount,
            engine,
            scheduler,
            events,
        }
    }

    fn job(dst: &str) -> Task {
        Task::new(TaskKind::Upload, EngineKind::Protocol, "/local/src", dst, Some(10))
    }

    fn failed(kind: ErrorKind) -> Step {
        Step::Return(Err(EngineError::Failed(FerryError::new(kind, "injected"))))
    }

    fn partial(kind: ErrorKind) -> Step {
        Step::Return(Err(EngineError::Partial {
            source: FerryError::new(kind, "injected"),
            completed: 4,
            total: 10,
        }))
    }

    async fn wait_status(
        events: &mut mpsc::UnboundedReceiver<SchedulerEvent>,
        id: &str,
        status: TaskStatus,
    ) -> Task {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(SchedulerEvent::TaskChanged(task))
                        if task.id == id && task.status == status =>
                    {
                        return task;
                    }
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("task {id} never reached {status}"))
    }

    async fn poll_until(scheduler: &Scheduler, id: &str, pred: impl Fn(&Task) -> bool) -> Task {
        let wait = async {
            loop {
                if let Some(task) = scheduler.task(id).await.unwrap()
                    && pred(&task)
                {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("task {id} never matched"))
    }

    async fn poll_status(scheduler: &Scheduler, id: &str, status: TaskStatus) -> Task {
        poll_until(scheduler, id, |t| t.status == status).await
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine.script(
            "/r/a",
            vec![
                failed(ErrorKind::NetworkTimeout),
                failed(ErrorKind::RemoteDisconnect),
                Step::Return(Ok(Outcome::Completed)),
            ],
        );
        let id = s.scheduler.submit(job("/r/a")).await.unwrap();

        let requeued = poll_until(&s.scheduler, &id, |t| t.retries == 1).await;
        assert_eq!(requeued.error_kind, Some(ErrorKind::NetworkTimeout));

        let done = wait_status(&mut s.events, &id, TaskStatus::Done).await;
        assert_eq!(done.retries, 2);
        assert_eq!(done.bytes_done, 10);

        let runs = s.engine.runs("/r/a");
        assert_eq!(runs.len(), 3);
        let first_gap = runs[1] - runs[0];
        let second_gap = runs[2] - runs[1];
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1500));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_retries_are_capped() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine.script(
            "/r/a",
            (0..4).map(|_| failed(ErrorKind::NetworkTimeout)).collect(),
        );
        let id = s.scheduler.submit(job("/r/a")).await.unwrap();

        let task = wait_status(&mut s.events, &id, TaskStatus::Failed).await;
        assert_eq!(task.retries, 3);
        assert_eq!(task.error_kind, Some(ErrorKind::NetworkTimeout));
        assert_eq!(s.engine.runs("/r/a").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_and_validation_errors_fail_at_once() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine.script("/r/denied", vec![failed(ErrorKind::PermissionDenied)]);
        s.engine.script("/r/invalid", vec![failed(ErrorKind::ValidationFailed)]);
        let denied = s.scheduler.submit(job("/r/denied")).await.unwrap();
        let invalid = s.scheduler.submit(job("/r/invalid")).await.unwrap();

        let task = poll_status(&s.scheduler, &denied, TaskStatus::Failed).await;
        assert_eq!(task.retries, 0);
        assert_eq!(task.error_kind, Some(ErrorKind::PermissionDenied));
        let task = poll_status(&s.scheduler, &invalid, TaskStatus::Failed).await;
        assert_eq!(task.error_kind, Some(ErrorKind::ValidationFailed));

        assert_eq!(s.engine.runs("/r/denied").len(), 1);
        assert_eq!(s.engine.runs("/r/invalid").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_earns_one_extra_attempt() {
        let mut s = scripted(SchedulerConfig::default());
        // Three transient retries, then the extra one, which succeeds.
        s.engine.script(
            "/r/big",
            vec![
                partial(ErrorKind::RemoteDisconnect),
                partial(ErrorKind::RemoteDisconnect),
                partial(ErrorKind::RemoteDisconnect),
                partial(ErrorKind::RemoteDisconnect),
                Step::Return(Ok(Outcome::Completed)),
            ],
        );
        s.engine.script(
            "/r/odd",
            vec![partial(ErrorKind::UnknownError), partial(ErrorKind::UnknownError)],
        );
        let big = s.scheduler.submit(job("/r/big")).await.unwrap();
        let odd = s.scheduler.submit(job("/r/odd")).await.unwrap();

        let task = wait_status(&mut s.events, &odd, TaskStatus::Failed).await;
        assert_eq!(task.error_kind, Some(ErrorKind::UnknownError));
        assert_eq!(s.engine.runs("/r/odd").len(), 2);

        let task = wait_status(&mut s.events, &big, TaskStatus::Done).await;
        assert_eq!(task.retries, 4);
        assert_eq!(s.engine.runs("/r/big").len(), 5);
    }

    #[tokio::test]
    async fn pause_resume_cancel_are_acknowledged_after_transition() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine
            .script("/r/a", vec![Step::WaitForStop, Step::WaitForStop]);
        let id = s.scheduler.submit(job("/r/a")).await.unwrap();
        wait_status(&mut s.events, &id, TaskStatus::Running).await;

        let paused = s.scheduler.pause(&id).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert!(matches!(
            s.scheduler.pause(&id).await,
            Err(SchedulerError::Transition(_))
        ));

        let resumed = s.scheduler.resume(&id).await.unwrap();
        assert_eq!(resumed.status, TaskStatus::Running);

        let canceled = s.scheduler.cancel(&id).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert_eq!(s.engine.runs("/r/a").len(), 2);

        assert!(matches!(
            s.scheduler.resume(&id).await,
            Err(SchedulerError::Transition(_))
        ));
        assert!(matches!(
            s.scheduler.cancel("nope").await,
            Err(SchedulerError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn queued_task_cancels_without_running() {
        let config = SchedulerConfig {
            protocol_workers: 1,
            ..SchedulerConfig::default()
        };
        let mut s = scripted(config);
        s.engine.script("/r/first", vec![Step::WaitForStop]);
        let first = s.scheduler.submit(job("/r/first")).await.unwrap();
        let second = s.scheduler.submit(job("/r/second")).await.unwrap();
        wait_status(&mut s.events, &first, TaskStatus::Running).await;

        let queued = s.scheduler.task(&second).await.unwrap().unwrap();
        assert_eq!(queued.status, TaskStatus::Pending);
        assert!(matches!(
            s.scheduler.pause(&second).await,
            Err(SchedulerError::Transition(InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Paused
            }))
        ));

        let canceled = s.scheduler.cancel(&second).await.unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        s.scheduler.cancel(&first).await.unwrap();
        assert!(s.engine.runs("/r/second").is_empty());
    }

    #[tokio::test]
    async fn chunked_tasks_run_one_at_a_time() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine.script("/r/big1", vec![Step::WaitForStop]);
        let mut a = job("/r/big1");
        a.engine = EngineKind::Chunked;
        let mut b = job("/r/big2");
        b.engine = EngineKind::Chunked;
        let a = s.scheduler.submit(a).await.unwrap();
        let b = s.scheduler.submit(b).await.unwrap();
        let small = s.scheduler.submit(job("/r/small")).await.unwrap();

        poll_status(&s.scheduler, &a, TaskStatus::Running).await;
        poll_status(&s.scheduler, &small, TaskStatus::Done).await;
        let queued = s.scheduler.task(&b).await.unwrap().unwrap();
        assert_eq!(queued.status, TaskStatus::Pending);

        s.scheduler.cancel(&a).await.unwrap();
        wait_status(&mut s.events, &b, TaskStatus::Done).await;
    }

    #[tokio::test]
    async fn failed_parent_fails_dependents() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine.script("/r/dir", vec![failed(ErrorKind::PermissionDenied)]);
        let parent = Task::new(TaskKind::Mkdir, EngineKind::Protocol, "", "/r/dir", None);
        let parent_id = parent.id.clone();
        let mut child = job("/r/dir/file");
        child.depends_on = Some(parent_id.clone());
        s.scheduler.submit(parent).await.unwrap();
        let child_id = s.scheduler.submit(child).await.unwrap();

        let task = wait_status(&mut s.events, &child_id, TaskStatus::Failed).await;
        assert_eq!(task.error_kind, Some(ErrorKind::PathNotFound));
        assert!(s.engine.runs("/r/dir/file").is_empty());
    }

    #[tokio::test]
    async fn restart_and_acknowledge() {
        let mut s = scripted(SchedulerConfig::default());
        s.engine.script("/r/a", vec![failed(ErrorKind::PermissionDenied)]);
        let id = s.scheduler.submit(job("/r/a")).await.unwrap();
        wait_status(&mut s.events, &id, TaskStatus::Failed).await;

        let copy = s.scheduler.restart(&id).await.unwrap();
        assert_ne!(copy, id);
        let done = wait_status(&mut s.events, &copy, TaskStatus::Done).await;
        assert_eq!(done.retries, 0);
        assert!(matches!(
            s.scheduler.restart(&copy).await,
            Err(SchedulerError::NotRestartable { .. })
        ));

        let evicted = s.scheduler.acknowledge(&id).await.unwrap();
        assert_eq!(evicted.status, TaskStatus::Failed);
        assert!(s.scheduler.task(&id).await.unwrap().is_none());
        let left: Vec<TaskId> = s
            .scheduler
            .tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(left, vec![copy]);
    }

    #[tokio::test]
    async fn tuner_steps_preset_up_after_clean_transfers() {
        let mount = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let factory: Arc<dyn SessionFactory> = Arc::new(DirSessionFactory::new(
            mount.path(),
            SandboxBoundary::new("/").unwrap(),
        ));
        let chunked = Arc::new(ChunkedEngine::new(
            factory,
            Arc::new(CheckpointStore::new(state.path())),
            ChunkedConfig::with_preset(ThroughputPreset::Low),
        ));
        let tuner = PresetTuner {
            advisor: PresetAdvisor::new(ThroughputPreset::Low),
            engine: chunked.clone(),
        };
        let mut s = scripted_with(SchedulerConfig::default(), Some(tuner));
        for n in 0..3 {
            let mut task = job(&format!("/r/big{n}"));
            task.engine = EngineKind::Chunked;
            let id = s.scheduler.submit(task).await.unwrap();
            wait_status(&mut s.events, &id, TaskStatus::Done).await;
        }
        // Recorded in the same actor step that emits Done.
        assert_eq!(chunked.config().preset, ThroughputPreset::Medium);
    }

    struct Real {
        local: TempDir,
        remote: TempDir,
        _state: TempDir,
        factory: Arc<FaultySessionFactory>,
        plan: Arc<FaultPlan>,
        scheduler: Scheduler,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
    }

    fn real() -> Real {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        std::fs::create_dir_all(remote.path().join("data")).unwrap();
        let plan = Arc::new(FaultPlan::default());
        let factory = Arc::new(FaultySessionFactory::new(
            remote.path(),
            SandboxBoundary::new("/data").unwrap(),
            plan.clone(),
        ));
        let (engines, _) = Engines::standard(
            factory.clone(),
            Arc::new(CheckpointStore::new(state.path())),
            4,
            ChunkedConfig::default(),
        );
        let scheduler = Scheduler::new(factory.clone(), engines, SchedulerConfig::default());
        let events = scheduler.take_events().unwrap();
        Real {
            local,
            remote,
            _state: state,
            factory,
            plan,
            scheduler,
            events,
        }
    }

    /// Collects events up to the end of `batch`.
    async fn drain_batch(
        events: &mut mpsc::UnboundedReceiver<SchedulerEvent>,
        batch: &str,
    ) -> (Vec<SchedulerEvent>, BatchSummary) {
        let wait = async {
            let mut seen = Vec::new();
            loop {
                match events.recv().await {
                    Some(SchedulerEvent::BatchFinished(summary)) if summary.batch == batch => {
                        return (seen, summary);
                    }
                    Some(event) => seen.push(event),
                    None => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(30), wait)
            .await
            .expect("batch never finished")
    }

    fn position(events: &[SchedulerEvent], pred: impl Fn(&Task) -> bool) -> usize {
        events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::TaskChanged(t) if pred(t)))
            .expect("event not found")
    }

    #[tokio::test]
    async fn directory_upload_creates_parents_first_then_skips_identical() {
        let mut r = real();
        let src = r.local.path().join("site");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.txt"), "alpha").unwrap();
        std::fs::write(src.join("b.txt"), "bravo").unwrap();
        std::fs::write(src.join("sub/c.txt"), "charlie").unwrap();

        let ticket = r.scheduler.submit_upload_dir(&src, "/data/site").await.unwrap();
        assert_eq!(ticket.tasks.len(), 4);
        assert_eq!(ticket.total_bytes, 17);

        let (events, summary) = drain_batch(&mut r.events, &ticket.batch).await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.done, 4);
        let mkdir_done = position(&events, |t| {
            t.kind == TaskKind::Mkdir && t.status == TaskStatus::Done
        });
        let child_running = position(&events, |t| {
            t.dst.ends_with("/sub/c.txt") && t.status == TaskStatus::Running
        });
        assert!(mkdir_done < child_running);

        let uploaded = r.remote.path().join("data/site/sub/c.txt");
        assert_eq!(std::fs::read_to_string(&uploaded).unwrap(), "charlie");
        let before = std::fs::metadata(&uploaded).unwrap().modified().unwrap();

        let again = r.scheduler.submit_upload_dir(&src, "/data/site").await.unwrap();
        let (_, summary) = drain_batch(&mut r.events, &again.batch).await;
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.done, 1);
        let after = std::fs::metadata(&uploaded).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn escaping_paths_fail_without_a_session() {
        let mut r = real();
        let src = r.local.path().join("passwd");
        std::fs::write(&src, "root:x:0:0").unwrap();

        let rejected = r.scheduler.submit_upload(&src, "/data/../etc/passwd").await;
        match rejected {
            Err(SchedulerError::Rejected(e)) => assert_eq!(e.kind(), ErrorKind::ValidationFailed),
            other => panic!("expected rejection, got {other:?}"),
        }

        let task = Task::new(
            TaskKind::Upload,
            EngineKind::Protocol,
            src.to_string_lossy(),
            "/data/../etc/passwd",
            Some(10),
        );
        let id = r.scheduler.submit(task).await.unwrap();
        let failed = wait_status(&mut r.events, &id, TaskStatus::Failed).await;
        assert_eq!(failed.error_kind, Some(ErrorKind::ValidationFailed));
        assert_eq!(failed.retries, 0);
        assert_eq!(r.factory.sessions_opened(), 0);
        assert!(!r.remote.path().join("etc/passwd").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_upload_source_is_rejected() {
        let r = real();
        let target = r.local.path().join("real.bin");
        let link = r.local.path().join("link.bin");
        std::fs::write(&target, "payload").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        match r.scheduler.submit_upload(&link, "/data/link.bin").await {
            Err(SchedulerError::Rejected(e)) => assert_eq!(e.kind(), ErrorKind::ValidationFailed),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(r.scheduler.tasks().await.unwrap().is_empty());
        assert_eq!(r.factory.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_is_retried() {
        let mut r = real();
        let src = r.local.path().join("notes.txt");
        std::fs::write(&src, "hello ferry").unwrap();
        r.plan.fail_connects_after(0, 1);

        let id = r.scheduler.submit_upload(&src, "/data/notes.txt").await.unwrap();
        let done = wait_status(&mut r.events, &id, TaskStatus::Done).await;
        assert_eq!(done.retries, 1);
        assert_eq!(
            std::fs::read_to_string(r.remote.path().join("data/notes.txt")).unwrap(),
            "hello ferry"
        );
    }

    #[tokio::test]
    async fn download_of_directory_is_rejected() {
        let r = real();
        std::fs::create_dir_all(r.remote.path().join("data/logs")).unwrap();
        let err = r
            .scheduler
            .submit_download("/data/logs", r.local.path().join("logs"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Rejected(e) if e.kind() == ErrorKind::ValidationFailed));

        let err = r
            .scheduler
            .submit_download("/data/missing.bin", r.local.path().join("m"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Rejected(e) if e.kind() == ErrorKind::PathNotFound));
    }
}

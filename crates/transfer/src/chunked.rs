//! Multi-connection chunked engine with byte-range resume.
//!
//! The file is split into fixed-size chunks. A pool of workers, each owning
//! one session and one pair of open handles, pulls chunks off a shared queue.
//! Every chunk is flushed before its range is recorded in the checkpoint, so
//! an interrupted transfer resumes without re-sending anything that landed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferry_protocol::{
    EngineKind, ErrorKind, FerryError, RemoteFile, RemoteSession, SessionFactory, Task,
};

use crate::checkpoint::{ByteRange, Checkpoint, CheckpointStore, fingerprint};
use crate::copy::copy_range;
use crate::endpoints::Endpoints;
use crate::engine::{AttemptContext, EngineError, Outcome, Preflight, TransferEngine};
use crate::preset::{ChunkedConfig, ThroughputPreset};
use crate::progress::ProgressReporter;
use crate::stream::{copy_whole, transfer_preflight};

/// Engine for transfers at or above the chunking threshold.
pub struct ChunkedEngine {
    factory: Arc<dyn SessionFactory>,
    store: Arc<CheckpointStore>,
    config: RwLock<ChunkedConfig>,
}

impl ChunkedEngine {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        store: Arc<CheckpointStore>,
        config: ChunkedConfig,
    ) -> Self {
        Self {
            factory,
            store,
            config: RwLock::new(config),
        }
    }

    /// Snapshot of the current tunables.
    pub fn config(&self) -> ChunkedConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Switches the preset used by attempts that start from now on.
    pub fn set_preset(&self, preset: ThroughputPreset) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        if config.preset != preset {
            info!(from = %config.preset, to = %preset, "chunked preset changed");
            config.preset = preset;
        }
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    async fn connect(&self, config: &ChunkedConfig) -> Result<Box<dyn RemoteSession>, FerryError> {
        connect_with_retry(self.factory.as_ref(), config).await
    }

    async fn run(&self, task: &Task, ctx: &AttemptContext) -> Result<Outcome, EngineError> {
        let config = self.config();
        let endpoints = Endpoints::from_task(task, self.factory.boundary())?;
        if let Some(outcome) = ctx.interrupted() {
            return Ok(outcome);
        }

        let mut probe = self.connect(&config).await?;
        let result = self.run_with_probe(task, ctx, &config, &endpoints, probe.as_mut()).await;
        if let Err(e) = probe.close().await {
            debug!(error = %e, "probe session close failed");
        }
        result
    }

    async fn run_with_probe(
        &self,
        task: &Task,
        ctx: &AttemptContext,
        config: &ChunkedConfig,
        endpoints: &Endpoints,
        probe: &mut dyn RemoteSession,
    ) -> Result<Outcome, EngineError> {
        let (size, mtime) = endpoints.source_info(probe).await?;
        let fp = task.checkpoint.clone().unwrap_or_else(|| {
            fingerprint(&endpoints.source_key(), &endpoints.dest_key(), size, mtime)
        });
        let chunk_size = config.effective_chunk_size();

        let existing = self
            .store
            .load(&fp)
            .await
            .filter(|cp| cp.file_size == size && cp.target == endpoints.dest_key());

        let target = endpoints.dest_key();
        self.store
            .mark_unfinished(&target)
            .await
            .map_err(FerryError::from)?;

        if existing.is_none() && size < chunk_size {
            debug!(task = %task.id, size, chunk_size, "below one chunk, single stream");
            let reporter = ProgressReporter::new(ctx.progress.clone(), config.progress_interval, 0);
            let outcome = copy_whole(endpoints, probe, ctx, &reporter).await?;
            reporter.flush();
            if outcome == Outcome::Completed {
                self.store
                    .mark_finished(&target)
                    .await
                    .map_err(FerryError::from)?;
            }
            return Ok(outcome);
        }

        let resuming = existing.is_some();
        let checkpoint = existing.unwrap_or_else(|| {
            Checkpoint::new(
                fp.clone(),
                endpoints.source_key(),
                endpoints.dest_key(),
                size,
                chunk_size,
            )
        });

        // Size the destination up front so workers can write at any offset.
        {
            let mut dst = endpoints.open_dest(probe, !resuming).await?;
            dst.set_len(size).await?;
            dst.flush().await?;
        }
        self.store.save(&checkpoint).await.map_err(FerryError::from)?;

        let pending = checkpoint.pending_chunks(checkpoint.chunk_size);
        let baseline = checkpoint.bytes_completed();
        info!(
            task = %task.id,
            size,
            chunk_size = checkpoint.chunk_size,
            chunks = pending.len(),
            resumed_bytes = baseline,
            "chunked transfer starting"
        );

        let shared = Arc::new(Shared {
            endpoints: endpoints.clone(),
            factory: Arc::clone(&self.factory),
            store: Arc::clone(&self.store),
            config: config.clone(),
            queue: Mutex::new(pending.iter().map(|&range| ChunkJob::new(range)).collect()),
            checkpoint: tokio::sync::Mutex::new(checkpoint),
            reporter: ProgressReporter::new(ctx.progress.clone(), config.progress_interval, baseline),
            ctx: ctx.clone(),
            abort: CancellationToken::new(),
            fatal: Mutex::new(None),
            last_error: Mutex::new(None),
            connect_failures: AtomicUsize::new(0),
        });

        if !pending.is_empty() {
            launch_workers(&shared, pending.len()).await;
        }
        shared.reporter.flush();

        if let Some(outcome) = ctx.interrupted() {
            info!(task = %task.id, ?outcome, "chunked transfer stopped at chunk boundary");
            return Ok(outcome);
        }

        let completed = shared.checkpoint.lock().await.bytes_completed();
        let fatal = shared.fatal.lock().ok().and_then(|mut f| f.take());
        let leftover = shared.queue.lock().map(|q| q.len()).unwrap_or(0);
        if fatal.is_some() || leftover > 0 || completed < size {
            let source = fatal
                .or_else(|| shared.last_error.lock().ok().and_then(|mut e| e.take()))
                .unwrap_or_else(|| {
                    FerryError::new(ErrorKind::RemoteDisconnect, "all chunk workers exited")
                });
            error!(task = %task.id, completed, size, error = %source, "chunked transfer failed");
            return Err(if completed > 0 {
                EngineError::Partial {
                    source,
                    completed,
                    total: size,
                }
            } else {
                EngineError::Failed(source)
            });
        }

        let written = endpoints.dest_size(probe).await?;
        if written != Some(size) {
            return Err(FerryError::unknown(format!(
                "destination size {written:?} does not match source size {size}"
            ))
            .into());
        }

        self.store.discard(&fp).await.map_err(FerryError::from)?;
        self.store
            .mark_finished(&target)
            .await
            .map_err(FerryError::from)?;
        info!(task = %task.id, size, "chunked transfer complete");
        Ok(Outcome::Completed)
    }
}

impl TransferEngine for ChunkedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Chunked
    }

    fn preflight<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<Preflight, FerryError>> {
        Box::pin(async move {
            let endpoints = Endpoints::from_task(task, self.factory.boundary())?;
            let mut probe = self.factory.connect().await?;
            let result = self.preflight_with(&endpoints, probe.as_mut()).await;
            if let Err(e) = probe.close().await {
                debug!(error = %e, "probe session close failed");
            }
            result
        })
    }

    fn execute<'a>(
        &'a self,
        task: &'a Task,
        ctx: AttemptContext,
    ) -> BoxFuture<'a, Result<Outcome, EngineError>> {
        Box::pin(async move { self.run(task, &ctx).await })
    }
}

impl ChunkedEngine {
    async fn preflight_with(
        &self,
        endpoints: &Endpoints,
        probe: &mut dyn RemoteSession,
    ) -> Result<Preflight, FerryError> {
        let (size, mtime) = endpoints.source_info(probe).await?;
        let fp = fingerprint(&endpoints.source_key(), &endpoints.dest_key(), size, mtime);

        // An unfinished checkpoint pins the destination chosen last time.
        if let Some(cp) = self.store.load(&fp).await
            && cp.file_size == size
        {
            info!(dst = %cp.target, done = cp.bytes_completed(), "resuming from checkpoint");
            return Ok(Preflight::Proceed {
                dst: cp.target,
                bytes_total: Some(size),
                checkpoint: Some(fp),
            });
        }

        // The destination was sized up front, so a matching size proves
        // nothing once the record is gone.
        let target = endpoints.dest_key();
        if self.store.is_unfinished(&target).await {
            warn!(dst = %target, "unfinished destination without a usable checkpoint, retransferring");
            return Ok(Preflight::Proceed {
                dst: target,
                bytes_total: Some(size),
                checkpoint: Some(fp),
            });
        }

        Ok(match transfer_preflight(endpoints, probe).await? {
            Preflight::Skip => Preflight::Skip,
            Preflight::Proceed {
                dst, bytes_total, ..
            } => Preflight::Proceed {
                dst,
                bytes_total,
                checkpoint: Some(fp),
            },
        })
    }
}

async fn connect_with_retry(
    factory: &dyn SessionFactory,
    config: &ChunkedConfig,
) -> Result<Box<dyn RemoteSession>, FerryError> {
    let attempts = config.connect_retries.max(1);
    let mut attempt = 1;
    loop {
        match factory.connect().await {
            Ok(session) => return Ok(session),
            Err(e) if attempt >= attempts || !retryable_connect(&e) => return Err(e),
            Err(e) => {
                let delay = config.connect_delay(attempt);
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "connect failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Handshake rejections do not get better by retrying.
fn retryable_connect(err: &FerryError) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::AuthFailed | ErrorKind::HostkeyUnknown | ErrorKind::HostkeyChanged
    )
}

#[derive(Debug, Clone, Copy)]
struct ChunkJob {
    range: ByteRange,
    failures: u32,
}

impl ChunkJob {
    fn new(range: ByteRange) -> Self {
        Self { range, failures: 0 }
    }
}

/// State shared by the workers of one attempt.
struct Shared {
    endpoints: Endpoints,
    factory: Arc<dyn SessionFactory>,
    store: Arc<CheckpointStore>,
    config: ChunkedConfig,
    queue: Mutex<VecDeque<ChunkJob>>,
    checkpoint: tokio::sync::Mutex<Checkpoint>,
    reporter: ProgressReporter,
    ctx: AttemptContext,
    /// Set once a chunk exhausts its retries.
    abort: CancellationToken,
    fatal: Mutex<Option<FerryError>>,
    last_error: Mutex<Option<FerryError>>,
    connect_failures: AtomicUsize,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.abort.is_cancelled() || self.ctx.interrupted().is_some()
    }

    fn next_chunk(&self) -> Option<ChunkJob> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn requeue(&self, job: ChunkJob) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(job);
        }
    }

    fn remember(&self, err: FerryError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err);
        }
    }

    fn fail(&self, err: FerryError) {
        if let Ok(mut fatal) = self.fatal.lock()
            && fatal.is_none()
        {
            *fatal = Some(err);
        }
        self.abort.cancel();
    }

    /// Records a flushed chunk.
    async fn complete(&self, range: ByteRange) -> Result<(), FerryError> {
        let mut cp = self.checkpoint.lock().await;
        cp.insert(range)?;
        self.store.save(&cp).await?;
        drop(cp);
        self.reporter.add(range.len());
        Ok(())
    }
}

/// Starts workers in warm-up batches, halving the target after repeated
/// connect failures, and waits for all of them.
async fn launch_workers(shared: &Arc<Shared>, chunks: usize) {
    let config = &shared.config;
    let mut target = config.effective_connections().min(chunks.max(1));
    let batch_size = config.warmup_batch.max(1);
    let mut launched = 0;
    let mut workers = JoinSet::new();

    while launched < target {
        let batch = batch_size.min(target - launched);
        for _ in 0..batch {
            launched += 1;
            workers.spawn(worker_loop(Arc::clone(shared), launched));
        }
        debug!(launched, target, "warm-up batch started");
        if launched >= target {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.warmup_delay) => {}
            _ = shared.abort.cancelled() => break,
            _ = shared.ctx.cancel.cancelled() => break,
            _ = shared.ctx.pause.cancelled() => break,
        }

        let failures = shared.connect_failures.load(Ordering::Relaxed);
        if failures >= config.degrade_after_failures && target > config.min_workers {
            let degraded = (target / 2).max(config.min_workers).max(1);
            warn!(from = target, to = degraded, failures, "connect failures, lowering worker cap");
            target = degraded;
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "chunk worker panicked");
            shared.fail(FerryError::unknown("chunk worker panicked"));
        }
    }
}

/// One worker: owns a session and a pair of handles, reconnecting after a
/// failed chunk until the queue drains or the attempt stops.
async fn worker_loop(shared: Arc<Shared>, id: usize) {
    while !shared.stopped() {
        let mut session = match connect_with_retry(shared.factory.as_ref(), &shared.config).await {
            Ok(session) => session,
            Err(e) => {
                shared.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!(worker = id, error = %e, "worker could not connect");
                shared.remember(e);
                return;
            }
        };

        let reconnect = match open_handles(&shared.endpoints, session.as_mut()).await {
            Ok((mut src, mut dst)) => drain_queue(&shared, id, src.as_mut(), dst.as_mut()).await,
            Err(e) => {
                warn!(worker = id, error = %e, "worker could not open handles");
                shared.remember(e);
                false
            }
        };
        if let Err(e) = session.close().await {
            debug!(worker = id, error = %e, "session close failed");
        }
        if !reconnect {
            break;
        }
    }
    debug!(worker = id, "chunk worker finished");
}

/// Copies chunks until the queue is empty or the attempt stops.
///
/// Returns `true` when a chunk failed and the worker should continue on a
/// fresh session.
async fn drain_queue(
    shared: &Shared,
    id: usize,
    src: &mut dyn RemoteFile,
    dst: &mut dyn RemoteFile,
) -> bool {
    while !shared.stopped() {
        let Some(mut job) = shared.next_chunk() else {
            return false;
        };
        let range = job.range;
        match copy_range(src, dst, range.start, range.end).await {
            Ok(()) => {
                if let Err(e) = shared.complete(range).await {
                    error!(worker = id, error = %e, "could not record chunk");
                    shared.fail(e);
                    return false;
                }
            }
            Err(e) => {
                job.failures += 1;
                warn!(
                    worker = id,
                    offset = range.start,
                    failures = job.failures,
                    error = %e,
                    "chunk failed"
                );
                if job.failures > shared.config.max_chunk_retries {
                    shared.fail(e);
                    return false;
                }
                shared.requeue(job);
                shared.remember(e);
                return true;
            }
        }
    }
    false
}

async fn open_handles(
    endpoints: &Endpoints,
    session: &mut dyn RemoteSession,
) -> Result<(Box<dyn RemoteFile>, Box<dyn RemoteFile>), FerryError> {
    let src = endpoints.open_source(session).await?;
    let dst = endpoints.open_dest(session, false).await?;
    Ok((src, dst))
}

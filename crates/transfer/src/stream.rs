//! Single-stream engine: file management operations and whole-file copies.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use ferry_protocol::{
    EngineKind, ErrorKind, FerryError, NormalizedPath, RemoteEntry, RemoteSession,
    SandboxBoundary, SessionFactory, Task, TaskKind,
};

use crate::copy::copy_stream;
use crate::endpoints::{Destination, Endpoints};
use crate::engine::{AttemptContext, EngineError, Outcome, Preflight, TransferEngine};
use crate::pool::SessionPool;
use crate::progress::{DEFAULT_PROGRESS_INTERVAL, ProgressReporter};

/// Name of the scratch file used by [`ProtocolEngine::probe_writable`].
pub const WRITE_PROBE_NAME: &str = ".ferry_write_test";

/// A validated protocol operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    Transfer(Endpoints),
    Mkdir(NormalizedPath),
    Rename {
        from: NormalizedPath,
        to: NormalizedPath,
    },
    Delete(NormalizedPath),
}

impl Operation {
    fn from_task(task: &Task, boundary: &SandboxBoundary) -> Result<Self, FerryError> {
        match task.kind {
            TaskKind::Upload | TaskKind::Download => {
                Ok(Self::Transfer(Endpoints::from_task(task, boundary)?))
            }
            TaskKind::Mkdir => Ok(Self::Mkdir(boundary.check(&task.dst)?)),
            TaskKind::Rename => Ok(Self::Rename {
                from: boundary.check(&task.src)?,
                to: boundary.check(&task.dst)?,
            }),
            TaskKind::Delete => {
                let target = boundary.check(&task.src)?;
                if target.is_root() || &target == boundary.root() {
                    return Err(FerryError::validation(format!(
                        "refusing to delete {target}"
                    )));
                }
                Ok(Self::Delete(target))
            }
        }
    }
}

/// Runs every non-chunked task over pooled, exclusively owned sessions.
pub struct ProtocolEngine {
    pool: SessionPool,
    progress_interval: Duration,
}

impl ProtocolEngine {
    /// Creates an engine keeping at most `workers` idle sessions.
    pub fn new(factory: Arc<dyn SessionFactory>, workers: usize) -> Self {
        Self {
            pool: SessionPool::new(factory, workers.max(1)),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn boundary(&self) -> &SandboxBoundary {
        self.pool.boundary()
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Lists a remote directory inside the sandbox.
    pub async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, FerryError> {
        let path = self.boundary().check(path)?;
        let mut session = self.pool.acquire().await?;
        let result = session.list(&path).await;
        self.pool.release(session, result.as_ref().err());
        result
    }

    /// Stats a remote path inside the sandbox.
    pub async fn stat(&self, path: &str) -> Result<Option<RemoteEntry>, FerryError> {
        let path = self.boundary().check(path)?;
        let mut session = self.pool.acquire().await?;
        let result = session.stat(&path).await;
        self.pool.release(session, result.as_ref().err());
        result
    }

    /// Creates `path` and any missing ancestors below the sandbox root.
    pub async fn ensure_dir(&self, path: &str) -> Result<(), FerryError> {
        let path = self.boundary().check(path)?;
        let mut session = self.pool.acquire().await?;
        let result = ensure_dir_all(session.as_mut(), &path, self.boundary()).await;
        self.pool.release(session, result.as_ref().err());
        result
    }

    /// Checks whether `dir` accepts new files by creating and removing a
    /// scratch file.
    pub async fn probe_writable(&self, dir: &str) -> Result<bool, FerryError> {
        let dir = self.boundary().check(dir)?;
        let probe = dir.join(WRITE_PROBE_NAME)?;
        let mut session = self.pool.acquire().await?;
        let result = write_probe(session.as_mut(), &probe).await;
        self.pool.release(session, result.as_ref().err());
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                debug!(dir = %dir, "directory not writable");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn run(
        &self,
        op: &Operation,
        session: &mut dyn RemoteSession,
        ctx: &AttemptContext,
    ) -> Result<Outcome, FerryError> {
        match op {
            Operation::Transfer(endpoints) => {
                let reporter =
                    ProgressReporter::new(ctx.progress.clone(), self.progress_interval, 0);
                let result = copy_whole(endpoints, session, ctx, &reporter).await;
                reporter.flush();
                result
            }
            Operation::Mkdir(path) => {
                make_dir(session, path).await?;
                Ok(Outcome::Completed)
            }
            Operation::Rename { from, to } => {
                session.rename(from, to).await?;
                Ok(Outcome::Completed)
            }
            Operation::Delete(target) => delete(session, target, self.boundary(), ctx).await,
        }
    }
}

impl TransferEngine for ProtocolEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Protocol
    }

    fn preflight<'a>(&'a self, task: &'a Task) -> BoxFuture<'a, Result<Preflight, FerryError>> {
        Box::pin(async move {
            let op = Operation::from_task(task, self.boundary())?;
            let Operation::Transfer(endpoints) = op else {
                return Ok(Preflight::Proceed {
                    dst: task.dst.clone(),
                    bytes_total: None,
                    checkpoint: None,
                });
            };

            let mut session = self.pool.acquire().await?;
            let result = transfer_preflight(&endpoints, session.as_mut()).await;
            self.pool.release(session, result.as_ref().err());
            result
        })
    }

    fn execute<'a>(
        &'a self,
        task: &'a Task,
        ctx: AttemptContext,
    ) -> BoxFuture<'a, Result<Outcome, EngineError>> {
        Box::pin(async move {
            let op = Operation::from_task(task, self.boundary())?;
            if let Some(outcome) = ctx.interrupted() {
                return Ok(outcome);
            }

            let mut session = self.pool.acquire().await?;
            let result = self.run(&op, session.as_mut(), &ctx).await;
            self.pool.release(session, result.as_ref().err());

            match &result {
                Ok(outcome) => debug!(task = %task.id, kind = %task.kind, ?outcome, "protocol op finished"),
                Err(e) => warn!(task = %task.id, kind = %task.kind, error = %e, "protocol op failed"),
            }
            Ok(result?)
        })
    }
}

/// Shared by both engines: skip identical destinations, rename on conflict.
pub(crate) async fn transfer_preflight(
    endpoints: &Endpoints,
    session: &mut dyn RemoteSession,
) -> Result<Preflight, FerryError> {
    let (size, _) = endpoints.source_info(session).await?;
    let dst = match endpoints.destination(session, size).await? {
        Destination::Identical => {
            info!(dst = %endpoints.dest_key(), size, "destination identical, skipping");
            return Ok(Preflight::Skip);
        }
        Destination::Missing => endpoints.dest_key(),
        Destination::Conflict => {
            let free = endpoints.free_destination(session).await?;
            info!(dst = %endpoints.dest_key(), renamed = %free, "destination differs, renaming");
            free
        }
    };
    Ok(Preflight::Proceed {
        dst,
        bytes_total: Some(size),
        checkpoint: None,
    })
}

/// Copies a whole file, truncating the destination first.
pub(crate) async fn copy_whole(
    endpoints: &Endpoints,
    session: &mut dyn RemoteSession,
    ctx: &AttemptContext,
    reporter: &ProgressReporter,
) -> Result<Outcome, FerryError> {
    let mut src = endpoints.open_source(session).await?;
    let mut dst = endpoints.open_dest(session, true).await?;
    let stopped = copy_stream(src.as_mut(), dst.as_mut(), ctx, reporter).await?;
    drop(dst);
    drop(src);

    match stopped {
        None => Ok(Outcome::Completed),
        Some(Outcome::Canceled) => {
            if let Err(e) = endpoints.remove_dest(session).await {
                warn!(dst = %endpoints.dest_key(), error = %e, "could not remove partial file");
            }
            Ok(Outcome::Canceled)
        }
        Some(outcome) => Ok(outcome),
    }
}

async fn make_dir(session: &mut dyn RemoteSession, path: &NormalizedPath) -> Result<(), FerryError> {
    match session.stat(path).await? {
        Some(entry) if entry.is_dir() => Ok(()),
        Some(_) => Err(FerryError::validation(format!(
            "{path} exists and is not a directory"
        ))),
        None => session.mkdir(path).await,
    }
}

/// Creates missing directories from the sandbox root down to `path`.
pub async fn ensure_dir_all(
    session: &mut dyn RemoteSession,
    path: &NormalizedPath,
    boundary: &SandboxBoundary,
) -> Result<(), FerryError> {
    let mut missing = Vec::new();
    let mut cursor = Some(path.clone());
    while let Some(dir) = cursor {
        match session.stat(&dir).await? {
            Some(entry) if entry.is_dir() => break,
            Some(_) => {
                return Err(FerryError::validation(format!(
                    "{dir} exists and is not a directory"
                )));
            }
            None => {
                cursor = if &dir == boundary.root() {
                    None
                } else {
                    dir.parent()
                };
                missing.push(dir);
            }
        }
    }
    for dir in missing.into_iter().rev() {
        session.mkdir(&dir).await?;
    }
    Ok(())
}

async fn write_probe(
    session: &mut dyn RemoteSession,
    probe: &NormalizedPath,
) -> Result<(), FerryError> {
    let mut file = session.open_write(probe, true).await?;
    file.write_at(0, b"ferry").await?;
    file.flush().await?;
    drop(file);
    session.remove_file(probe).await
}

/// Removes a file, or a directory tree depth-first.
async fn delete(
    session: &mut dyn RemoteSession,
    target: &NormalizedPath,
    boundary: &SandboxBoundary,
    ctx: &AttemptContext,
) -> Result<Outcome, FerryError> {
    let first = match session.remove_file(target).await {
        Ok(()) => return Ok(Outcome::Completed),
        Err(e) => e,
    };
    match session.stat(target).await? {
        Some(entry) if entry.is_dir() => {
            let outcome = delete_tree(session, target, boundary, ctx).await?;
            info!(path = %target, ?outcome, "recursive delete finished");
            Ok(outcome)
        }
        Some(_) => Err(first),
        None => Err(FerryError::new(
            ErrorKind::PathNotFound,
            format!("{target} does not exist"),
        )),
    }
}

async fn delete_tree(
    session: &mut dyn RemoteSession,
    root: &NormalizedPath,
    boundary: &SandboxBoundary,
    ctx: &AttemptContext,
) -> Result<Outcome, FerryError> {
    // (directory, children already removed)
    let mut stack = vec![(root.clone(), false)];
    while let Some((dir, emptied)) = stack.pop() {
        if let Some(outcome) = ctx.interrupted() {
            return Ok(outcome);
        }
        if emptied {
            session.remove_dir(&dir).await?;
            continue;
        }
        stack.push((dir.clone(), true));
        for entry in session.list(&dir).await? {
            let child = boundary.check(&entry.path)?;
            if child == dir || !child.starts_with(root) {
                return Err(FerryError::validation(format!(
                    "listing of {dir} returned foreign path {child}"
                )));
            }
            if entry.is_dir() {
                stack.push((child, false));
            } else {
                session.remove_file(&child).await?;
            }
        }
    }
    Ok(Outcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_file_ops::DirSessionFactory;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        local: TempDir,
        remote: TempDir,
        factory: Arc<DirSessionFactory>,
        engine: ProtocolEngine,
    }

    fn fixture(root: &str) -> Fixture {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let boundary = SandboxBoundary::new(root).unwrap();
        std::fs::create_dir_all(remote.path().join(root.trim_start_matches('/'))).unwrap();
        let factory = Arc::new(DirSessionFactory::new(remote.path(), boundary));
        let engine = ProtocolEngine::new(factory.clone(), 4);
        Fixture {
            local,
            remote,
            factory,
            engine,
        }
    }

    fn ctx() -> (AttemptContext, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        (
            AttemptContext::new(Arc::new(move |n| s.lock().unwrap().push(n))),
            seen,
        )
    }

    fn upload(src: &std::path::Path, dst: &str) -> Task {
        Task::new(
            TaskKind::Upload,
            EngineKind::Protocol,
            src.to_string_lossy(),
            dst,
            None,
        )
    }

    #[tokio::test]
    async fn upload_and_download_round_trip() {
        let fx = fixture("/data");
        let src = fx.local.path().join("weights.bin");
        let content: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let task = upload(&src, "/data/weights.bin");
        let Preflight::Proceed { dst, bytes_total, .. } =
            fx.engine.preflight(&task).await.unwrap()
        else {
            panic!("expected proceed");
        };
        assert_eq!(dst, "/data/weights.bin");
        assert_eq!(bytes_total, Some(content.len() as u64));

        let (c, seen) = ctx();
        assert_eq!(fx.engine.execute(&task, c).await.unwrap(), Outcome::Completed);
        let remote_file = fx.remote.path().join("data/weights.bin");
        assert_eq!(std::fs::read(&remote_file).unwrap(), content);
        assert_eq!(*seen.lock().unwrap().last().unwrap(), content.len() as u64);

        let back = fx.local.path().join("nested/back.bin");
        let task = Task::new(
            TaskKind::Download,
            EngineKind::Protocol,
            "/data/weights.bin",
            back.to_string_lossy(),
            None,
        );
        let (c, _) = ctx();
        assert_eq!(fx.engine.execute(&task, c).await.unwrap(), Outcome::Completed);
        assert_eq!(std::fs::read(&back).unwrap(), content);
    }

    #[tokio::test]
    async fn escaping_path_rejected_before_connect() {
        let fx = fixture("/root/autodl-tmp");
        let src = fx.local.path().join("passwd");
        std::fs::write(&src, b"x").unwrap();
        let task = upload(&src, "/root/autodl-tmp/../../etc/passwd");

        let err = fx.engine.preflight(&task).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        let (c, _) = ctx();
        let err = fx.engine.execute(&task, c).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert_eq!(fx.factory.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn identical_destination_is_skipped_untouched() {
        let fx = fixture("/data");
        let src = fx.local.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();
        let remote_file = fx.remote.path().join("data/a.txt");
        std::fs::write(&remote_file, b"HELLO").unwrap();
        let before = std::fs::metadata(&remote_file).unwrap().modified().unwrap();

        let task = upload(&src, "/data/a.txt");
        assert_eq!(fx.engine.preflight(&task).await.unwrap(), Preflight::Skip);
        let after = std::fs::metadata(&remote_file).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(std::fs::read(&remote_file).unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn different_destination_gets_suffix() {
        let fx = fixture("/data");
        let src = fx.local.path().join("a.txt");
        std::fs::write(&src, b"hello world").unwrap();
        std::fs::write(fx.remote.path().join("data/a.txt"), b"old").unwrap();

        let task = upload(&src, "/data/a.txt");
        let Preflight::Proceed { dst, .. } = fx.engine.preflight(&task).await.unwrap() else {
            panic!("expected proceed");
        };
        assert_eq!(dst, "/data/a_1.txt");
    }

    #[tokio::test]
    async fn mkdir_is_idempotent() {
        let fx = fixture("/data");
        let task = Task::new(TaskKind::Mkdir, EngineKind::Protocol, "", "/data/sub", None);
        let (c, _) = ctx();
        assert_eq!(fx.engine.execute(&task, c.clone()).await.unwrap(), Outcome::Completed);
        assert_eq!(fx.engine.execute(&task, c).await.unwrap(), Outcome::Completed);
        assert!(fx.remote.path().join("data/sub").is_dir());
    }

    #[tokio::test]
    async fn rename_inside_sandbox() {
        let fx = fixture("/data");
        std::fs::write(fx.remote.path().join("data/a"), b"1").unwrap();
        let task = Task::new(TaskKind::Rename, EngineKind::Protocol, "/data/a", "/data/b", None);
        let (c, _) = ctx();
        fx.engine.execute(&task, c).await.unwrap();
        assert!(fx.remote.path().join("data/b").exists());

        let task = Task::new(TaskKind::Rename, EngineKind::Protocol, "/data/b", "/tmp/b", None);
        let (c, _) = ctx();
        let err = fx.engine.execute(&task, c).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn recursive_delete() {
        let fx = fixture("/data");
        let base = fx.remote.path().join("data/tree");
        std::fs::create_dir_all(base.join("a/b")).unwrap();
        std::fs::write(base.join("top.txt"), b"1").unwrap();
        std::fs::write(base.join("a/mid.txt"), b"2").unwrap();
        std::fs::write(base.join("a/b/leaf.txt"), b"3").unwrap();

        let task = Task::new(TaskKind::Delete, EngineKind::Protocol, "/data/tree", "", None);
        let (c, _) = ctx();
        assert_eq!(fx.engine.execute(&task, c).await.unwrap(), Outcome::Completed);
        assert!(!base.exists());
        assert!(fx.remote.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn delete_refuses_root_and_sandbox_root() {
        let fx = fixture("/data");
        for target in ["/", "/data", "/data/x/.."] {
            let task = Task::new(TaskKind::Delete, EngineKind::Protocol, target, "", None);
            let (c, _) = ctx();
            let err = fx.engine.execute(&task, c).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationFailed, "target {target}");
        }
        assert_eq!(fx.factory.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let fx = fixture("/data");
        let task = Task::new(TaskKind::Delete, EngineKind::Protocol, "/data/none", "", None);
        let (c, _) = ctx();
        let err = fx.engine.execute(&task, c).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathNotFound);
    }

    #[tokio::test]
    async fn canceled_upload_leaves_no_partial_file() {
        let fx = fixture("/data");
        let src = fx.local.path().join("a.bin");
        std::fs::write(&src, vec![7u8; 10]).unwrap();
        let task = upload(&src, "/data/a.bin");
        let (c, _) = ctx();
        c.cancel.cancel();
        assert_eq!(fx.engine.execute(&task, c).await.unwrap(), Outcome::Canceled);
        assert!(!fx.remote.path().join("data/a.bin").exists());
    }

    #[tokio::test]
    async fn list_stat_and_ensure_dir() {
        let fx = fixture("/data");
        fx.engine.ensure_dir("/data/x/y/z").await.unwrap();
        assert!(fx.remote.path().join("data/x/y/z").is_dir());

        let entries = fx.engine.list("/data/x").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "y");
        assert!(fx.engine.stat("/data/nothing").await.unwrap().is_none());
        assert!(fx.engine.list("/etc").await.is_err());
    }

    #[tokio::test]
    async fn probe_writable_cleans_up() {
        let fx = fixture("/data");
        assert!(fx.engine.probe_writable("/data").await.unwrap());
        assert!(!fx.remote.path().join("data").join(WRITE_PROBE_NAME).exists());
    }
}

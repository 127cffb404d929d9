//! Fault injection for exercising retry and resume paths.
//!
//! [`FaultySessionFactory`] wraps a [`DirSessionFactory`] and consults a
//! shared [`FaultPlan`] on every connect and every remote write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use ferry_file_ops::DirSessionFactory;
use ferry_protocol::{
    ErrorKind, FerryError, NormalizedPath, RemoteEntry, RemoteFile, RemoteSession,
    SandboxBoundary, SessionFactory,
};

#[derive(Default)]
struct ConnectFaults {
    skip: usize,
    fail: usize,
    kind: Option<ErrorKind>,
}

/// Which operations fail, and a log of remote writes.
#[derive(Default)]
pub struct FaultPlan {
    kills: Mutex<HashMap<u64, u32>>,
    writes: Mutex<Vec<u64>>,
    connects: Mutex<ConnectFaults>,
}

impl FaultPlan {
    /// Makes the next `times` writes at `offset` land half their data and
    /// then fail with `REMOTE_DISCONNECT`.
    pub fn kill_write(&self, offset: u64, times: u32) {
        self.kills.lock().unwrap().insert(offset, times);
    }

    /// Lets `skip` connects through, then fails the following `count`.
    pub fn fail_connects_after(&self, skip: usize, count: usize) {
        self.fail_connects_with(skip, count, ErrorKind::RemoteDisconnect);
    }

    pub fn fail_connects_with(&self, skip: usize, count: usize, kind: ErrorKind) {
        *self.connects.lock().unwrap() = ConnectFaults {
            skip,
            fail: count,
            kind: Some(kind),
        };
    }

    /// Number of remote writes issued at `offset`.
    pub fn writes_at(&self, offset: u64) -> usize {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|&&o| o == offset)
            .count()
    }

    /// Offsets of every remote write, in issue order.
    pub fn write_offsets(&self) -> Vec<u64> {
        self.writes.lock().unwrap().clone()
    }

    /// Forgets all faults and the write log.
    pub fn clear(&self) {
        self.kills.lock().unwrap().clear();
        self.writes.lock().unwrap().clear();
        *self.connects.lock().unwrap() = ConnectFaults::default();
    }

    fn on_connect(&self) -> Result<(), FerryError> {
        let mut c = self.connects.lock().unwrap();
        if c.skip > 0 {
            c.skip -= 1;
            return Ok(());
        }
        if c.fail > 0 {
            c.fail -= 1;
            let kind = c.kind.unwrap_or(ErrorKind::RemoteDisconnect);
            return Err(FerryError::new(kind, "injected connect failure"));
        }
        Ok(())
    }

    fn on_write(&self, offset: u64) -> bool {
        self.writes.lock().unwrap().push(offset);
        let mut kills = self.kills.lock().unwrap();
        match kills.get_mut(&offset) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

/// A [`SessionFactory`] over a local mount that follows a [`FaultPlan`].
pub struct FaultySessionFactory {
    inner: DirSessionFactory,
    plan: Arc<FaultPlan>,
}

impl FaultySessionFactory {
    pub fn new(mount: impl Into<PathBuf>, boundary: SandboxBoundary, plan: Arc<FaultPlan>) -> Self {
        Self {
            inner: DirSessionFactory::new(mount, boundary),
            plan,
        }
    }

    /// Sessions successfully opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened()
    }
}

impl SessionFactory for FaultySessionFactory {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn RemoteSession>, FerryError>> {
        Box::pin(async move {
            self.plan.on_connect()?;
            let inner = self.inner.connect().await?;
            Ok(Box::new(FaultySession {
                inner,
                plan: Arc::clone(&self.plan),
            }) as Box<dyn RemoteSession>)
        })
    }

    fn boundary(&self) -> &SandboxBoundary {
        self.inner.boundary()
    }
}

struct FaultySession {
    inner: Box<dyn RemoteSession>,
    plan: Arc<FaultPlan>,
}

impl RemoteSession for FaultySession {
    fn stat<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Option<RemoteEntry>, FerryError>> {
        self.inner.stat(path)
    }

    fn list<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Vec<RemoteEntry>, FerryError>> {
        self.inner.list(path)
    }

    fn mkdir<'a>(&'a mut self, path: &'a NormalizedPath) -> BoxFuture<'a, Result<(), FerryError>> {
        self.inner.mkdir(path)
    }

    fn remove_file<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        self.inner.remove_file(path)
    }

    fn remove_dir<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        self.inner.remove_dir(path)
    }

    fn rename<'a>(
        &'a mut self,
        from: &'a NormalizedPath,
        to: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        self.inner.rename(from, to)
    }

    fn open_read<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteFile>, FerryError>> {
        self.inner.open_read(path)
    }

    fn open_write<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
        truncate: bool,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteFile>, FerryError>> {
        Box::pin(async move {
            let inner = self.inner.open_write(path, truncate).await?;
            Ok(Box::new(FaultyFile {
                inner,
                plan: Arc::clone(&self.plan),
            }) as Box<dyn RemoteFile>)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), FerryError>> {
        self.inner.close()
    }
}

struct FaultyFile {
    inner: Box<dyn RemoteFile>,
    plan: Arc<FaultPlan>,
}

impl RemoteFile for FaultyFile {
    fn read_at(&mut self, offset: u64, len: usize) -> BoxFuture<'_, Result<Vec<u8>, FerryError>> {
        self.inner.read_at(offset, len)
    }

    fn write_at<'a>(
        &'a mut self,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        Box::pin(async move {
            if self.plan.on_write(offset) {
                self.inner.write_at(offset, &data[..data.len() / 2]).await?;
                return Err(FerryError::new(
                    ErrorKind::RemoteDisconnect,
                    "connection reset mid-chunk",
                ));
            }
            self.inner.write_at(offset, data).await
        })
    }

    fn set_len(&mut self, len: u64) -> BoxFuture<'_, Result<(), FerryError>> {
        self.inner.set_len(len)
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<(), FerryError>> {
        self.inner.flush()
    }
}

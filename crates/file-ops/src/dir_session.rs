//! A session backend that treats a local directory as the remote filesystem.
//!
//! Remote path `/a/b` maps to `<mount>/a/b`. This serves targets that are
//! already mounted locally (NFS, sshfs, a staging disk) and gives the engines
//! a real filesystem to run against in tests.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use ferry_protocol::{
    EntryKind, ErrorKind, FerryError, NormalizedPath, RemoteEntry, RemoteFile, RemoteSession,
    SandboxBoundary, SessionFactory,
};
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Creates [`DirSession`]s rooted at one mount point.
pub struct DirSessionFactory {
    mount: PathBuf,
    boundary: SandboxBoundary,
    opened: AtomicUsize,
}

impl DirSessionFactory {
    pub fn new(mount: impl Into<PathBuf>, boundary: SandboxBoundary) -> Self {
        Self {
            mount: mount.into(),
            boundary,
            opened: AtomicUsize::new(0),
        }
    }

    /// Number of sessions handed out so far.
    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Local location backing a remote path.
    pub fn local_path(&self, remote: &NormalizedPath) -> PathBuf {
        resolve(&self.mount, remote)
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }
}

impl SessionFactory for DirSessionFactory {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn RemoteSession>, FerryError>> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(&self.mount).await.map_err(|e| {
                FerryError::new(
                    ErrorKind::RemoteDisconnect,
                    format!("mount {} unavailable: {e}", self.mount.display()),
                )
            })?;
            if !meta.is_dir() {
                return Err(FerryError::new(
                    ErrorKind::RemoteDisconnect,
                    format!("mount {} is not a directory", self.mount.display()),
                ));
            }
            let n = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(mount = %self.mount.display(), session = n, "session opened");
            Ok(Box::new(DirSession {
                mount: self.mount.clone(),
                closed: false,
            }) as Box<dyn RemoteSession>)
        })
    }

    fn boundary(&self) -> &SandboxBoundary {
        &self.boundary
    }
}

fn resolve(mount: &Path, remote: &NormalizedPath) -> PathBuf {
    let rel = remote.as_str().trim_start_matches('/');
    if rel.is_empty() {
        mount.to_path_buf()
    } else {
        mount.join(rel)
    }
}

fn io_error(op: &str, path: &NormalizedPath, err: std::io::Error) -> FerryError {
    FerryError::from(err).context(format!("{op} {path}"))
}

/// One session over a mounted directory.
pub struct DirSession {
    mount: PathBuf,
    closed: bool,
}

impl DirSession {
    fn ensure_open(&self) -> Result<(), FerryError> {
        if self.closed {
            Err(FerryError::new(ErrorKind::RemoteDisconnect, "session closed"))
        } else {
            Ok(())
        }
    }

    fn local(&self, path: &NormalizedPath) -> PathBuf {
        resolve(&self.mount, path)
    }
}

fn entry_from_metadata(name: String, path: String, meta: &std::fs::Metadata) -> RemoteEntry {
    let file_type = meta.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode())
    };
    #[cfg(not(unix))]
    let mode = None;

    RemoteEntry {
        name,
        path,
        kind,
        size: if kind == EntryKind::File { meta.len() } else { 0 },
        mtime,
        mode,
    }
}

impl RemoteSession for DirSession {
    fn stat<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Option<RemoteEntry>, FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            match tokio::fs::symlink_metadata(self.local(path)).await {
                Ok(meta) => Ok(Some(entry_from_metadata(
                    path.basename().to_string(),
                    path.to_string(),
                    &meta,
                ))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_error("stat", path, e)),
            }
        })
    }

    fn list<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Vec<RemoteEntry>, FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut dir = tokio::fs::read_dir(self.local(path))
                .await
                .map_err(|e| io_error("list", path, e))?;
            let mut entries = Vec::new();
            while let Some(entry) = dir.next_entry().await.map_err(|e| io_error("list", path, e))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let meta = tokio::fs::symlink_metadata(entry.path())
                    .await
                    .map_err(|e| io_error("list", path, e))?;
                let child = path.join(&name)?;
                entries.push(entry_from_metadata(name, child.into_string(), &meta));
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        })
    }

    fn mkdir<'a>(&'a mut self, path: &'a NormalizedPath) -> BoxFuture<'a, Result<(), FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            tokio::fs::create_dir(self.local(path))
                .await
                .map_err(|e| io_error("mkdir", path, e))
        })
    }

    fn remove_file<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            tokio::fs::remove_file(self.local(path))
                .await
                .map_err(|e| io_error("remove", path, e))
        })
    }

    fn remove_dir<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            tokio::fs::remove_dir(self.local(path))
                .await
                .map_err(|e| io_error("rmdir", path, e))
        })
    }

    fn rename<'a>(
        &'a mut self,
        from: &'a NormalizedPath,
        to: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            tokio::fs::rename(self.local(from), self.local(to))
                .await
                .map_err(|e| io_error("rename", from, e))
        })
    }

    fn open_read<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteFile>, FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let file = DirFile::open(&self.local(path)).await?;
            Ok(Box::new(file) as Box<dyn RemoteFile>)
        })
    }

    fn open_write<'a>(
        &'a mut self,
        path: &'a NormalizedPath,
        truncate: bool,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteFile>, FerryError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let file = DirFile::create(&self.local(path), truncate).await?;
            Ok(Box::new(file) as Box<dyn RemoteFile>)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), FerryError>> {
        Box::pin(async move {
            self.closed = true;
            Ok(())
        })
    }
}

/// An open file inside the mount.
///
/// Also used directly for the local side of a transfer, so both ends of a
/// copy speak [`RemoteFile`].
pub struct DirFile {
    file: tokio::fs::File,
}

impl DirFile {
    /// Opens an existing local file for positioned reads.
    pub async fn open(path: &Path) -> Result<Self, FerryError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| FerryError::from(e).context(format!("open {}", path.display())))?;
        Ok(Self { file })
    }

    /// Opens a local file for positioned writes, creating it if missing.
    pub async fn create(path: &Path, truncate: bool) -> Result<Self, FerryError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .await
            .map_err(|e| FerryError::from(e).context(format!("create {}", path.display())))?;
        Ok(Self { file })
    }
}

impl RemoteFile for DirFile {
    fn read_at(&mut self, offset: u64, len: usize) -> BoxFuture<'_, Result<Vec<u8>, FerryError>> {
        Box::pin(async move {
            self.file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = self.file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    fn write_at<'a>(
        &'a mut self,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), FerryError>> {
        Box::pin(async move {
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.file.write_all(data).await?;
            Ok(())
        })
    }

    fn set_len(&mut self, len: u64) -> BoxFuture<'_, Result<(), FerryError>> {
        Box::pin(async move {
            self.file.set_len(len).await?;
            Ok(())
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, Result<(), FerryError>> {
        Box::pin(async move {
            self.file.flush().await?;
            self.file.sync_data().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::normalize;
    use tempfile::TempDir;

    fn factory(dir: &TempDir) -> DirSessionFactory {
        DirSessionFactory::new(dir.path(), SandboxBoundary::new("/data").unwrap())
    }

    #[tokio::test]
    async fn stat_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let f = factory(&dir);
        let mut s = f.connect().await.unwrap();
        let p = normalize("/data/none").unwrap();
        assert!(s.stat(&p).await.unwrap().is_none());
        assert_eq!(f.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn mkdir_write_read_list() {
        let dir = TempDir::new().unwrap();
        let f = factory(&dir);
        let mut s = f.connect().await.unwrap();

        let root = normalize("/data").unwrap();
        s.mkdir(&root).await.unwrap();
        let file = root.join("a.bin").unwrap();

        let mut w = s.open_write(&file, true).await.unwrap();
        w.write_at(4, b"WXYZ").await.unwrap();
        w.write_at(0, b"ABCD").await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        let mut r = s.open_read(&file).await.unwrap();
        assert_eq!(r.read_at(2, 4).await.unwrap(), b"CDWX");
        assert_eq!(r.read_at(6, 10).await.unwrap(), b"YZ");
        assert!(r.read_at(8, 4).await.unwrap().is_empty());

        let entries = s.list(&root).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/data/a.bin");
        assert!(entries[0].is_file());
        assert_eq!(entries[0].size, 8);

        let stat = s.stat(&root).await.unwrap().unwrap();
        assert!(stat.is_dir());
    }

    #[tokio::test]
    async fn set_len_preallocates() {
        let dir = TempDir::new().unwrap();
        let f = factory(&dir);
        let mut s = f.connect().await.unwrap();
        let file = normalize("/big.bin").unwrap();
        let mut w = s.open_write(&file, true).await.unwrap();
        w.set_len(1024).await.unwrap();
        drop(w);
        assert_eq!(std::fs::metadata(dir.path().join("big.bin")).unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn rename_and_remove() {
        let dir = TempDir::new().unwrap();
        let f = factory(&dir);
        let mut s = f.connect().await.unwrap();
        std::fs::write(dir.path().join("x"), b"1").unwrap();

        let x = normalize("/x").unwrap();
        let y = normalize("/y").unwrap();
        s.rename(&x, &y).await.unwrap();
        assert!(s.stat(&x).await.unwrap().is_none());
        s.remove_file(&y).await.unwrap();
        assert!(s.stat(&y).await.unwrap().is_none());

        let err = s.remove_file(&y).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathNotFound);
    }

    #[tokio::test]
    async fn closed_session_refuses_work() {
        let dir = TempDir::new().unwrap();
        let f = factory(&dir);
        let mut s = f.connect().await.unwrap();
        s.close().await.unwrap();
        let err = s.stat(&normalize("/").unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteDisconnect);
    }

    #[tokio::test]
    async fn missing_mount_is_disconnect() {
        let f = DirSessionFactory::new("/nonexistent/mount", SandboxBoundary::new("/").unwrap());
        let err = f.connect().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RemoteDisconnect);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stat_reports_symlinks() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/etc", dir.path().join("link")).unwrap();
        let f = factory(&dir);
        let mut s = f.connect().await.unwrap();
        let entry = s.stat(&normalize("/link").unwrap()).await.unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::Symlink);
    }
}

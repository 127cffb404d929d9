//! Source and destination of a single-file transfer task.

use std::path::{Path, PathBuf};

use ferry_file_ops::DirFile;
use ferry_protocol::{
    ErrorKind, FerryError, NormalizedPath, RemoteFile, RemoteSession, SandboxBoundary, Task,
    TaskKind,
};

use crate::conflict;

/// State of the destination before a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Missing,
    /// A regular file of the same size as the source.
    Identical,
    /// Something else occupies the name.
    Conflict,
}

/// Validated endpoints of an upload or download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoints {
    Upload {
        local: PathBuf,
        remote: NormalizedPath,
    },
    Download {
        remote: NormalizedPath,
        local: PathBuf,
    },
}

impl Endpoints {
    /// Validates the remote side of `task` against `boundary`.
    ///
    /// Runs before any session is opened.
    pub fn from_task(task: &Task, boundary: &SandboxBoundary) -> Result<Self, FerryError> {
        match task.kind {
            TaskKind::Upload => Ok(Self::Upload {
                local: local_path(&task.src)?,
                remote: boundary.check(&task.dst)?,
            }),
            TaskKind::Download => Ok(Self::Download {
                remote: boundary.check(&task.src)?,
                local: local_path(&task.dst)?,
            }),
            other => Err(FerryError::validation(format!(
                "{other} is not a file transfer"
            ))),
        }
    }

    pub fn remote(&self) -> &NormalizedPath {
        match self {
            Self::Upload { remote, .. } | Self::Download { remote, .. } => remote,
        }
    }

    pub fn local(&self) -> &Path {
        match self {
            Self::Upload { local, .. } | Self::Download { local, .. } => local,
        }
    }

    /// Source path as written into task records.
    pub fn source_key(&self) -> String {
        match self {
            Self::Upload { local, .. } => local.to_string_lossy().into_owned(),
            Self::Download { remote, .. } => remote.to_string(),
        }
    }

    /// Destination path as written into task records.
    pub fn dest_key(&self) -> String {
        match self {
            Self::Upload { remote, .. } => remote.to_string(),
            Self::Download { local, .. } => local.to_string_lossy().into_owned(),
        }
    }

    /// Size and modification time of the source.
    pub async fn source_info(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<(u64, Option<i64>), FerryError> {
        match self {
            Self::Upload { local, .. } => {
                let meta = tokio::fs::symlink_metadata(local)
                    .await
                    .map_err(|e| FerryError::from(e).context(format!("stat {}", local.display())))?;
                if meta.file_type().is_symlink() {
                    return Err(FerryError::validation(format!(
                        "{} is a symbolic link",
                        local.display()
                    )));
                }
                if !meta.is_file() {
                    return Err(FerryError::validation(format!(
                        "{} is not a regular file",
                        local.display()
                    )));
                }
                Ok((meta.len(), modified_secs(&meta)))
            }
            Self::Download { remote, .. } => match session.stat(remote).await? {
                Some(entry) if entry.is_file() => Ok((entry.size, entry.mtime)),
                Some(_) => Err(FerryError::validation(format!(
                    "{remote} is not a regular file"
                ))),
                None => Err(FerryError::new(
                    ErrorKind::PathNotFound,
                    format!("{remote} does not exist"),
                )),
            },
        }
    }

    /// Current size of the destination if it is a regular file.
    pub async fn dest_size(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<Option<u64>, FerryError> {
        match self {
            Self::Upload { remote, .. } => Ok(session
                .stat(remote)
                .await?
                .filter(|e| e.is_file())
                .map(|e| e.size)),
            Self::Download { local, .. } => match tokio::fs::metadata(local).await {
                Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Compares the destination with a source of `size` bytes.
    pub async fn destination(
        &self,
        session: &mut dyn RemoteSession,
        size: u64,
    ) -> Result<Destination, FerryError> {
        let exists = match self {
            Self::Upload { remote, .. } => session.stat(remote).await?.is_some(),
            Self::Download { local, .. } => tokio::fs::try_exists(local).await?,
        };
        if !exists {
            return Ok(Destination::Missing);
        }
        match self.dest_size(session).await? {
            Some(existing) if existing == size => Ok(Destination::Identical),
            _ => Ok(Destination::Conflict),
        }
    }

    /// Picks the first unused suffixed destination name.
    pub async fn free_destination(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<String, FerryError> {
        match self {
            Self::Upload { remote, .. } => Ok(conflict::resolve_remote(session, remote)
                .await?
                .into_string()),
            Self::Download { local, .. } => Ok(conflict::resolve_local(local)
                .await?
                .to_string_lossy()
                .into_owned()),
        }
    }

    pub async fn open_source(
        &self,
        session: &mut dyn RemoteSession,
    ) -> Result<Box<dyn RemoteFile>, FerryError> {
        match self {
            Self::Upload { local, .. } => {
                Ok(Box::new(DirFile::open(local).await?) as Box<dyn RemoteFile>)
            }
            Self::Download { remote, .. } => session.open_read(remote).await,
        }
    }

    /// Opens the destination for writing, creating local parents as needed.
    pub async fn open_dest(
        &self,
        session: &mut dyn RemoteSession,
        truncate: bool,
    ) -> Result<Box<dyn RemoteFile>, FerryError> {
        match self {
            Self::Upload { remote, .. } => session.open_write(remote, truncate).await,
            Self::Download { local, .. } => {
                if let Some(parent) = local.parent()
                    && !parent.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Ok(Box::new(DirFile::create(local, truncate).await?) as Box<dyn RemoteFile>)
            }
        }
    }

    /// Best-effort removal of a partially written destination.
    pub async fn remove_dest(&self, session: &mut dyn RemoteSession) -> Result<(), FerryError> {
        match self {
            Self::Upload { remote, .. } => session.remove_file(remote).await,
            Self::Download { local, .. } => Ok(tokio::fs::remove_file(local).await?),
        }
    }
}

fn local_path(raw: &str) -> Result<PathBuf, FerryError> {
    if raw.trim().is_empty() {
        return Err(FerryError::validation("local path is empty"));
    }
    Ok(PathBuf::from(raw))
}

fn modified_secs(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_file_ops::DirSessionFactory;
    use ferry_protocol::{EngineKind, SessionFactory};
    use tempfile::TempDir;

    #[test]
    fn upload_validates_remote_side() {
        let boundary = SandboxBoundary::new("/root/autodl-tmp").unwrap();
        let task = Task::new(
            TaskKind::Upload,
            EngineKind::Protocol,
            "/home/me/passwd",
            "/root/autodl-tmp/../../etc/passwd",
            None,
        );
        let err = Endpoints::from_task(&task, &boundary).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);

        let task = Task::new(
            TaskKind::Upload,
            EngineKind::Protocol,
            "/home/me/a.bin",
            "/root/autodl-tmp/./x//a.bin",
            None,
        );
        let ep = Endpoints::from_task(&task, &boundary).unwrap();
        assert_eq!(ep.dest_key(), "/root/autodl-tmp/x/a.bin");
        assert_eq!(ep.source_key(), "/home/me/a.bin");
    }

    #[test]
    fn non_transfer_kinds_rejected() {
        let boundary = SandboxBoundary::new("/").unwrap();
        let task = Task::new(TaskKind::Mkdir, EngineKind::Protocol, "", "/a", None);
        assert!(Endpoints::from_task(&task, &boundary).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_source_is_rejected() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let real = local.path().join("real.bin");
        let link = local.path().join("link.bin");
        std::fs::write(&real, b"payload").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let factory = DirSessionFactory::new(remote.path(), SandboxBoundary::new("/").unwrap());
        let mut session = factory.connect().await.unwrap();
        let upload = |src: &Path| Endpoints::Upload {
            local: src.to_path_buf(),
            remote: ferry_protocol::normalize("/a.bin").unwrap(),
        };

        let err = upload(&link).source_info(session.as_mut()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        let (size, _) = upload(&real).source_info(session.as_mut()).await.unwrap();
        assert_eq!(size, 7);
    }

    #[tokio::test]
    async fn destination_states() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        std::fs::write(remote.path().join("same.bin"), b"12345").unwrap();
        std::fs::write(remote.path().join("diff.bin"), b"123").unwrap();

        let factory = DirSessionFactory::new(remote.path(), SandboxBoundary::new("/").unwrap());
        let mut session = factory.connect().await.unwrap();
        let src = local.path().join("a.bin").to_string_lossy().into_owned();

        let check = |dst: &str| Endpoints::Upload {
            local: PathBuf::from(&src),
            remote: ferry_protocol::normalize(dst).unwrap(),
        };
        assert_eq!(
            check("/same.bin").destination(session.as_mut(), 5).await.unwrap(),
            Destination::Identical
        );
        assert_eq!(
            check("/diff.bin").destination(session.as_mut(), 5).await.unwrap(),
            Destination::Conflict
        );
        assert_eq!(
            check("/none.bin").destination(session.as_mut(), 5).await.unwrap(),
            Destination::Missing
        );
        assert_eq!(
            check("/diff.bin").free_destination(session.as_mut()).await.unwrap(),
            "/diff_1.bin"
        );
    }
}

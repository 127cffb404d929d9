//! Expansion of directory transfers into dependency-ordered tasks.
//!
//! An upload tree becomes one `mkdir` task per subdirectory and one transfer
//! per file. Each task depends on the `mkdir` of its parent directory, so a
//! child never runs before the directory it lands in exists. The destination
//! root itself is created by the caller before the batch is submitted.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use ferry_file_ops::scan_tree;
use ferry_protocol::{
    EngineKind, EntryKind, ErrorKind, FerryError, NormalizedPath, RemoteSession,
    SandboxBoundary, Task, TaskId, TaskKind, new_task_id,
};

use crate::engine::select_engine;

/// Tasks produced from one directory transfer.
#[derive(Debug, Clone)]
pub struct ExpansionPlan {
    /// Batch identifier stamped on every task.
    pub batch: String,
    /// Tasks in breadth-first order; dependencies precede dependents.
    pub tasks: Vec<Task>,
    pub total_bytes: u64,
    /// Entries that were left out (symlinks, special files).
    pub rejected: Vec<String>,
}

impl ExpansionPlan {
    fn new() -> Self {
        Self {
            batch: new_task_id(),
            tasks: Vec::new(),
            total_bytes: 0,
            rejected: Vec::new(),
        }
    }

    fn push(&mut self, mut task: Task, depends_on: Option<TaskId>) -> TaskId {
        task.batch = Some(self.batch.clone());
        task.depends_on = depends_on;
        let id = task.id.clone();
        self.tasks.push(task);
        id
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        self.tasks.iter().filter(|t| t.kind == kind).count()
    }
}

/// Plans the upload of `local_root` into the remote directory `remote_root`.
pub fn plan_upload_tree(
    local_root: &Path,
    remote_root: &str,
    boundary: &SandboxBoundary,
    threshold: u64,
) -> Result<ExpansionPlan, FerryError> {
    let remote_root = boundary.check(remote_root)?;
    let tree = scan_tree(local_root)?;

    let mut plan = ExpansionPlan::new();
    let mut dir_tasks: HashMap<String, TaskId> = HashMap::new();

    for rel in &tree.directories {
        let remote = join_relative(&remote_root, rel)?;
        boundary.ensure_within(&remote)?;
        let parent = parent_task(&dir_tasks, rel);
        let task = Task::new(
            TaskKind::Mkdir,
            EngineKind::Protocol,
            "",
            remote.into_string(),
            None,
        );
        let id = plan.push(task, parent);
        dir_tasks.insert(rel.clone(), id);
    }

    for file in &tree.files {
        let remote = join_relative(&remote_root, &file.relative_path)?;
        boundary.ensure_within(&remote)?;
        let local = local_join(local_root, &file.relative_path);
        let task = Task::new(
            TaskKind::Upload,
            select_engine(TaskKind::Upload, Some(file.size), threshold),
            local.to_string_lossy().into_owned(),
            remote.into_string(),
            Some(file.size),
        );
        let parent = parent_task(&dir_tasks, &file.relative_path);
        plan.push(task, parent);
    }

    plan.total_bytes = tree.total_bytes;
    plan.rejected = tree.rejected;
    debug!(
        batch = %plan.batch,
        dirs = tree.directories.len(),
        files = tree.files.len(),
        "planned upload tree"
    );
    Ok(plan)
}

/// Plans the download of the remote directory `remote_root` into
/// `local_root`.
///
/// Walks the remote tree breadth-first over `session`. Local directories are
/// created while walking, so only file tasks are emitted.
pub async fn plan_download_tree(
    session: &mut dyn RemoteSession,
    remote_root: &str,
    local_root: &Path,
    boundary: &SandboxBoundary,
    threshold: u64,
) -> Result<ExpansionPlan, FerryError> {
    let remote_root = boundary.check(remote_root)?;
    match session.stat(&remote_root).await? {
        Some(entry) if entry.is_dir() => {}
        Some(_) => {
            return Err(FerryError::validation(format!(
                "{remote_root} is not a directory"
            )));
        }
        None => {
            return Err(FerryError::new(
                ErrorKind::PathNotFound,
                format!("{remote_root} does not exist"),
            ));
        }
    }

    tokio::fs::create_dir_all(local_root).await?;

    let mut plan = ExpansionPlan::new();
    let mut queue: VecDeque<(NormalizedPath, PathBuf)> = VecDeque::new();
    queue.push_back((remote_root, local_root.to_path_buf()));

    while let Some((dir, local_dir)) = queue.pop_front() {
        let mut entries = session.list(&dir).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in entries {
            let remote = dir.join(&entry.name)?;
            boundary.ensure_within(&remote)?;
            let local = local_dir.join(&entry.name);
            match entry.kind {
                EntryKind::Directory => {
                    tokio::fs::create_dir_all(&local).await?;
                    queue.push_back((remote, local));
                }
                EntryKind::File => {
                    plan.total_bytes += entry.size;
                    let task = Task::new(
                        TaskKind::Download,
                        select_engine(TaskKind::Download, Some(entry.size), threshold),
                        remote.into_string(),
                        local.to_string_lossy().into_owned(),
                        Some(entry.size),
                    );
                    plan.push(task, None);
                }
                EntryKind::Symlink | EntryKind::Other => {
                    warn!(path = %remote, "skipping symlink or special file");
                    plan.rejected.push(remote.into_string());
                }
            }
        }
    }

    debug!(batch = %plan.batch, files = plan.tasks.len(), "planned download tree");
    Ok(plan)
}

fn join_relative(base: &NormalizedPath, rel: &str) -> Result<NormalizedPath, FerryError> {
    rel.split('/').try_fold(base.clone(), |path, segment| path.join(segment))
}

fn local_join(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |path, segment| path.join(segment))
}

fn parent_task(dir_tasks: &HashMap<String, TaskId>, rel: &str) -> Option<TaskId> {
    rel.rsplit_once('/')
        .and_then(|(parent, _)| dir_tasks.get(parent))
        .cloned()
}

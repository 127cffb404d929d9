//! Breadth-first scanning of a local directory tree.
//!
//! Relative paths use `/` as separator on every platform so they can be
//! joined onto remote paths directly.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ferry_protocol::FerryError;
use tracing::warn;

/// A regular file found under the scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub relative_path: String,
    pub size: u64,
}

/// Result of [`scan_tree`].
///
/// `directories` and `files` are in breadth-first order, so every directory
/// appears before anything nested inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTree {
    pub directories: Vec<String>,
    pub files: Vec<LocalFile>,
    pub total_bytes: u64,
    /// Symlinks and special files that were left out.
    pub rejected: Vec<String>,
}

/// Scans `root` breadth-first.
///
/// Entries are visited in name order within each directory. Symbolic links
/// and special files are not followed; they are reported in
/// [`LocalTree::rejected`].
pub fn scan_tree(root: &Path) -> Result<LocalTree, FerryError> {
    let meta = std::fs::symlink_metadata(root)
        .map_err(|e| FerryError::from(e).context(format!("scan {}", root.display())))?;
    if !meta.is_dir() {
        return Err(FerryError::validation(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let mut tree = LocalTree::default();
    let mut queue: VecDeque<(PathBuf, String)> = VecDeque::new();
    queue.push_back((root.to_path_buf(), String::new()));

    while let Some((dir, rel_dir)) = queue.pop_front() {
        let mut entries = std::fs::read_dir(&dir)
            .map_err(|e| FerryError::from(e).context(format!("read {}", dir.display())))?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if rel_dir.is_empty() {
                name
            } else {
                format!("{rel_dir}/{name}")
            };
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                tree.directories.push(rel.clone());
                queue.push_back((entry.path(), rel));
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                tree.total_bytes += size;
                tree.files.push(LocalFile {
                    relative_path: rel,
                    size,
                });
            } else {
                warn!(path = %entry.path().display(), "skipping symlink or special file");
                tree.rejected.push(rel);
            }
        }
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        fs::write(root.join("model.bin"), b"WEIGHTS").unwrap();
        fs::write(root.join("readme.txt"), b"READ").unwrap();

        fs::create_dir_all(root.join("data").join("shards")).unwrap();
        fs::write(root.join("data").join("config.json"), b"{}").unwrap();
        fs::write(
            root.join("data").join("shards").join("part-0.dat"),
            b"SHARD_ZERO",
        )
        .unwrap();

        dir
    }

    #[test]
    fn scan_finds_all_entries() {
        let dir = create_test_tree();
        let tree = scan_tree(dir.path()).unwrap();

        assert_eq!(tree.directories, vec!["data", "data/shards"]);
        let paths: Vec<&str> = tree.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["model.bin", "readme.txt", "data/config.json", "data/shards/part-0.dat"]
        );

        let expected = b"WEIGHTS".len() + b"READ".len() + b"{}".len() + b"SHARD_ZERO".len();
        assert_eq!(tree.total_bytes, expected as u64);
    }

    #[test]
    fn scan_empty_dir() {
        let dir = TempDir::new().unwrap();
        let tree = scan_tree(dir.path()).unwrap();
        assert!(tree.files.is_empty());
        assert!(tree.directories.is_empty());
        assert_eq!(tree.total_bytes, 0);
    }

    #[test]
    fn scan_nonexistent_dir() {
        let result = scan_tree(Path::new("/nonexistent/path/that/does/not/exist"));
        assert_eq!(
            result.unwrap_err().kind(),
            ferry_protocol::ErrorKind::PathNotFound
        );
    }

    #[test]
    fn scan_rejects_file_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        assert!(scan_tree(&file).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_symlinks() {
        let dir = create_test_tree();
        std::os::unix::fs::symlink("/etc", dir.path().join("escape")).unwrap();
        let tree = scan_tree(dir.path()).unwrap();
        assert_eq!(tree.rejected, vec!["escape"]);
        assert!(!tree.directories.iter().any(|d| d.starts_with("escape")));
    }
}

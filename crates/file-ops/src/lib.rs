//! Local filesystem operations for Ferry.
//!
//! Provides breadth-first tree scanning for directory uploads and a
//! [`SessionFactory`](ferry_protocol::SessionFactory) backed by a locally
//! mounted directory.

mod dir_session;
mod scan;

pub use dir_session::{DirFile, DirSession, DirSessionFactory};
pub use scan::{LocalFile, LocalTree, scan_tree};

use std::path::PathBuf;

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else if path == "~" {
        home_dir()
    } else {
        PathBuf::from(path)
    }
}

/// Returns the user's home directory.
fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

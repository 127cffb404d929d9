//! Destination conflict naming.
//!
//! When a destination exists with a different size the transfer goes to
//! `{stem}_{n}{ext}` instead, with the smallest `n >= 1` that is unused.

use std::path::{Path, PathBuf};

use ferry_protocol::{FerryError, NormalizedPath, RemoteSession, normalize};

/// Upper bound on probed suffixes.
const MAX_SUFFIX: u32 = 10_000;

/// Inserts `_{n}` before the extension of the final path segment.
///
/// Dotfiles without a further dot (`.bashrc`) have no extension.
pub fn suffixed_name(path: &str, n: u32) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    };
    let dot = name.rfind('.').filter(|&idx| idx > 0);
    match dot {
        Some(idx) => format!("{dir}{}_{n}{}", &name[..idx], &name[idx..]),
        None => format!("{dir}{name}_{n}"),
    }
}

/// Finds a free remote name next to `path`.
pub async fn resolve_remote(
    session: &mut dyn RemoteSession,
    path: &NormalizedPath,
) -> Result<NormalizedPath, FerryError> {
    for n in 1..=MAX_SUFFIX {
        let candidate = normalize(&suffixed_name(path.as_str(), n))?;
        if session.stat(&candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    Err(FerryError::validation(format!("no free name next to {path}")))
}

/// Finds a free local name next to `path`.
pub async fn resolve_local(path: &Path) -> Result<PathBuf, FerryError> {
    let raw = path.to_string_lossy();
    for n in 1..=MAX_SUFFIX {
        let candidate = PathBuf::from(suffixed_name(&raw, n));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(FerryError::validation(format!(
        "no free name next to {}",
        path.display()
    )))
}

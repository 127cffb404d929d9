//! Remote path normalization and sandbox boundary checks.
//!
//! Remote paths are always POSIX. Normalization is a pure string operation:
//! it never consults the remote filesystem, so symlinks are not resolved here.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FerryError;

/// An absolute remote path with no `.`/`..` segments and no repeated separators.
///
/// Only [`normalize`] (and the helpers in this module) can construct one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedPath(String);

impl NormalizedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Returns `true` for the filesystem root `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent directory, or `None` at `/`.
    pub fn parent(&self) -> Option<NormalizedPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(NormalizedPath("/".into())),
            Some(idx) => Some(NormalizedPath(self.0[..idx].to_string())),
        }
    }

    /// Final path segment (empty for `/`).
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Appends a single entry name.
    ///
    /// `name` must be a plain segment: not empty, not `.`/`..`, no `/`.
    pub fn join(&self, name: &str) -> Result<NormalizedPath, FerryError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
        {
            return Err(FerryError::validation(format!(
                "invalid path segment {name:?} under {}",
                self.0
            )));
        }
        if self.is_root() {
            Ok(NormalizedPath(format!("/{name}")))
        } else {
            Ok(NormalizedPath(format!("{}/{name}", self.0)))
        }
    }

    /// Returns `true` if `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &NormalizedPath) -> bool {
        ancestor.is_root()
            || self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NormalizedPath {
    type Error = FerryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize(&value)
    }
}

impl From<NormalizedPath> for String {
    fn from(value: NormalizedPath) -> Self {
        value.0
    }
}

/// Collapses `.`/`..` segments and repeated separators.
///
/// Relative input is anchored at `/`. Fails with `VALIDATION_FAILED` for an
/// empty path, a path containing NUL, or any `..` that would climb above `/`.
pub fn normalize(path: &str) -> Result<NormalizedPath, FerryError> {
    if path.is_empty() {
        return Err(FerryError::validation("empty remote path"));
    }
    if path.contains('\0') {
        return Err(FerryError::validation("remote path contains NUL byte"));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(FerryError::validation(format!(
                        "path {path:?} escapes above the filesystem root"
                    )));
                }
            }
            other => segments.push(other),
        }
    }

    Ok(NormalizedPath(format!("/{}", segments.join("/"))))
}

/// The remote root every task of a connection is confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxBoundary {
    root: NormalizedPath,
}

impl SandboxBoundary {
    /// Builds a boundary from a configured root. The root must be absolute.
    pub fn new(root: &str) -> Result<Self, FerryError> {
        if !root.starts_with('/') {
            return Err(FerryError::validation(format!(
                "sandbox root must be absolute, got {root:?}"
            )));
        }
        Ok(Self {
            root: normalize(root)?,
        })
    }

    pub fn root(&self) -> &NormalizedPath {
        &self.root
    }

    /// Fails unless `path` equals the root or lies below `root + "/"`.
    pub fn ensure_within(&self, path: &NormalizedPath) -> Result<(), FerryError> {
        if path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(FerryError::validation(format!(
                "path {path} is outside sandbox {}",
                self.root
            )))
        }
    }

    /// Normalizes `raw` and checks it against the boundary in one step.
    pub fn check(&self, raw: &str) -> Result<NormalizedPath, FerryError> {
        let path = normalize(raw)?;
        self.ensure_within(&path)?;
        Ok(path)
    }
}

/// Free-function form of [`SandboxBoundary::ensure_within`].
pub fn ensure_within_boundary(
    path: &NormalizedPath,
    boundary: &SandboxBoundary,
) -> Result<(), FerryError> {
    boundary.ensure_within(path)
}

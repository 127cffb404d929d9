//! Persistent chunk-completion records for resumable transfers.
//!
//! One JSON file per transfer, named after its fingerprint. Writes go to a
//! temporary file that is renamed into place, so a crash never leaves a
//! half-written record behind. Records that fail to parse are treated as
//! missing.
//!
//! Alongside the records, the store keeps one marker per destination that a
//! chunked transfer has sized but not finished. Markers are keyed by the
//! destination alone, so they outlive a lost or stale record.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors produced by the checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("range {start}..{end} exceeds file size {size}")]
    OutOfBounds { start: u64, end: u64, size: u64 },
}

impl From<CheckpointError> for ferry_protocol::FerryError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Io(e) => e.into(),
            other => ferry_protocol::FerryError::unknown(other.to_string()),
        }
    }
}

/// Derives the identity of a transfer.
///
/// Any change to the endpoints or to the source's size or modification time
/// yields a different fingerprint, so stale records are never applied.
pub fn fingerprint(src: &str, dst: &str, size: u64, mtime: Option<i64>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(src.as_bytes());
    hasher.update([0]);
    hasher.update(dst.as_bytes());
    hasher.update([0]);
    hasher.update(size.to_le_bytes());
    hasher.update(mtime.unwrap_or_default().to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Completion record of one chunked transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub fingerprint: String,
    pub src: String,
    /// Destination actually written, after conflict naming.
    pub target: String,
    pub file_size: u64,
    pub chunk_size: u64,
    /// Sorted, disjoint and non-adjacent.
    pub completed: Vec<ByteRange>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        fingerprint: impl Into<String>,
        src: impl Into<String>,
        target: impl Into<String>,
        file_size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            src: src.into(),
            target: target.into(),
            file_size,
            chunk_size,
            completed: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Adds a completed range, merging overlapping or touching neighbours.
    pub fn insert(&mut self, range: ByteRange) -> Result<(), CheckpointError> {
        if range.end > self.file_size || range.start > range.end {
            return Err(CheckpointError::OutOfBounds {
                start: range.start,
                end: range.end,
                size: self.file_size,
            });
        }
        if range.is_empty() {
            return Ok(());
        }

        let mut merged = range;
        let mut out = Vec::with_capacity(self.completed.len() + 1);
        for existing in self.completed.drain(..) {
            if existing.end < merged.start || existing.start > merged.end {
                out.push(existing);
            } else {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
            }
        }
        out.push(merged);
        out.sort();
        self.completed = out;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Total bytes covered by completed ranges.
    pub fn bytes_completed(&self) -> u64 {
        self.completed.iter().map(ByteRange::len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_completed() == self.file_size
    }

    /// Returns `true` if `range` lies entirely inside a completed range.
    pub fn contains(&self, range: ByteRange) -> bool {
        self.completed
            .iter()
            .any(|r| r.start <= range.start && range.end <= r.end)
    }

    /// Splits everything not yet completed into chunks of at most
    /// `chunk_size` bytes, aligned to multiples of `chunk_size`.
    pub fn pending_chunks(&self, chunk_size: u64) -> Vec<ByteRange> {
        let chunk_size = chunk_size.max(1);
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for r in &self.completed {
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < self.file_size {
            gaps.push(ByteRange::new(cursor, self.file_size));
        }

        let mut chunks = Vec::new();
        for gap in gaps {
            let mut start = gap.start;
            while start < gap.end {
                let boundary = (start / chunk_size + 1) * chunk_size;
                let end = boundary.min(gap.end);
                chunks.push(ByteRange::new(start, end));
                start = end;
            }
        }
        chunks
    }
}

/// Directory of checkpoint records.
///
/// All writes go through one lock, so concurrent chunk completions are
/// applied one at a time.
pub struct CheckpointStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Loads a record. Missing, truncated or corrupt records yield `None`.
    pub async fn load(&self, fingerprint: &str) -> Option<Checkpoint> {
        let path = self.path_for(fingerprint);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint ignored");
                return None;
            }
        };
        match serde_json::from_slice::<Checkpoint>(&data) {
            Ok(cp) if cp.fingerprint == fingerprint && is_consistent(&cp) => Some(cp),
            Ok(_) => {
                warn!(path = %path.display(), "inconsistent checkpoint ignored");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint ignored");
                None
            }
        }
    }

    /// Atomically replaces the record for `checkpoint.fingerprint`.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&checkpoint.fingerprint);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.fingerprint));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(
            fingerprint = %checkpoint.fingerprint,
            completed = checkpoint.bytes_completed(),
            "checkpoint saved"
        );
        Ok(())
    }

    fn marker_for(&self, target: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(target.as_bytes()));
        self.dir.join(format!("{digest}.partial"))
    }

    /// Records that `target` is about to hold an unfinished transfer.
    pub async fn mark_unfinished(&self, target: &str) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.marker_for(target), target.as_bytes()).await?;
        Ok(())
    }

    /// Whether `target` was left unfinished by an earlier attempt.
    pub async fn is_unfinished(&self, target: &str) -> bool {
        match tokio::fs::read(self.marker_for(target)).await {
            Ok(data) => data == target.as_bytes(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(target, error = %e, "unreadable destination marker, assuming unfinished");
                true
            }
        }
    }

    /// Clears the unfinished marker of `target`.
    pub async fn mark_finished(&self, target: &str) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.marker_for(target)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a record. Missing records are not an error.
    pub async fn discard(&self, fingerprint: &str) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(fingerprint)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_consistent(cp: &Checkpoint) -> bool {
    let mut prev_end = None;
    for r in &cp.completed {
        if r.is_empty() || r.end > cp.file_size {
            return false;
        }
        if let Some(end) = prev_end
            && r.start <= end
        {
            return false;
        }
        prev_end = Some(r.end);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cp(size: u64) -> Checkpoint {
        Checkpoint::new("fp", "/src", "/dst", size, 10)
    }

    #[test]
    fn fingerprint_tracks_inputs() {
        let a = fingerprint("/a", "/b", 10, Some(1));
        assert_eq!(a, fingerprint("/a", "/b", 10, Some(1)));
        assert_ne!(a, fingerprint("/a", "/b", 11, Some(1)));
        assert_ne!(a, fingerprint("/a", "/b", 10, Some(2)));
        assert_ne!(a, fingerprint("/a", "/c", 10, Some(1)));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn insert_merges_ranges() {
        let mut c = cp(100);
        c.insert(ByteRange::new(20, 30)).unwrap();
        c.insert(ByteRange::new(0, 10)).unwrap();
        c.insert(ByteRange::new(50, 60)).unwrap();
        assert_eq!(c.completed.len(), 3);

        c.insert(ByteRange::new(10, 20)).unwrap();
        assert_eq!(
            c.completed,
            vec![ByteRange::new(0, 30), ByteRange::new(50, 60)]
        );
        assert_eq!(c.bytes_completed(), 40);

        c.insert(ByteRange::new(25, 55)).unwrap();
        assert_eq!(c.completed, vec![ByteRange::new(0, 60)]);
        assert!(c.contains(ByteRange::new(10, 20)));
        assert!(!c.contains(ByteRange::new(55, 65)));
    }

    #[test]
    fn insert_rejects_out_of_bounds() {
        let mut c = cp(100);
        assert!(c.insert(ByteRange::new(90, 110)).is_err());
        assert!(c.completed.is_empty());
    }

    #[test]
    fn union_never_exceeds_size() {
        let mut c = cp(35);
        for start in (0..35).step_by(10) {
            c.insert(ByteRange::new(start, (start + 10).min(35))).unwrap();
            c.insert(ByteRange::new(start, (start + 10).min(35))).unwrap();
        }
        assert_eq!(c.bytes_completed(), 35);
        assert!(c.is_complete());
    }

    #[test]
    fn pending_chunks_skip_completed() {
        let mut c = cp(45);
        assert_eq!(c.pending_chunks(10).len(), 5);

        c.insert(ByteRange::new(10, 20)).unwrap();
        c.insert(ByteRange::new(30, 40)).unwrap();
        assert_eq!(
            c.pending_chunks(10),
            vec![
                ByteRange::new(0, 10),
                ByteRange::new(20, 30),
                ByteRange::new(40, 45),
            ]
        );
    }

    #[test]
    fn pending_chunks_realign_after_chunk_size_change() {
        let mut c = cp(40);
        c.insert(ByteRange::new(0, 15)).unwrap();
        assert_eq!(
            c.pending_chunks(10),
            vec![
                ByteRange::new(15, 20),
                ByteRange::new(20, 30),
                ByteRange::new(30, 40),
            ]
        );
    }

    #[tokio::test]
    async fn save_load_discard() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));

        assert!(store.load("fp").await.is_none());

        let mut c = cp(100);
        c.insert(ByteRange::new(0, 10)).unwrap();
        store.save(&c).await.unwrap();

        let loaded = store.load("fp").await.unwrap();
        assert_eq!(loaded.completed, c.completed);
        assert_eq!(loaded.target, "/dst");
        assert!(!dir.path().join("checkpoints").join("fp.json.tmp").exists());

        store.discard("fp").await.unwrap();
        assert!(store.load("fp").await.is_none());
        store.discard("fp").await.unwrap();
    }

    #[tokio::test]
    async fn unfinished_marker_tracks_destination() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(!store.is_unfinished("/data/a.bin").await);

        store.mark_unfinished("/data/a.bin").await.unwrap();
        assert!(store.is_unfinished("/data/a.bin").await);
        assert!(!store.is_unfinished("/data/b.bin").await);

        // Losing the record does not clear the marker.
        store.discard("anything").await.unwrap();
        assert!(store.is_unfinished("/data/a.bin").await);

        store.mark_finished("/data/a.bin").await.unwrap();
        store.mark_finished("/data/a.bin").await.unwrap();
        assert!(!store.is_unfinished("/data/a.bin").await);
    }

    #[tokio::test]
    async fn corrupt_record_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(dir.path().join("fp.json"), b"{\"fingerprint\": \"fp\", \"src").unwrap();
        assert!(store.load("fp").await.is_none());

        std::fs::write(dir.path().join("fp.json"), b"").unwrap();
        assert!(store.load("fp").await.is_none());
    }

    #[tokio::test]
    async fn overlapping_record_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut c = cp(100);
        c.completed = vec![ByteRange::new(0, 20), ByteRange::new(10, 30)];
        store.save(&c).await.unwrap();
        assert!(store.load("fp").await.is_none());
    }
}

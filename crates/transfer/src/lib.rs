//! Execution engines for Ferry tasks.
//!
//! - [`ProtocolEngine`] runs every operation over one exclusive session per
//!   worker: listing, `mkdir`, delete, rename and whole-file transfers.
//! - [`ChunkedEngine`] splits large files into fixed-size chunks moved by
//!   parallel workers, recording finished ranges in a [`CheckpointStore`] so
//!   an interrupted transfer resumes where it stopped.
//!
//! Both implement [`TransferEngine`]; the scheduler picks one per task with
//! [`select_engine`].

pub mod checkpoint;
pub mod chunked;
pub mod conflict;
pub mod copy;
pub mod endpoints;
pub mod engine;
pub mod expand;
pub mod pool;
pub mod preset;
pub mod progress;
pub mod stream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checkpoint::{ByteRange, Checkpoint, CheckpointError, CheckpointStore, fingerprint};
pub use chunked::ChunkedEngine;
pub use engine::{
    AttemptContext, EngineError, Outcome, Preflight, TransferEngine, select_engine,
};
pub use expand::{ExpansionPlan, plan_download_tree, plan_upload_tree};
pub use preset::{ChunkedConfig, ThroughputPreset};
pub use progress::{ProgressCallback, ProgressReporter, SpeedCalculator};
pub use stream::{ProtocolEngine, ensure_dir_all};

/// Files of at least this many bytes go to the chunked engine.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 50 * 1024 * 1024;

//! Task scheduling for Ferry.
//!
//! The [`Scheduler`] admits tasks, dispatches them to the protocol or chunked
//! engine, retries transient failures with backoff, and tracks directory
//! batches. It is the only writer of task state; observers receive owned
//! snapshots through [`SchedulerEvent`]s.

pub mod advisor;
pub mod error;
pub mod retry;
mod scheduler;
mod table;
pub mod types;

pub use advisor::{PresetAdvisor, TransferRecord};
pub use error::SchedulerError;
pub use retry::RetryPolicy;
pub use scheduler::{Engines, PresetTuner, Scheduler};
pub use types::{BatchSummary, BatchTicket, SchedulerConfig, SchedulerEvent};

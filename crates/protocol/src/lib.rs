//! Shared vocabulary for Ferry.
//!
//! Every other crate in the workspace speaks in these types: the error
//! taxonomy, the task model and its state machine, remote paths confined to a
//! sandbox, and the session capability traits the engines drive.

pub mod error;
pub mod redact;
pub mod sandbox;
pub mod session;
pub mod site;
pub mod types;

pub use error::{ErrorKind, FerryError};
pub use redact::redact_secrets;
pub use sandbox::{NormalizedPath, SandboxBoundary, ensure_within_boundary, normalize};
pub use session::{RemoteFile, RemoteSession, SessionFactory};
pub use site::{AuthMethod, SiteConfig};
pub use types::{
    EngineKind, EntryKind, InvalidTransition, RemoteEntry, Task, TaskId, TaskKind, TaskStatus,
    new_task_id,
};

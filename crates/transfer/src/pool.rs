use std::sync::{Arc, Mutex};

use ferry_protocol::{FerryError, RemoteSession, SandboxBoundary, SessionFactory};
use tracing::debug;

/// Keeps idle sessions for reuse by protocol workers.
///
/// A checked-out session belongs to exactly one worker until it is handed
/// back with [`release`](Self::release).
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    idle: Mutex<Vec<Box<dyn RemoteSession>>>,
    max_idle: usize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, max_idle: usize) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn factory(&self) -> &Arc<dyn SessionFactory> {
        &self.factory
    }

    pub fn boundary(&self) -> &SandboxBoundary {
        self.factory.boundary()
    }

    /// Checks out an idle session or opens a new one.
    pub async fn acquire(&self) -> Result<Box<dyn RemoteSession>, FerryError> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match reused {
            Some(session) => Ok(session),
            None => {
                debug!("opening protocol session");
                self.factory.connect().await
            }
        }
    }

    /// Returns a session after use.
    ///
    /// Sessions whose last operation failed with a connection-level error are
    /// dropped instead of kept.
    pub fn release(&self, session: Box<dyn RemoteSession>, last_error: Option<&FerryError>) {
        if last_error.is_some_and(|e| e.kind().is_transient()) {
            debug!("dropping broken protocol session");
            return;
        }
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < self.max_idle
        {
            idle.push(session);
        }
    }

    /// Number of idle sessions.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

//! Background Task Scheduler
//!
//! Port used to run cleanup and garbage collection off the caller's thread.
//! The tokio implementation runs each task on the blocking pool, since disk
//! tier work is synchronous file I/O.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unit of background work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler collaborator
pub trait Scheduler: Send + Sync {
    /// Run a task as soon as possible
    fn submit(&self, task: Task);

    /// Run a task once after `delay`, unless cancelled first
    fn schedule_once(&self, delay: Duration, task: Task);

    /// Cancel every task that has not started yet
    fn cancel_all(&self);
}

// =============================================================================
// Tokio Scheduler
// =============================================================================

/// Scheduler backed by a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    cancel: CancellationToken,
}

impl TokioScheduler {
    /// Create a scheduler on the given runtime
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a scheduler on the runtime of the calling context
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Configuration(format!("no tokio runtime available: {}", e)))?;
        Ok(Self::new(handle))
    }

    /// Whether `cancel_all` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Scheduler for TokioScheduler {
    fn submit(&self, task: Task) {
        if self.cancel.is_cancelled() {
            debug!("scheduler cancelled, dropping submitted task");
            return;
        }
        self.handle.spawn_blocking(task);
    }

    fn schedule_once(&self, delay: Duration, task: Task) {
        let cancel = self.cancel.clone();
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("scheduled task cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    handle.spawn_blocking(task);
                }
            }
        });
    }

    fn cancel_all(&self) {
        self.cancel.cancel();
    }
}

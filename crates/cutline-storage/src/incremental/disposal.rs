//! Executors that discard state handles away from the registry lock.
//!
//! Registry mutations sit on the checkpoint hot path; deleting files does
//! not. The registry hands every handle it stops tracking to a
//! [`DisposalExecutor`] and never waits for the result.

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::handle::StreamStateHandle;

/// One pending discard.
#[derive(Debug)]
pub struct DisposalTask {
    handle: StreamStateHandle,
}

impl DisposalTask {
    /// Wrap `handle` for disposal.
    #[must_use]
    pub fn new(handle: StreamStateHandle) -> Self {
        Self { handle }
    }

    /// The handle to be discarded.
    #[must_use]
    pub fn handle(&self) -> &StreamStateHandle {
        &self.handle
    }

    /// Discard the handle. Failures are logged, never returned: a failed
    /// delete leaks storage but cannot break a checkpoint.
    pub fn run(self) {
        match self.handle.discard() {
            Ok(()) => debug!(handle = %self.handle, "discarded shared state"),
            Err(e) => warn!(
                handle = %self.handle,
                error = %e,
                "failed to discard shared state"
            ),
        }
    }
}

/// Runs disposal tasks.
pub trait DisposalExecutor: Send + Sync {
    /// Run `task` now or later. Must not block on I/O when deferring.
    fn execute(&self, task: DisposalTask);
}

/// Runs each task on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl DisposalExecutor for DirectExecutor {
    fn execute(&self, task: DisposalTask) {
        task.run();
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioDisposalExecutor {
    runtime: Handle,
}

impl TokioDisposalExecutor {
    /// Dispose on the given runtime.
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Dispose on the runtime the caller is running in, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl DisposalExecutor for TokioDisposalExecutor {
    fn execute(&self, task: DisposalTask) {
        // Fire and forget; the join handle is not needed.
        drop(self.runtime.spawn_blocking(move || task.run()));
    }
}

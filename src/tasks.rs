//! Structured ownership of background work.
//!
//! Every task spawned by the monitor, the display controller or the
//! coordinator goes through one [`TaskScope`], so shutdown can cancel and
//! join all of it.

use std::future::Future;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TaskScope {
    runtime: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskScope {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Scope bound to the runtime the caller is running on.
    pub fn from_current() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|err| Error::Initialization(format!("no tokio runtime available: {err}")))?;
        Ok(Self::new(runtime))
    }

    /// Token cancelled when the scope shuts down; cancelling it does not
    /// affect siblings.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tracker.spawn_on(task, &self.runtime);
    }

    /// Cancels every task spawned through this scope and waits for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        debug!(pending = self.tracker.len(), "waiting for background tasks");
        self.tracker.wait().await;
    }
}

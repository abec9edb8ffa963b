use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::elector::{ElectorShared, StepDownReason};

/// A named background task
///
/// Unlike a bare `JoinHandle`, joining reports a panic instead of
/// propagating it, so shutdown of the remaining tasks can continue.
pub struct TaskHandle {
    name: &'static str,
    join_handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &'static str, f: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            join_handle: tokio::spawn(f),
        }
    }

    pub async fn join(self) {
        if let Err(e) = self.join_handle.await {
            if e.is_panic() {
                warn!(task = self.name, "Task panicked");
            }
        }
    }
}

/// Detects a task dying by panic
///
/// A panicking task could leave the instance believing it is still the
/// leader, so the guard drops the local leader flag and asks the election
/// loop to release.
pub struct PanicGuard {
    name: &'static str,
    shared: Arc<ElectorShared>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, shared: Arc<ElectorShared>) -> Self {
        Self {
            name,
            shared,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.shared.leave_leadership();
            self.shared
                .request_step_down(self.shared.epoch(), StepDownReason::TaskPanicked);
        }
    }
}

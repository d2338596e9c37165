//! Coalescing send signal.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Send Scheduler
///
/// A single pending flag shared by the session and every stream. Any number
/// of `schedule()` calls between two rounds collapse into one wake-up; only
/// the false to true transition notifies the session task.
#[derive(Debug, Clone, Default)]
pub struct SendScheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    pending: AtomicBool,
    notify: Notify,
}

impl SendScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a send round.
    pub fn schedule(&self) {
        if !self.inner.pending.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_one();
        }
    }

    /// Clear the flag, returning whether a round was requested.
    pub fn take(&self) -> bool {
        self.inner.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Wait until a round is requested and claim it.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.take() {
                return;
            }
            notified.await;
        }
    }
}

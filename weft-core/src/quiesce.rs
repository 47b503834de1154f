//! Quiescence Detection
//!
//! A build has settled when no task in the graph is pending. The counter
//! here is incremented when a task is created or a settled task is
//! invalidated, and decremented only after a settlement's own propagation
//! pass has run, so a settlement that immediately restarts downstream
//! tasks never lets the counter touch zero mid-cascade.
//!
//! The counter is private to the runtime; the only exposure is
//! `Runtime::await_quiescence`.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

pub(crate) struct PendingTasks {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingTasks {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub(crate) fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "pending-task counter underflow");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolve once the counter is zero and stays zero across a yield,
    /// so a settlement whose propagation spawns further work is not
    /// mistaken for quiescence.
    pub(crate) async fn wait_idle(&self) {
        loop {
            // Register for the wakeup before checking, so a decrement
            // between the check and the await is not missed.
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
                if self.count.load(Ordering::SeqCst) == 0 {
                    return;
                }
                continue;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn idle_when_never_pending() {
        let pending = PendingTasks::new();
        pending.wait_idle().await;
    }

    #[tokio::test]
    async fn waits_for_outstanding_work() {
        let pending = Arc::new(PendingTasks::new());
        pending.increment();

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move {
                pending.wait_idle().await;
            })
        };

        // Give the waiter a chance to block.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        pending.decrement();
        waiter.await.expect("waiter join");
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn reusable_after_idle() {
        let pending = PendingTasks::new();
        pending.increment();
        pending.decrement();
        pending.wait_idle().await;

        pending.increment();
        assert_eq!(pending.count(), 1);
        pending.decrement();
        pending.wait_idle().await;
    }
}

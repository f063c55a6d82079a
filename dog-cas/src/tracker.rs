use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts background transfers so shutdown can wait for all of them.
///
/// A transfer is registered before its task is spawned and deregistered when
/// the task's guard drops, whether the task finished, failed or panicked.
#[derive(Clone, Default)]
pub(crate) struct TransferTracker {
    inner: Arc<Inner>,
}

impl TransferTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a transfer and run `future` on the runtime.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.register();
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    pub(crate) fn register(&self) -> TransferGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        TransferGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no transfer is registered.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register interest before checking, so a final drop in between is not missed
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct TransferGuard {
    inner: Arc<Inner>,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let tracker = TransferTracker::new();
        tracker.wait().await;
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_every_transfer_finishes() {
        let tracker = TransferTracker::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 1..=3u64 {
            let finished = finished.clone();
            tracker.spawn(async move {
                tokio::time::sleep(Duration::from_millis(100 * i)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(tracker.in_flight(), 3);

        tracker.wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_transfer_is_deregistered() {
        let tracker = TransferTracker::new();
        let handle = tracker.spawn(async { panic!("boom") });
        assert!(handle.await.is_err());
        tracker.wait().await;
        assert_eq!(tracker.in_flight(), 0);
    }
}

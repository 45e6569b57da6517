//! Counted barrier used by fan-out operations (close, unsubscribe) to
//! proceed once every participant has reported in, or a timeout elapses,
//! whichever comes first.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Guarantees its callback fires at most once, either when `completed_one`
/// brings the remaining count to zero or when `timeout` elapses.
pub struct CountedBarrier {
    remaining: AtomicUsize,
    fired: AtomicBool,
    notify: Arc<Notify>,
}

impl CountedBarrier {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            fired: AtomicBool::new(count == 0),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Decrement the remaining count; fires if it reaches zero.
    pub fn completed_one(self: &Arc<Self>) {
        if self.remaining.load(Ordering::SeqCst) == 0 {
            return;
        }
        let prev = self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            Some(n.saturating_sub(1))
        });
        if let Ok(prev) = prev {
            if prev <= 1 {
                self.fire();
            }
        }
    }

    fn fire(self: &Arc<Self>) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notify.notify_waiters();
        }
    }

    /// Wait until either the count reaches zero or `timeout` elapses (if
    /// set), then run `on_done` exactly once.
    pub async fn wait(self: Arc<Self>, timeout: Option<Duration>, on_done: impl FnOnce() + Send + 'static) {
        // Register as a waiter before checking `fired`: `notify_waiters`
        // only wakes tasks already enqueued, so enabling first closes the
        // window where `fire()` runs between the check and the `.await`.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.fired.load(Ordering::SeqCst) {
            on_done();
            return;
        }

        match timeout {
            Some(d) => {
                let _ = tokio::time::timeout(d, notified).await;
            }
            None => {
                notified.await;
            }
        }
        self.fire();
        on_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_count_reaches_zero() {
        let barrier = CountedBarrier::new(2);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let wait = tokio::spawn(barrier.clone().wait(None, move || {
            fired2.store(true, Ordering::SeqCst);
        }));
        barrier.completed_one();
        barrier.completed_one();
        wait.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fires_on_timeout_even_if_incomplete() {
        let barrier = CountedBarrier::new(3);
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        barrier.completed_one();
        barrier
            .clone()
            .wait(Some(Duration::from_millis(20)), move || {
                fired2.store(true, Ordering::SeqCst);
            })
            .await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_count_is_already_fired() {
        let barrier = CountedBarrier::new(0);
        assert!(barrier.fired.load(Ordering::SeqCst));
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Inactivity watchdog driving per-connection timeouts.
///
/// Every buffer event calls [`ActivityTimer::update`]; when no update arrives
/// within the current window the associated [`CancellationToken`] fires and
/// all copiers on the connection unwind. [`ActivityTimer::set_timeout`]
/// replaces the window, e.g. to switch a TCP bridge from the connection-idle
/// timeout to the downlink-only timeout once the uplink half has finished.
pub struct ActivityTimer {
    base: Instant,
    last_active: AtomicU64,
    timeout_ms: AtomicU64,
    poke: Notify,
    cancel: CancellationToken,
}

impl ActivityTimer {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Arc<Self> {
        let timer = Arc::new(Self {
            base: Instant::now(),
            last_active: AtomicU64::new(0),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            poke: Notify::new(),
            cancel,
        });
        timer.clone().spawn_watcher();
        timer
    }

    /// Record activity, pushing the deadline out by the current window.
    pub fn update(&self) {
        self.last_active
            .store(self.base.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Replace the inactivity window. Takes effect immediately.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
        self.poke.notify_one();
    }

    fn spawn_watcher(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let timeout = self.timeout_ms.load(Ordering::Relaxed);
                let now = self.base.elapsed().as_millis() as u64;
                let idle = now.saturating_sub(self.last_active.load(Ordering::Relaxed));
                if idle >= timeout {
                    self.cancel.cancel();
                    return;
                }
                let wait = Duration::from_millis(timeout - idle);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.poke.notified() => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_inactivity() {
        let cancel = CancellationToken::new();
        let _timer = ActivityTimer::new(cancel.clone(), Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("timer did not fire");
    }

    #[tokio::test]
    async fn update_defers_firing() {
        let cancel = CancellationToken::new();
        let timer = ActivityTimer::new(cancel.clone(), Duration::from_millis(100));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            timer.update();
            assert!(!cancel.is_cancelled());
        }

        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("timer did not fire after updates stopped");
    }

    #[tokio::test]
    async fn set_timeout_shortens_window() {
        let cancel = CancellationToken::new();
        let timer = ActivityTimer::new(cancel.clone(), Duration::from_secs(60));
        timer.set_timeout(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("shortened window did not fire");
    }
}

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Debounced flush timer with a ceiling on how long the oldest unflushed
/// event may wait.
pub struct AutosaveScheduler {
    debounce: Duration,
    max_age: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AutosaveScheduler {
    pub fn new(debounce: Duration, max_age: Duration) -> Self {
        Self {
            debounce,
            max_age,
            timer: Mutex::new(None),
        }
    }

    /// Delay before the next flush: the full quiet window, unless the oldest
    /// buffered event would exceed `max_age` first.
    pub fn delay_for(&self, oldest_unflushed: Instant, now: Instant) -> Duration {
        let age = now.saturating_duration_since(oldest_unflushed);
        self.debounce.min(self.max_age.saturating_sub(age))
    }

    /// Replaces any pending timer with one that runs `on_fire` after the
    /// computed delay. `on_fire` runs in its own task so cancelling the timer
    /// never interrupts a flush that already started.
    pub fn arm<F, Fut>(&self, oldest_unflushed: Instant, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay_for(oldest_unflushed, Instant::now());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(on_fire());
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for AutosaveScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler() -> AutosaveScheduler {
        AutosaveScheduler::new(Duration::from_secs(2), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_collapses_to_one_flush() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        let oldest = Instant::now();
        for _ in 0..5 {
            let fired = fired.clone();
            scheduler.arm(oldest, move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_age_caps_the_debounce() {
        let scheduler = scheduler();
        let oldest = Instant::now();
        tokio::time::advance(Duration::from_millis(9_500)).await;
        assert_eq!(
            scheduler.delay_for(oldest, Instant::now()),
            Duration::from_millis(500)
        );
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(scheduler.delay_for(oldest, Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            scheduler.arm(Instant::now(), move || async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(scheduler.is_armed());
        scheduler.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_armed());
    }
}

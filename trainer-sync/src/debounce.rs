use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Runs an action once a burst of calls has gone quiet for `window`.
///
/// Each [`Debouncer::schedule`] cancels the timer armed by the previous one. Once a timer fires
/// its action is detached, so a later call never interrupts an action that already started.
pub struct Debouncer {
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tokio::spawn(action());
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Disarm the timer, if one is armed.
    pub fn cancel(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            pending.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Instant, sleep};

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_run_after_last_call() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let runs = Arc::new(AtomicUsize::new(0));
        let fired_at = Arc::new(Mutex::new(None));
        let start = Instant::now();

        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            let fired_at = Arc::clone(&fired_at);
            debouncer.schedule(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                *fired_at.lock().unwrap() = Some(Instant::now());
            });
            sleep(Duration::from_millis(100)).await;
        }

        sleep(Duration::from_millis(350)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let fired_at = fired_at.lock().unwrap().unwrap();
        assert!(fired_at - start >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms_the_timer() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        debouncer.schedule(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel();

        sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!debouncer.is_pending());
    }
}

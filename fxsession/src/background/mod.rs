use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Keyed, cancellable background tasks and timers.
///
/// Scheduling under a key that is already taken cancels the previous task first.
/// Cancelling a task that already finished is a no-op, so callers never need to know
/// whether a timer has fired.
///
/// Tasks run on the runtime that was current when the manager was built, so callers on
/// threads outside tokio can still schedule work.
pub struct BackgroundTaskManager {
    runtime: Option<Handle>,
    tasks: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self {
            runtime: Handle::try_current().ok(),
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn `future` under `key`, replacing any task with the same key.
    pub fn spawn<F>(&self, key: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            tracing::warn!(task = key, "no tokio runtime available, task dropped");
            return;
        };
        let handle = runtime.spawn(future);
        if let Some(previous) = self.tasks.lock().insert(key, handle) {
            previous.abort();
        }
    }

    /// Run `callback` once after `delay`, unless cancelled first.
    pub fn schedule<F>(&self, key: &'static str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(key, async move {
            tokio::time::sleep(delay).await;
            callback();
        });
    }

    /// Returns whether a task was registered under `key`.
    pub fn cancel(&self, key: &'static str) -> bool {
        match self.tasks.lock().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel all running tasks (used on shutdown)
    pub fn cancel_all(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }

    pub fn is_pending(&self, key: &'static str) -> bool {
        self.tasks
            .lock()
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_callback_fires_once() {
        let tasks = BackgroundTaskManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        tasks.schedule("timeout", Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(tasks.is_pending("timeout"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!tasks.is_pending("timeout"));

        // Cancelling a timer that already fired is harmless
        assert!(tasks.cancel("timeout"));
        assert!(!tasks.cancel("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_callback_never_fires() {
        let tasks = BackgroundTaskManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        tasks.schedule("retry", Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tasks.cancel("retry");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous_timer() {
        let tasks = BackgroundTaskManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = fired.clone();
            tasks.schedule("timeout", Duration::from_secs(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_from_a_thread_outside_the_runtime() {
        let tasks = Arc::new(BackgroundTaskManager::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let (scheduler, counter) = (tasks.clone(), fired.clone());
        std::thread::spawn(move || {
            scheduler.schedule("timeout", Duration::from_secs(1), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        })
        .join()
        .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_without_a_runtime_is_dropped() {
        let tasks = BackgroundTaskManager::new();
        tasks.spawn("handshake", async {});
        assert!(!tasks.is_pending("handshake"));
    }
}

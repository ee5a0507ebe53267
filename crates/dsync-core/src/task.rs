//! Keyed, cancellable delayed tasks
//!
//! Every debounce or retry timer belongs to a [`Scheduler`]; dropping the
//! scheduler (or calling [`Scheduler::cancel_all`]) aborts everything still
//! outstanding, so no callback outlives its owner.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Owner of delayed callbacks, one per key
pub struct Scheduler<K> {
    tasks: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` after `delay`, replacing any task already scheduled under `key`.
    ///
    /// Outside a tokio runtime `f` runs immediately and `false` is returned.
    pub fn schedule<F>(&self, key: K, delay: Duration, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                trace!(key = ?key, "No runtime; running task inline");
                f();
                return false;
            }
        };

        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.remove(&key) {
            previous.abort();
        }
        tasks.retain(|_, task| !task.is_finished());
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        tasks.insert(key, task);
        true
    }

    /// Cancel the task under `key`; returns whether one was pending
    pub fn cancel(&self, key: &K) -> bool {
        match self.tasks.lock().remove(key) {
            Some(task) => {
                let pending = !task.is_finished();
                task.abort();
                pending
            }
            None => false,
        }
    }

    /// Cancel everything; returns how many tasks were still pending
    pub fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let pending = tasks.values().filter(|t| !t.is_finished()).count();
        for (_, task) in tasks.drain() {
            task.abort();
        }
        pending
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.tasks.lock().get(key).map_or(false, |t| !t.is_finished())
    }

    /// Number of tasks not yet finished
    pub fn pending(&self) -> usize {
        self.tasks.lock().values().filter(|t| !t.is_finished()).count()
    }
}

impl<K> Default for Scheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for Scheduler<K> {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.abort();
        }
    }
}

impl<K> Debug for Scheduler<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_task() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = fired.clone();
            assert!(scheduler.schedule("flush", Duration::from_millis(50), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(scheduler.is_scheduled(&"flush"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&"flush"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let fired = fired.clone();
            scheduler.schedule(key, Duration::from_millis(50), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.cancel_all(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_runs_inline_without_runtime() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let deferred = scheduler.schedule(1u32, Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!deferred);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

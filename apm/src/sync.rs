//! Small synchronization helpers shared by the harvest and profiler threads.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock `mutex`, recovering the data if a previous holder panicked.
///
/// Aggregator state stays usable after a panic in unrelated code; the worst
/// case is one partially merged transaction.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A resettable flag threads can block on with a timeout.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *lock(&self.flag) = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *lock(&self.flag) = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *lock(&self.flag)
    }

    /// Block until the flag is set or `timeout` elapses.
    ///
    /// Returns whether the flag was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.flag);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_times_out_when_unset() {
        let event = Event::new();
        assert!(!event.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_on_set_from_other_thread() {
        let event = Arc::new(Event::new());
        let setter = Arc::clone(&event);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(event.wait(Duration::from_secs(5)));
        handle.join().unwrap();

        event.clear();
        assert!(!event.is_set());
    }
}

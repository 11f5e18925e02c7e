//! Value-metric producers polled once per harvest.
//!
//! A sampler that fails keeps whatever it pushed before the failure and stays
//! registered; the next harvest polls it again.

use apm_common::ValueMetric;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Instant;

use crate::sync::lock;

/// A source of value metrics, polled by the harvest.
pub trait DataSampler: Send {
    /// Short identifier used in log messages.
    fn name(&self) -> &str;

    /// Append this period's metrics to `out`.
    ///
    /// A panic is caught by the harvest, logged and handled like an error.
    ///
    /// # Errors
    /// Implementations return an error when sampling fails part way; metrics
    /// already pushed are still reported.
    fn sample(&mut self, out: &mut Vec<ValueMetric>) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct UtilizationState {
    /// Threads currently inside a tracked unit of work, with their start time
    busy: HashMap<ThreadId, Instant>,
    /// Busy thread-seconds from finished units of work
    completed: f64,
    /// Live threads that have done tracked work
    threads: HashSet<ThreadId>,
}

/// Tracks how many thread-seconds request-handling threads spend busy.
#[derive(Debug, Default)]
pub struct UtilizationTracker {
    state: Mutex<UtilizationState>,
}

impl UtilizationTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark the current thread busy until the returned guard is dropped.
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> UtilizationGuard {
        let id = std::thread::current().id();
        let joined = {
            let mut state = lock(&self.state);
            state.busy.insert(id, Instant::now());
            state.threads.insert(id)
        };
        if joined {
            let membership = Membership { tracker: Arc::downgrade(self), id };
            // Fails only while this thread's locals are being torn down
            if MEMBERSHIPS.try_with(|all| all.borrow_mut().push(membership)).is_err() {
                self.leave(id);
            }
        }
        UtilizationGuard { tracker: Arc::clone(self), id }
    }

    /// Cumulative busy thread-seconds, including work still in flight.
    #[must_use]
    pub fn utilization_count(&self) -> f64 {
        let state = lock(&self.state);
        let now = Instant::now();
        state.completed
            + state.busy.values().map(|start| now.duration_since(*start).as_secs_f64()).sum::<f64>()
    }

    /// Live threads that have done tracked work.
    ///
    /// A thread is counted from its first [`UtilizationTracker::enter`] until
    /// it exits.
    #[must_use]
    pub fn total_threads(&self) -> usize {
        lock(&self.state).threads.len()
    }

    fn exit(&self, id: ThreadId) {
        let mut state = lock(&self.state);
        if let Some(start) = state.busy.remove(&id) {
            state.completed += start.elapsed().as_secs_f64();
        }
    }

    fn leave(&self, id: ThreadId) {
        self.exit(id);
        lock(&self.state).threads.remove(&id);
    }
}

/// Removes its thread from a tracker when the thread's locals are dropped.
struct Membership {
    tracker: Weak<UtilizationTracker>,
    id: ThreadId,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.leave(self.id);
        }
    }
}

thread_local! {
    static MEMBERSHIPS: RefCell<Vec<Membership>> = const { RefCell::new(Vec::new()) };
}

pub struct UtilizationGuard {
    tracker: Arc<UtilizationTracker>,
    id: ThreadId,
}

impl Drop for UtilizationGuard {
    fn drop(&mut self) {
        self.tracker.exit(self.id);
    }
}

/// Reports `Instance/Available`, `Instance/Used` and `Instance/Busy`.
///
/// Nothing is reported until some thread has been tracked; task systems with
/// no request threads would otherwise report misleading zeros.
pub struct ThreadUtilizationSampler {
    tracker: Arc<UtilizationTracker>,
    last_timestamp: Instant,
    last_count: f64,
}

impl ThreadUtilizationSampler {
    #[must_use]
    pub fn new(tracker: Arc<UtilizationTracker>) -> Self {
        let last_count = tracker.utilization_count();
        Self { tracker, last_timestamp: Instant::now(), last_count }
    }
}

impl DataSampler for ThreadUtilizationSampler {
    fn name(&self) -> &str {
        "thread-utilization"
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self, out: &mut Vec<ValueMetric>) -> anyhow::Result<()> {
        let now = Instant::now();
        let count = self.tracker.utilization_count();
        let elapsed = now.duration_since(self.last_timestamp).as_secs_f64();

        let used = if elapsed > 0.0 { (count - self.last_count) / elapsed } else { 0.0 };

        self.last_timestamp = now;
        self.last_count = count;

        let total = self.tracker.total_threads();
        if total > 0 {
            out.push(ValueMetric::new("Instance/Available", total as f64));
            out.push(ValueMetric::new("Instance/Used", used));
            out.push(ValueMetric::new("Instance/Busy", used / total as f64));
        }
        Ok(())
    }
}

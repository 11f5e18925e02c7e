//! One thread profiling session.
//!
//! A [`ThreadProfiler`] owns a background thread that samples every live
//! stack from a [`StackSource`] each `sample_period` until `duration` has
//! elapsed or [`ThreadProfiler::stop_profiling`] is called. Instances are not
//! reused; a new session gets a new profiler.
//!
//! Two channels coordinate the sampler thread:
//!
//! - shutdown: the profiler holds the only sender and drops it to stop the
//!   loop, which wakes any pending `recv_timeout`
//! - done: the loop holds the only sender and drops it on exit, which is how
//!   [`ThreadProfiler::is_finished`] observes completion

use apm_common::ProfilePayload;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::call_tree::{method_stack, CallForest};
use crate::domain::{now_secs, ProfileError, ThreadCategory};
use crate::stack::{self, StackSource};
use crate::sync::lock;

/// Parameters of one profiling session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilerConfig {
    pub profile_id: i64,
    pub sample_period: Duration,
    pub duration: Duration,
    /// Also sample the agent's own threads
    pub profile_agent_code: bool,
    /// Drop agent frames from non-agent threads
    pub ignore_agent_frames: bool,
    /// Node budget applied when the payload is built
    pub node_limit: usize,
}

#[derive(Debug, Default)]
struct ProfileState {
    forest: CallForest,
    sample_count: u64,
    start_time: f64,
    stop_time: f64,
}

struct Sampler {
    config: ProfilerConfig,
    source: Arc<dyn StackSource>,
    state: Mutex<ProfileState>,
}

impl Sampler {
    fn collect_sample(&self) {
        // Capture outside the state lock; collection locks every thread's stack
        let stacks = self.source.collect();

        let mut state = lock(&self.state);
        state.sample_count += 1;
        for captured in stacks {
            if captured.category == ThreadCategory::Agent && !self.config.profile_agent_code {
                continue;
            }
            let methods =
                method_stack(&captured.frames, captured.category, self.config.ignore_agent_frames);
            state.forest.merge_stack(captured.category, &methods);
        }
    }

    fn run(&self, shutdown: &Receiver<()>) {
        let period = self.config.sample_period.as_secs_f64();

        loop {
            if matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }

            self.collect_sample();

            let remaining = lock(&self.state).stop_time - now_secs();
            if remaining < period {
                lock(&self.state).stop_time = now_secs();
                return;
            }

            match shutdown.recv_timeout(self.config.sample_period) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

pub struct ThreadProfiler {
    sampler: Arc<Sampler>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    done_rx: Mutex<Option<Receiver<()>>>,
}

impl ThreadProfiler {
    #[must_use]
    pub fn new(config: ProfilerConfig, source: Arc<dyn StackSource>) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            sampler: Arc::new(Sampler { config, source, state: Mutex::new(ProfileState::default()) }),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            done_rx: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProfilerConfig {
        &self.sampler.config
    }

    /// Record the session window and launch the sampler thread.
    ///
    /// # Errors
    /// Returns an error if the sampler thread cannot be spawned
    pub fn start_profiling(&self) -> std::io::Result<()> {
        let mut done_slot = lock(&self.done_rx);
        if done_slot.is_some() {
            warn!("Profile {} already started", self.sampler.config.profile_id);
            return Ok(());
        }

        {
            let mut state = lock(&self.sampler.state);
            state.start_time = now_secs();
            state.stop_time = state.start_time + self.sampler.config.duration.as_secs_f64();
        }

        let (done_tx, done_rx) = bounded::<()>(1);
        let sampler = Arc::clone(&self.sampler);
        let shutdown = self.shutdown_rx.clone();

        thread::Builder::new().name("apm-profiler".to_string()).spawn(move || {
            stack::register_current_thread(ThreadCategory::Agent);
            let _done = done_tx;
            sampler.run(&shutdown);
            debug!("Profile {} sampler exited", sampler.config.profile_id);
        })?;

        *done_slot = Some(done_rx);
        info!(
            "Started thread profile {} (period {:?}, duration {:?})",
            self.sampler.config.profile_id,
            self.sampler.config.sample_period,
            self.sampler.config.duration
        );
        Ok(())
    }

    /// Ask the sampler thread to stop.
    ///
    /// With `wait_for_completion` this blocks until the thread exits, but no
    /// longer than one sample period.
    pub fn stop_profiling(&self, wait_for_completion: bool) {
        lock(&self.sampler.state).stop_time = now_secs();
        lock(&self.shutdown_tx).take();

        if wait_for_completion {
            let period = self.sampler.config.sample_period;
            if let Some(done) = lock(&self.done_rx).as_ref() {
                if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(period) {
                    debug!(
                        "Profile {} sampler still running {:?} after stop",
                        self.sampler.config.profile_id, period
                    );
                }
            }
        }
    }

    /// Whether no sampler thread is running.
    ///
    /// A profiler that was never started counts as finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match lock(&self.done_rx).as_ref() {
            None => true,
            Some(done) => matches!(done.try_recv(), Err(TryRecvError::Disconnected)),
        }
    }

    #[must_use]
    pub fn sample_count(&self) -> u64 {
        lock(&self.sampler.state).sample_count
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        lock(&self.sampler.state).forest.node_count()
    }

    /// Take one sample immediately on the calling thread.
    pub fn sample_now(&self) {
        self.sampler.collect_sample();
    }

    /// Build the report once sampling has finished.
    ///
    /// Returns `Ok(None)` while the sampler thread is still alive. Pruning to
    /// the node limit happens here, so the trees stay exact until reporting.
    ///
    /// # Errors
    /// Returns an error if the trees cannot be encoded
    pub fn profile_data(&self) -> Result<Option<ProfilePayload>, ProfileError> {
        if !self.is_finished() {
            return Ok(None);
        }

        let mut state = lock(&self.sampler.state);
        state.forest.prune(self.sampler.config.node_limit);

        Ok(Some(ProfilePayload {
            profile_id: self.sampler.config.profile_id,
            start_ms: state.start_time * 1000.0,
            stop_ms: state.stop_time * 1000.0,
            sample_count: state.sample_count,
            encoded_data: state.forest.encode()?,
            thread_count: state.forest.thread_count(),
        }))
    }
}

impl Drop for ThreadProfiler {
    fn drop(&mut self) {
        lock(&self.shutdown_tx).take();
    }
}

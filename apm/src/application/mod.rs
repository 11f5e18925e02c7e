//! # Application
//!
//! One monitored application's connection to the collector and everything
//! waiting to be reported on it.
//!
//! ## Session Lifecycle
//!
//! ```text
//! Disconnected ──activate_session()──▶ Connecting ──registered──▶ Connected
//!      ▲                                   │  ▲                       │
//!      │                                   └──┘ backoff               │
//!      └──────────── ForceRestart (harvest) ◀─────────────────────────┤
//!                                                                     ▼
//!                                      Shutdown ◀── ForceDisconnect (harvest)
//! ```
//!
//! ## Locking
//!
//! - transaction stats and custom stats each sit behind their own mutex and
//!   are never held together
//! - the active session and the URL rules are swapped atomically; readers
//!   take a local copy and never block
//! - harvests are serialized by `harvest_lock`, which recording never takes
//!
//! ## Sub-Modules
//!
//! - `harvest` - The periodic report cycle and its failure handling
//! - `retry` - Registration backoff schedule

mod harvest;
pub mod retry;

use apm_common::{
    CommandReply, Configuration, Connector, MetricKey, Session, Settings, TimeStats,
    TransactionData, ValueMetric,
};
use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, error, info, log, warn};
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::commands::{StartProfilerArgs, StopProfilerArgs};
use crate::domain::{now_secs, ThreadCategory};
use crate::internal::InternalMetrics;
use crate::profiler::{ProfilerConfig, ThreadProfiler};
use crate::rules::RulesEngine;
use crate::samplers::{DataSampler, ThreadUtilizationSampler, UtilizationTracker};
use crate::stack::{self, StackSource};
use crate::stats::StatsEngine;
use crate::sync::{lock, Event};

pub use retry::{RetrySchedule, RetryStep};

/// Blocks the registration worker between attempts.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Debug, Default)]
struct TransactionStats {
    engine: StatsEngine,
    transaction_count: u64,
    last_transaction: f64,
}

#[derive(Default)]
struct ProfilerSlot {
    profiler: Option<ThreadProfiler>,
    started: bool,
    send_data: bool,
}

pub struct Application {
    name: String,
    linked_applications: Vec<String>,
    settings: Settings,
    creation_time: f64,

    // Collaborators
    connector: Arc<dyn Connector>,
    stack_source: Arc<dyn StackSource>,
    sleeper: Sleeper,

    // Session state
    active_session: ArcSwapOption<Box<dyn Session>>,
    rules: ArcSwap<RulesEngine>,
    connected: Event,
    connecting: AtomicBool,
    shutdown: AtomicBool,
    agent_restart: AtomicU64,

    // Aggregation
    transactions: Mutex<TransactionStats>,
    custom_stats: Mutex<StatsEngine>,
    samplers: Mutex<Vec<Box<dyn DataSampler>>>,
    utilization: Arc<UtilizationTracker>,

    // Harvest bookkeeping
    harvest_lock: Mutex<()>,
    period_start: Mutex<f64>,
    harvest_count: AtomicU64,
    merge_count: AtomicU32,
    discard_count: AtomicU64,

    profiler: Mutex<ProfilerSlot>,
}

impl Application {
    /// Create a disconnected application named after `settings.app_name`.
    ///
    /// A thread utilization sampler is registered by default; feed it through
    /// [`Application::thread_utilization`].
    #[must_use]
    pub fn new(
        settings: Settings,
        connector: Arc<dyn Connector>,
        stack_source: Arc<dyn StackSource>,
    ) -> Self {
        let linked: BTreeSet<String> = settings.linked_applications.iter().cloned().collect();
        let utilization = UtilizationTracker::new();
        let samplers: Vec<Box<dyn DataSampler>> =
            vec![Box::new(ThreadUtilizationSampler::new(Arc::clone(&utilization)))];

        Self {
            name: settings.app_name.clone(),
            linked_applications: linked.into_iter().collect(),
            settings,
            creation_time: now_secs(),
            connector,
            stack_source,
            sleeper: Arc::new(thread::sleep),
            active_session: ArcSwapOption::empty(),
            rules: ArcSwap::from_pointee(RulesEngine::default()),
            connected: Event::new(),
            connecting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            agent_restart: AtomicU64::new(0),
            transactions: Mutex::new(TransactionStats::default()),
            custom_stats: Mutex::new(StatsEngine::new()),
            samplers: Mutex::new(samplers),
            utilization,
            harvest_lock: Mutex::new(()),
            period_start: Mutex::new(0.0),
            harvest_count: AtomicU64::new(0),
            merge_count: AtomicU32::new(0),
            discard_count: AtomicU64::new(0),
            profiler: Mutex::new(ProfilerSlot::default()),
        }
    }

    /// Replace how the registration worker waits between attempts.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Register an extra sampler, polled once per harvest.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Box<dyn DataSampler>) -> Self {
        self.samplers.get_mut().unwrap_or_else(PoisonError::into_inner).push(sampler);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Linked application names, sorted and deduplicated.
    #[must_use]
    pub fn linked_applications(&self) -> &[String] {
        &self.linked_applications
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Configuration of the active session, if connected.
    #[must_use]
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.active_session.load_full().map(|session| Arc::clone(session.configuration()))
    }

    #[must_use]
    pub fn thread_utilization(&self) -> &Arc<UtilizationTracker> {
        &self.utilization
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.active_session.load().is_some()
    }

    /// Whether the collector permanently disconnected this application.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn harvest_count(&self) -> u64 {
        self.harvest_count.load(Ordering::SeqCst)
    }

    /// Consecutive harvests whose metrics were merged back for retry.
    #[must_use]
    pub fn merge_count(&self) -> u32 {
        self.merge_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn discard_count(&self) -> u64 {
        self.discard_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn agent_restart_count(&self) -> u64 {
        self.agent_restart.load(Ordering::SeqCst)
    }

    /// Transactions recorded since the last harvest or reconnect.
    #[must_use]
    pub fn transaction_count(&self) -> u64 {
        lock(&self.transactions).transaction_count
    }

    /// Unharvested stats recorded under `key`.
    #[must_use]
    pub fn metric_stats(&self, key: &MetricKey) -> Option<TimeStats> {
        lock(&self.transactions).engine.get(key).copied()
    }

    #[must_use]
    pub fn is_profiling(&self) -> bool {
        lock(&self.profiler).started
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Start registering with the collector in the background.
    ///
    /// Does nothing when already connected, permanently shut down, or while a
    /// registration worker is still running.
    pub fn activate_session(self: &Arc<Self>) {
        if self.is_connected() || self.is_shutdown() {
            return;
        }

        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Registration of {:?} already in progress", self.name);
            return;
        }

        self.connected.clear();

        let app = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("apm-activate/{}", self.name))
            .spawn(move || app.connect_to_data_collector());

        if let Err(err) = spawned {
            error!("Unable to start registration worker for {:?}: {err}", self.name);
            self.connecting.store(false, Ordering::SeqCst);
        }
    }

    /// Block up to `timeout` for registration to complete.
    ///
    /// Returns whether the application is connected.
    pub fn wait_for_session_activation(&self, timeout: Duration) -> bool {
        if self.connected.wait(timeout) {
            return true;
        }
        debug!("Timeout waiting for collector connection with timeout of {timeout:?}");
        false
    }

    /// Register with the collector, retrying until a session is obtained.
    ///
    /// Runs on the worker started by [`Application::activate_session`] but
    /// can be called directly; it returns at once if a session exists.
    pub fn connect_to_data_collector(&self) {
        stack::register_current_thread(ThreadCategory::Agent);

        let mut schedule = RetrySchedule::new();
        let (session, rules) = loop {
            if self.is_connected() || self.is_shutdown() {
                self.connecting.store(false, Ordering::SeqCst);
                return;
            }

            if let Some(registered) = self.register() {
                break registered;
            }

            let step = schedule.next_step();
            let attempts = schedule.failures();
            match step.level {
                Some(level) => log!(
                    level,
                    "Registration of {:?} with the collector has failed after {attempts} attempts; retrying in {:?}",
                    self.name,
                    step.delay
                ),
                None => debug!(
                    "Registration of {:?} failed (attempt {attempts}); retrying in {:?}",
                    self.name, step.delay
                ),
            }
            (self.sleeper)(step.delay);
        };

        let configuration = Arc::clone(session.configuration());
        self.rules.store(Arc::new(rules));

        {
            let mut transactions = lock(&self.transactions);
            transactions.engine.reset_stats(Arc::clone(&configuration));
            transactions.transaction_count = 0;
            transactions.last_transaction = 0.0;
        }
        lock(&self.custom_stats).reset_stats(Arc::clone(&configuration));

        *lock(&self.period_start) = now_secs();
        self.merge_count.store(0, Ordering::SeqCst);

        self.active_session.store(Some(Arc::new(session)));
        self.connecting.store(false, Ordering::SeqCst);
        self.connected.set();

        info!(
            "Registered {:?} with the collector (agent run id {})",
            self.name, configuration.agent_run_id
        );
    }

    /// One registration attempt, including rule compilation.
    fn register(&self) -> Option<(Box<dyn Session>, RulesEngine)> {
        let session =
            self.connector.create_session(&self.name, &self.linked_applications, &self.settings)?;

        match RulesEngine::new(&session.configuration().url_rules) {
            Ok(rules) => Some((session, rules)),
            Err(err) => {
                error!("Discarding session for {:?}: {err}", self.name);
                if let Err(err) = session.shutdown_session() {
                    debug!("Ignoring failure to shut down rejected session: {err}");
                }
                None
            }
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Apply the collector's URL rules to `name`.
    ///
    /// Returns the name unchanged while disconnected. The flag reports
    /// whether a rule marked the transaction as ignored.
    #[must_use]
    pub fn normalize_name(&self, name: &str) -> (String, bool) {
        if !self.is_connected() {
            return (name.to_string(), false);
        }
        self.rules.load().normalize(name)
    }

    /// Record a value against the application rather than a transaction.
    ///
    /// Takes the custom metric lock on every call; prefer attaching custom
    /// metrics to a transaction on hot paths.
    pub fn record_metric(&self, name: &str, value: f64) {
        if !self.is_connected() {
            return;
        }
        lock(&self.custom_stats).record_value_metric(&ValueMetric::new(name, value));
    }

    /// Record several values under one acquisition of the custom metric lock.
    pub fn record_metrics<I, S>(&self, metrics: I)
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        if !self.is_connected() {
            return;
        }
        let mut custom = lock(&self.custom_stats);
        for (name, value) in metrics {
            custom.record_value_metric(&ValueMetric::new(name, value));
        }
    }

    /// Fold a completed transaction into the current period.
    ///
    /// Metrics are extracted into a private workarea before the transaction
    /// lock is taken. A transaction that fails extraction is logged and
    /// dropped without being counted.
    pub fn record_transaction(&self, data: &TransactionData) {
        if !self.is_connected() {
            return;
        }

        let mut workarea = {
            let transactions = lock(&self.transactions);
            if transactions.engine.settings().is_none() {
                return;
            }
            transactions.engine.create_workarea()
        };

        if let Err(err) = workarea.record_transaction(data) {
            error!("Unable to record transaction {:?}: {err}", data.name);
            return;
        }

        let mut internal = InternalMetrics::new();
        internal.record_count("Supportability/Transaction/Counts/metric_data", workarea.metrics_count());

        let mut transactions = lock(&self.transactions);
        transactions.transaction_count += 1;
        transactions.last_transaction = data.end_time;
        transactions.engine.merge_metric_stats(&workarea);
        transactions.engine.merge_other_stats(workarea);
        transactions.engine.merge_value_metrics(internal.take());
    }

    // =========================================================================
    // Profiler commands
    // =========================================================================

    /// Start a thread profiling session on the collector's request.
    pub fn start_profiler(&self, args: &StartProfilerArgs) -> CommandReply {
        let Some(configuration) = self.configuration() else {
            return CommandReply::error("Not connected");
        };

        if !configuration.thread_profiler.enabled {
            warn!(
                "Collector requested a thread profiling session, but the thread profiler is disabled"
            );
            return CommandReply::error("The profiler service is disabled");
        }

        let mut slot = lock(&self.profiler);
        if slot.started {
            warn!(
                "Collector requested thread profile {} while a session is in progress",
                args.profile_id
            );
            return CommandReply::error("Profiler already running");
        }

        if !self.stack_source.is_supported() {
            warn!("Thread profiling is not supported by the configured stack source");
            return CommandReply::error("Profiler not supported");
        }

        let (Some(sample_period), Some(duration)) = (args.sample_period(), args.duration()) else {
            warn!(
                "Rejecting thread profile {} with sample period {} and duration {}",
                args.profile_id, args.sample_period, args.duration
            );
            return CommandReply::error("Invalid profiler arguments");
        };

        let profiler = ThreadProfiler::new(
            ProfilerConfig {
                profile_id: args.profile_id,
                sample_period,
                duration,
                profile_agent_code: args.profile_agent_code,
                ignore_agent_frames: self.settings.thread_profiler.ignore_agent_frames,
                node_limit: configuration.agent_limits.thread_profiler_nodes,
            },
            Arc::clone(&self.stack_source),
        );

        if let Err(err) = profiler.start_profiling() {
            error!("Unable to start thread profiler: {err}");
            return CommandReply::error("Profiler failed to start");
        }

        info!("Starting thread profiling session for {:?}", self.name);
        slot.profiler = Some(profiler);
        slot.started = true;
        slot.send_data = true;
        CommandReply::ok()
    }

    /// Stop the running profiling session, waiting for its sampler to exit.
    pub fn stop_profiler(&self, args: &StopProfilerArgs) -> CommandReply {
        let mut slot = lock(&self.profiler);
        if !slot.started {
            warn!("Received a stop_profiler command but the profiler is not running");
            return CommandReply::error("Profiler not running.");
        }

        if let Some(profiler) = slot.profiler.as_ref() {
            profiler.stop_profiling(true);
        }

        info!("Stopping thread profiling session for {:?}", self.name);
        slot.send_data = args.report_data;
        CommandReply::ok()
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Write a human-readable status report.
    ///
    /// # Errors
    /// Returns an error if writing to `out` fails
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "Time Created: {:.3}", self.creation_time)?;
        writeln!(out, "Linked Applications: {:?}", self.linked_applications)?;
        writeln!(out, "Harvest Count: {}", self.harvest_count())?;
        writeln!(out, "Agent Restart: {}", self.agent_restart_count())?;
        writeln!(out, "Forced Shutdown: {}", self.is_shutdown())?;

        let Some(session) = self.active_session.load_full() else {
            return Ok(());
        };

        let rules: Vec<String> =
            self.rules.load().rules().iter().map(|rule| rule.match_expression.clone()).collect();
        let (transaction_count, last_transaction, metrics_count) = {
            let transactions = lock(&self.transactions);
            (
                transactions.transaction_count,
                transactions.last_transaction,
                transactions.engine.metrics_count(),
            )
        };

        writeln!(out, "Agent Run ID: {}", session.configuration().agent_run_id)?;
        writeln!(out, "Normalization Rules: {rules:?}")?;
        writeln!(out, "Harvest Period Start: {:.3}", *lock(&self.period_start))?;
        writeln!(out, "Transaction Count: {transaction_count}")?;
        writeln!(out, "Last Transaction: {last_transaction:.3}")?;
        writeln!(out, "Harvest Metrics Count: {metrics_count}")?;
        writeln!(out, "Harvest Merge Count: {}", self.merge_count())?;
        writeln!(out, "Harvest Discard Count: {}", self.discard_count())?;
        Ok(())
    }
}

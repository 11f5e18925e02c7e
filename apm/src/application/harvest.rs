//! The periodic report cycle.
//!
//! ```text
//! snapshot stats ─▶ samplers ─▶ send metrics ─▶ errors / SQL / traces
//!                                   │               ─▶ agent commands
//!                                   │               ─▶ finished profile
//!                                   ▼
//!                      SessionError ─▶ restart | disconnect | merge back | discard
//! ```
//!
//! Anything that goes wrong after the metric data was accepted only loses the
//! remainder of that period; only a failed metric send can be merged back.

use apm_common::{Session, SessionError, ValueMetric};
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::Application;
use crate::commands;
use crate::domain::now_secs;
use crate::internal::{InternalMetrics, InternalTrace};
use crate::stats::StatsEngine;
use crate::sync::lock;

/// Collectors reject reporting periods shorter than a second.
const MIN_SHUTDOWN_PERIOD: f64 = 1.0;
const STRETCHED_SHUTDOWN_PERIOD: f64 = 1.001;

#[derive(Debug, Clone, Copy)]
struct Period {
    start: f64,
    end: f64,
    shutdown: bool,
}

impl Application {
    /// Report the current period to the collector.
    ///
    /// `shutdown` marks the final harvest before the process exits: the
    /// session is shut down afterwards and a very short period is stretched
    /// to one second. Does nothing without an active session or after a
    /// forced disconnect. Never fails; collector problems are handled here.
    pub fn harvest(self: &Arc<Self>, shutdown: bool) {
        let _serial = lock(&self.harvest_lock);

        if self.is_shutdown() {
            return;
        }

        let Some(session) = self.active_session.load_full() else {
            debug!("Cannot harvest data for {:?} as there is no active session", self.name);
            return;
        };

        let mut internal = InternalMetrics::new();
        {
            let mut trace = InternalTrace::new("Supportability/Harvest/Calls/harvest", &mut internal);
            self.harvest_period(&**session, shutdown, trace.metrics());
        }

        // Costs of this harvest are reported with the next one
        lock(&self.transactions).engine.merge_value_metrics(internal.take());
    }

    fn harvest_period(
        self: &Arc<Self>,
        session: &dyn Session,
        shutdown: bool,
        internal: &mut InternalMetrics,
    ) {
        self.harvest_count.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        debug!("Commencing data harvest for {:?}", self.name);

        let (transaction_count, mut stats) = {
            let mut transactions = lock(&self.transactions);
            let count = std::mem::take(&mut transactions.transaction_count);
            transactions.last_transaction = 0.0;
            (count, transactions.engine.harvest_snapshot())
        };
        let custom = lock(&self.custom_stats).harvest_snapshot();
        stats.merge_metric_stats(&custom);

        self.run_samplers(&mut stats);
        stats.record_value_metric(&ValueMetric::new("Instance/Reporting", 0.0));

        let start = *lock(&self.period_start);
        let mut end = now_secs();
        if shutdown && transaction_count != 0 && end - start < MIN_SHUTDOWN_PERIOD {
            debug!("Stretching harvest duration for forced harvest on shutdown");
            end = start + STRETCHED_SHUTDOWN_PERIOD;
        }
        let period = Period { start, end, shutdown };

        let mut metrics_sent = false;
        match self.report(session, &stats, period, &mut metrics_sent, internal) {
            Ok(()) => {}
            Err(SessionError::ForceRestart) => {
                info!("Collector requested a restart of {:?}", self.name);
                shutdown_quietly(session);
                self.agent_restart.fetch_add(1, Ordering::SeqCst);
                self.active_session.store(None);
                self.activate_session();
            }
            Err(SessionError::ForceDisconnect) => {
                warn!("Collector requested {:?} to stop reporting", self.name);
                shutdown_quietly(session);
                self.active_session.store(None);
                self.shutdown.store(true, Ordering::SeqCst);
            }
            Err(SessionError::Retry(reason)) => {
                if !metrics_sent {
                    self.merge_back(session, &stats, &reason);
                }
            }
            Err(SessionError::Discard(reason)) => {
                warn!("Discarding harvest data for {:?}: {reason}", self.name);
                self.discard_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(SessionError::Unexpected(err)) => {
                error!("Unexpected failure when harvesting data for {:?}: {err:#}", self.name);
            }
        }

        debug!("Completed harvest for {:?} in {:.2}s", self.name, started.elapsed().as_secs_f64());

        if let Some(current) = self.active_session.load_full() {
            current.close_connection();
        }
    }

    /// Poll every sampler into `stats`, keeping partial output of failures.
    ///
    /// A panicking sampler is treated like a failing one.
    fn run_samplers(&self, stats: &mut StatsEngine) {
        let mut samplers = lock(&self.samplers);
        for sampler in samplers.iter_mut() {
            let mut values = Vec::new();
            let result = panic::catch_unwind(AssertUnwindSafe(|| sampler.sample(&mut values)));
            stats.merge_value_metrics(values);
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("Data sampler {} failed: {err:#}", sampler.name()),
                Err(_) => error!("Data sampler {} panicked", sampler.name()),
            }
        }
    }

    fn report(
        &self,
        session: &dyn Session,
        stats: &StatsEngine,
        period: Period,
        metrics_sent: &mut bool,
        internal: &mut InternalMetrics,
    ) -> Result<(), SessionError> {
        let configuration = Arc::clone(session.configuration());

        let metric_data = stats.metric_data();
        internal.record_count("Supportability/Harvest/Counts/metric_data", metric_data.len());
        let metric_ids = session.send_metric_data(period.start, period.end, &metric_data)?;

        *metrics_sent = true;
        self.merge_count.store(0, Ordering::SeqCst);
        *lock(&self.period_start) = period.end;
        lock(&self.transactions).engine.update_metric_ids(metric_ids);

        if configuration.collect_errors {
            let errors = stats.error_data();
            internal.record_count("Supportability/Harvest/Counts/error_data", errors.len());
            if !errors.is_empty() {
                session.send_errors(&errors)?;
            }
        }

        if configuration.collect_traces {
            let slow_sql = stats.slow_sql_data();
            internal.record_count("Supportability/Harvest/Counts/sql_trace_data", slow_sql.len());
            if !slow_sql.is_empty() {
                session.send_sql_traces(&slow_sql)?;
            }

            let traces = stats.transaction_trace_data();
            internal.record_count(
                "Supportability/Harvest/Counts/transaction_sample_data",
                traces.len(),
            );
            if !traces.is_empty() {
                session.send_transaction_traces(&traces)?;
            }
        }

        for request in session.get_agent_commands()? {
            if let Some(results) = commands::dispatch(self, &request) {
                session.send_agent_command_results(&results)?;
            }
        }

        self.report_profile(session)?;

        if period.shutdown {
            shutdown_quietly(session);
            self.active_session.store(None);
        }

        Ok(())
    }

    /// Return an unsent snapshot to the live stats, up to the merge limit.
    fn merge_back(&self, session: &dyn Session, stats: &StatsEngine, reason: &str) {
        let maximum = session.configuration().agent_limits.merge_stats_maximum;
        let merges = self.merge_count.fetch_add(1, Ordering::SeqCst) + 1;

        if merges <= maximum {
            debug!("Retrying harvest data for {:?} next period ({merges}/{maximum}): {reason}", self.name);
            lock(&self.transactions).engine.merge_metric_stats(stats);
            return;
        }

        error!(
            "Unable to report main transaction metrics for {:?} after {maximum} successive attempts; discarding",
            self.name
        );
        self.discard_count.fetch_add(u64::from(merges), Ordering::SeqCst);
        self.merge_count.store(0, Ordering::SeqCst);
    }

    /// Send a finished profile if one was requested.
    fn report_profile(&self, session: &dyn Session) -> Result<(), SessionError> {
        let mut slot = lock(&self.profiler);
        if !slot.started {
            return Ok(());
        }
        let Some(profiler) = slot.profiler.as_ref() else {
            return Ok(());
        };

        let payload = match profiler.profile_data() {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(()),
            Err(err) => {
                error!("Unable to encode thread profile for {:?}: {err}", self.name);
                *slot = super::ProfilerSlot::default();
                return Ok(());
            }
        };

        if slot.send_data {
            info!("Finished thread profiling for {:?}", self.name);
            session.send_profile_data(&[payload])?;
        } else {
            debug!("Dropping thread profile {} as reporting was not requested", payload.profile_id);
        }

        *slot = super::ProfilerSlot::default();
        Ok(())
    }
}

fn shutdown_quietly(session: &dyn Session) {
    if let Err(err) = session.shutdown_session() {
        debug!("Ignoring failure to shut down session: {err}");
    }
}

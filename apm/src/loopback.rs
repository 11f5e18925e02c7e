//! In-process stand-in for the collector.
//!
//! Every payload is logged instead of sent: a summary at `info`, the JSON
//! body at `debug`. Registration always succeeds with the configured
//! [`Configuration`], and queued agent commands are handed out on the next
//! poll, which lets the demo binary drive a profiling session end to end.

use apm_common::{
    AgentCommandRequest, CommandResults, Configuration, Connector, ErrorTrace, MetricData,
    MetricIds, MetricKey, MetricSpec, ProfilePayload, Session, SessionError, Settings,
    SlowSqlTrace, TransactionTrace,
};
use log::{debug, info};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

pub struct LoopbackConnector {
    configuration: Arc<Configuration>,
    commands: Arc<Mutex<VecDeque<AgentCommandRequest>>>,
    next_run_id: AtomicU64,
}

impl LoopbackConnector {
    #[must_use]
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration: Arc::new(configuration),
            commands: Arc::new(Mutex::new(VecDeque::new())),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Hand `command` to whichever session polls for commands next.
    pub fn queue_command(&self, command: AgentCommandRequest) {
        lock(&self.commands).push_back(command);
    }
}

impl Connector for LoopbackConnector {
    fn create_session(
        &self,
        app_name: &str,
        linked_applications: &[String],
        _settings: &Settings,
    ) -> Option<Box<dyn Session>> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        info!("loopback: registered {app_name:?} (linked {linked_applications:?}) as run {run_id}");

        let mut configuration = (*self.configuration).clone();
        configuration.agent_run_id = run_id;

        Some(Box::new(LoopbackSession {
            configuration: Arc::new(configuration),
            commands: Arc::clone(&self.commands),
            metric_ids: Mutex::new(HashMap::new()),
        }))
    }
}

struct LoopbackSession {
    configuration: Arc<Configuration>,
    commands: Arc<Mutex<VecDeque<AgentCommandRequest>>>,
    metric_ids: Mutex<HashMap<MetricKey, u64>>,
}

fn log_payload<T: Serialize + ?Sized>(kind: &str, payload: &T) {
    match serde_json::to_string(payload) {
        Ok(json) => debug!("loopback: {kind} {json}"),
        Err(err) => debug!("loopback: {kind} is not serializable: {err}"),
    }
}

impl Session for LoopbackSession {
    fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    fn send_metric_data(
        &self,
        start: f64,
        end: f64,
        data: &[MetricData],
    ) -> Result<MetricIds, SessionError> {
        info!("loopback: {} metrics for [{start:.3}, {end:.3}]", data.len());
        log_payload("metric_data", data);

        // Issue an ID for every metric that was still sent by name
        let mut known = lock(&self.metric_ids);
        let mut issued = Vec::new();
        for row in data {
            if let MetricSpec::Named(key) = &row.spec {
                let next = u64::try_from(known.len()).unwrap_or(u64::MAX) + 1;
                let id = *known.entry(key.clone()).or_insert(next);
                issued.push((key.clone(), id));
            }
        }
        Ok(issued)
    }

    fn send_errors(&self, errors: &[ErrorTrace]) -> Result<(), SessionError> {
        info!("loopback: {} error traces", errors.len());
        log_payload("error_data", errors);
        Ok(())
    }

    fn send_sql_traces(&self, traces: &[SlowSqlTrace]) -> Result<(), SessionError> {
        info!("loopback: {} slow SQL traces", traces.len());
        log_payload("sql_trace_data", traces);
        Ok(())
    }

    fn send_transaction_traces(&self, traces: &[TransactionTrace]) -> Result<(), SessionError> {
        info!("loopback: {} transaction traces", traces.len());
        log_payload("transaction_sample_data", traces);
        Ok(())
    }

    fn get_agent_commands(&self) -> Result<Vec<AgentCommandRequest>, SessionError> {
        Ok(lock(&self.commands).drain(..).collect())
    }

    fn send_agent_command_results(&self, results: &CommandResults) -> Result<(), SessionError> {
        log_payload("agent_command_results", results);
        Ok(())
    }

    fn send_profile_data(&self, profiles: &[ProfilePayload]) -> Result<(), SessionError> {
        for profile in profiles {
            info!(
                "loopback: profile {} with {} samples over {} threads ({} bytes encoded)",
                profile.profile_id,
                profile.sample_count,
                profile.thread_count,
                profile.encoded_data.len()
            );
        }
        log_payload("profile_data", profiles);
        Ok(())
    }

    fn shutdown_session(&self) -> Result<(), SessionError> {
        info!("loopback: session {} shut down", self.configuration.agent_run_id);
        Ok(())
    }

    fn close_connection(&self) {
        debug!("loopback: connection closed");
    }
}

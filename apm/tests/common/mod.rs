//! Scripted collector fakes shared by the integration tests.

#![allow(dead_code)]

use apm::domain::ThreadCategory;
use apm::stack::{CapturedStack, Frame, StackSource, ThreadRegistry};
use apm::Application;
use apm_common::{
    AgentCommandRequest, CommandResults, Configuration, Connector, ErrorRecord, ErrorTrace,
    MetricData, MetricIds, MetricSpec, ProfilePayload, Session, SessionError, Settings,
    SlowSqlTrace, TransactionData, TransactionTrace,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What the next scripted call fails with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Restart,
    Disconnect,
    Retry,
    Discard,
    Unexpected,
}

impl Outcome {
    fn into_error(self) -> SessionError {
        match self {
            Outcome::Restart => SessionError::ForceRestart,
            Outcome::Disconnect => SessionError::ForceDisconnect,
            Outcome::Retry => SessionError::Retry("collector unavailable".to_string()),
            Outcome::Discard => SessionError::Discard("payload rejected".to_string()),
            Outcome::Unexpected => SessionError::Unexpected(anyhow::anyhow!("socket exploded")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricReport {
    pub start: f64,
    pub end: f64,
    pub data: Vec<MetricData>,
}

impl MetricReport {
    /// Call count of the unscoped metric `name`, if reported.
    pub fn count(&self, name: &str) -> Option<u64> {
        self.data.iter().find_map(|row| match &row.spec {
            MetricSpec::Named(key) if key.name == name && key.scope.is_empty() => {
                Some(row.stats.call_count)
            }
            _ => None,
        })
    }
}

/// Everything the fake collector was sent, plus the failures to inject.
#[derive(Default)]
pub struct Script {
    pub metric_failures: Mutex<VecDeque<Outcome>>,
    pub error_failures: Mutex<VecDeque<Outcome>>,
    pub commands: Mutex<VecDeque<AgentCommandRequest>>,

    pub metric_reports: Mutex<Vec<MetricReport>>,
    pub errors: Mutex<Vec<ErrorTrace>>,
    pub sql_traces: Mutex<Vec<SlowSqlTrace>>,
    pub transaction_traces: Mutex<Vec<TransactionTrace>>,
    pub command_results: Mutex<Vec<CommandResults>>,
    pub profiles: Mutex<Vec<ProfilePayload>>,
    pub shutdowns: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Script {
    pub fn fail_metrics(&self, outcome: Outcome) {
        self.metric_failures.lock().unwrap().push_back(outcome);
    }

    pub fn fail_errors(&self, outcome: Outcome) {
        self.error_failures.lock().unwrap().push_back(outcome);
    }

    pub fn queue_command(&self, id: u64, name: &str, arguments: serde_json::Value) {
        self.commands.lock().unwrap().push_back(AgentCommandRequest {
            id,
            name: name.to_string(),
            arguments,
        });
    }

    pub fn reports(&self) -> Vec<MetricReport> {
        self.metric_reports.lock().unwrap().clone()
    }

    pub fn last_report(&self) -> MetricReport {
        self.metric_reports.lock().unwrap().last().cloned().expect("no metric report sent")
    }

    /// Sum of `name` call counts over every accepted report.
    pub fn total_count(&self, name: &str) -> u64 {
        self.reports().iter().filter_map(|report| report.count(name)).sum()
    }
}

pub struct FakeSession {
    configuration: Arc<Configuration>,
    script: Arc<Script>,
}

impl Session for FakeSession {
    fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    fn send_metric_data(
        &self,
        start: f64,
        end: f64,
        data: &[MetricData],
    ) -> Result<MetricIds, SessionError> {
        if let Some(outcome) = self.script.metric_failures.lock().unwrap().pop_front() {
            return Err(outcome.into_error());
        }
        self.script.metric_reports.lock().unwrap().push(MetricReport {
            start,
            end,
            data: data.to_vec(),
        });
        Ok(Vec::new())
    }

    fn send_errors(&self, errors: &[ErrorTrace]) -> Result<(), SessionError> {
        if let Some(outcome) = self.script.error_failures.lock().unwrap().pop_front() {
            return Err(outcome.into_error());
        }
        self.script.errors.lock().unwrap().extend_from_slice(errors);
        Ok(())
    }

    fn send_sql_traces(&self, traces: &[SlowSqlTrace]) -> Result<(), SessionError> {
        self.script.sql_traces.lock().unwrap().extend_from_slice(traces);
        Ok(())
    }

    fn send_transaction_traces(&self, traces: &[TransactionTrace]) -> Result<(), SessionError> {
        self.script.transaction_traces.lock().unwrap().extend_from_slice(traces);
        Ok(())
    }

    fn get_agent_commands(&self) -> Result<Vec<AgentCommandRequest>, SessionError> {
        Ok(self.script.commands.lock().unwrap().drain(..).collect())
    }

    fn send_agent_command_results(&self, results: &CommandResults) -> Result<(), SessionError> {
        self.script.command_results.lock().unwrap().push(results.clone());
        Ok(())
    }

    fn send_profile_data(&self, profiles: &[ProfilePayload]) -> Result<(), SessionError> {
        self.script.profiles.lock().unwrap().extend_from_slice(profiles);
        Ok(())
    }

    fn shutdown_session(&self) -> Result<(), SessionError> {
        self.script.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close_connection(&self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registers after `failures` soft failures, then every time after.
pub struct FakeConnector {
    pub script: Arc<Script>,
    pub configuration: Configuration,
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new(configuration: Configuration) -> Self {
        Self::failing(configuration, 0)
    }

    pub fn failing(configuration: Configuration, failures: usize) -> Self {
        Self {
            script: Arc::new(Script::default()),
            configuration,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl Connector for FakeConnector {
    fn create_session(
        &self,
        _app_name: &str,
        _linked_applications: &[String],
        _settings: &Settings,
    ) -> Option<Box<dyn Session>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return None;
        }

        let mut configuration = self.configuration.clone();
        configuration.agent_run_id = attempt as u64;
        Some(Box::new(FakeSession {
            configuration: Arc::new(configuration),
            script: Arc::clone(&self.script),
        }))
    }
}

/// Fixed stacks for profiler tests.
pub struct FixedStacks(pub Vec<CapturedStack>);

impl StackSource for FixedStacks {
    fn collect(&self) -> Vec<CapturedStack> {
        self.0.clone()
    }
}

/// A platform without stack capture.
pub struct UnsupportedStacks;

impl StackSource for UnsupportedStacks {
    fn is_supported(&self) -> bool {
        false
    }

    fn collect(&self) -> Vec<CapturedStack> {
        Vec::new()
    }
}

pub fn request_stack() -> Arc<dyn StackSource> {
    let frame = |function: &'static str, line: u32| Frame {
        file: "src/handlers.rs",
        function,
        first_line: line,
        line: line + 2,
        module: "shop::handlers",
    };
    Arc::new(FixedStacks(vec![CapturedStack {
        category: ThreadCategory::Request,
        frames: vec![frame("serve", 10), frame("checkout", 40)],
    }]))
}

pub fn settings() -> Settings {
    Settings {
        app_name: "test-app".to_string(),
        linked_applications: vec!["zeta".to_string(), "alpha".to_string(), "zeta".to_string()],
        ..Settings::default()
    }
}

/// Application connected through a fresh [`FakeConnector`].
pub fn connected_app(configuration: Configuration) -> (Arc<Application>, Arc<Script>) {
    connected_app_with_stacks(configuration, ThreadRegistry::new())
}

pub fn connected_app_with_stacks(
    configuration: Configuration,
    stacks: Arc<dyn StackSource>,
) -> (Arc<Application>, Arc<Script>) {
    let connector = FakeConnector::new(configuration);
    let script = Arc::clone(&connector.script);
    let app = Arc::new(Application::new(settings(), Arc::new(connector), stacks));
    app.activate_session();
    assert!(app.wait_for_session_activation(Duration::from_secs(5)), "session never activated");
    (app, script)
}

pub fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

/// A valid 10ms web transaction named `name`.
pub fn transaction(name: &str) -> TransactionData {
    let end_time = now();
    TransactionData {
        name: name.to_string(),
        start_time: end_time - 0.01,
        end_time,
        ..TransactionData::default()
    }
}

/// A web transaction that raised one `ValueError`.
pub fn failing_transaction(name: &str) -> TransactionData {
    TransactionData {
        errors: vec![ErrorRecord {
            kind: "ValueError".to_string(),
            message: "bad input".to_string(),
            stack_trace: vec!["handler".to_string()],
        }],
        ..transaction(name)
    }
}

/// Poll `condition` for up to five seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

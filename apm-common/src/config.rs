//! Agent configuration
//!
//! Two layers:
//! - [`Settings`] - local, loaded once at startup (file or defaults)
//! - [`Configuration`] - handed out by the collector on every registration,
//!   replaced wholesale on reconnect

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::SettingsError;

/// Local agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub linked_applications: Vec<String>,
    /// Seconds between harvests
    pub harvest_interval: u64,
    /// Seconds to block at startup waiting for registration (0 = don't wait)
    pub startup_timeout: f64,
    pub thread_profiler: ProfilerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "Rust Application".to_string(),
            linked_applications: Vec::new(),
            harvest_interval: 60,
            startup_timeout: 0.0,
            thread_profiler: ProfilerSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| SettingsError::Read { path: path.to_path_buf(), source })?;
        serde_json::from_str(&content)
            .map_err(|source| SettingsError::Parse { path: path.to_path_buf(), source })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerSettings {
    /// Drop the agent's own frames from non-agent thread samples.
    pub ignore_agent_frames: bool,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self { ignore_agent_frames: true }
    }
}

/// Collector-supplied configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub agent_run_id: u64,
    pub collect_errors: bool,
    pub collect_traces: bool,
    pub thread_profiler: ThreadProfilerConfig,
    pub transaction_tracer: TransactionTracerConfig,
    pub agent_limits: AgentLimits,
    pub url_rules: Vec<UrlRule>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            agent_run_id: 0,
            collect_errors: true,
            collect_traces: true,
            thread_profiler: ThreadProfilerConfig::default(),
            transaction_tracer: TransactionTracerConfig::default(),
            agent_limits: AgentLimits::default(),
            url_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadProfilerConfig {
    pub enabled: bool,
}

impl Default for ThreadProfilerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionTracerConfig {
    pub enabled: bool,
    /// Seconds; only slower transactions are kept as traces
    pub transaction_threshold: f64,
}

impl Default for TransactionTracerConfig {
    fn default() -> Self {
        Self { enabled: true, transaction_threshold: 2.0 }
    }
}

/// Bounds on how much data one harvest may carry or retain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    /// Consecutive failed harvests whose metrics are merged back before
    /// the data is dropped.
    pub merge_stats_maximum: u32,
    /// Profile nodes reported per profiling session.
    pub thread_profiler_nodes: usize,
    pub errors_per_harvest: usize,
    pub slow_sql_data: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            merge_stats_maximum: 5,
            thread_profiler_nodes: 20_000,
            errors_per_harvest: 20,
            slow_sql_data: 10,
        }
    }
}

/// A collector-issued rewrite rule for transaction names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlRule {
    pub match_expression: String,
    pub replacement: String,
    pub ignore: bool,
    pub eval_order: i32,
    pub terminate_chain: bool,
    pub each_segment: bool,
    pub replace_all: bool,
}

impl Default for UrlRule {
    fn default() -> Self {
        Self {
            match_expression: String::new(),
            replacement: String::new(),
            ignore: false,
            eval_order: 0,
            terminate_chain: true,
            each_segment: false,
            replace_all: false,
        }
    }
}

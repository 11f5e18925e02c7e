//! The session contract the harvest cycle drives.

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Configuration, Settings};
use crate::errors::SessionError;
use crate::metrics::{MetricData, MetricIds};
use crate::transaction::{ErrorTrace, SlowSqlTrace, TransactionTrace};

/// One registered connection to the collector.
///
/// Implementations own the transport. Every call either succeeds or fails
/// with one of the [`SessionError`] outcomes; the caller decides recovery.
pub trait Session: Send + Sync {
    /// Configuration the collector returned when this session registered.
    fn configuration(&self) -> &Arc<Configuration>;

    /// Report metrics for the period `[start, end]` (seconds since epoch).
    ///
    /// Returns the metric IDs to use in place of full names next time.
    fn send_metric_data(
        &self,
        start: f64,
        end: f64,
        data: &[MetricData],
    ) -> Result<MetricIds, SessionError>;

    fn send_errors(&self, errors: &[ErrorTrace]) -> Result<(), SessionError>;

    fn send_sql_traces(&self, traces: &[SlowSqlTrace]) -> Result<(), SessionError>;

    fn send_transaction_traces(&self, traces: &[TransactionTrace]) -> Result<(), SessionError>;

    fn get_agent_commands(&self) -> Result<Vec<AgentCommandRequest>, SessionError>;

    fn send_agent_command_results(&self, results: &CommandResults) -> Result<(), SessionError>;

    fn send_profile_data(&self, profiles: &[ProfilePayload]) -> Result<(), SessionError>;

    fn shutdown_session(&self) -> Result<(), SessionError>;

    /// Drop the underlying connection; the next call opens a fresh one.
    fn close_connection(&self);
}

/// Registers an application with the collector.
pub trait Connector: Send + Sync {
    /// Attempt one registration.
    ///
    /// Soft failures (collector unreachable, rejected handshake) are logged by
    /// the implementation and reported as `None`; the caller retries on its
    /// own schedule.
    fn create_session(
        &self,
        app_name: &str,
        linked_applications: &[String],
        settings: &Settings,
    ) -> Option<Box<dyn Session>>;
}

/// A command queued for the agent by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandRequest {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Per-command acknowledgement: `{}` on success, `{"error": msg}` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { error: Some(message.into()) }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Replies keyed by command ID.
pub type CommandResults = BTreeMap<u64, CommandReply>;

/// Summary record of one finished profiling session.
///
/// Serialized as `[profile_id, start_ms, stop_ms, sample_count, data,
/// thread_count, 0]` where `data` is base64 of zlib-compressed JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePayload {
    pub profile_id: i64,
    pub start_ms: f64,
    pub stop_ms: f64,
    pub sample_count: u64,
    pub encoded_data: String,
    pub thread_count: usize,
}

impl Serialize for ProfilePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(7)?;
        tuple.serialize_element(&self.profile_id)?;
        tuple.serialize_element(&self.start_ms)?;
        tuple.serialize_element(&self.stop_ms)?;
        tuple.serialize_element(&self.sample_count)?;
        tuple.serialize_element(&self.encoded_data)?;
        tuple.serialize_element(&self.thread_count)?;
        tuple.serialize_element(&0)?;
        tuple.end()
    }
}

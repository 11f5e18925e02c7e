//! Completed-transaction records and the trace payloads derived from them.

use serde::{Deserialize, Serialize};

use crate::metrics::ValueMetric;

/// Whether a transaction served a web request or ran as a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransactionGroup {
    #[default]
    Web,
    Other,
}

impl TransactionGroup {
    /// Metric name prefix for transactions in this group.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            TransactionGroup::Web => "WebTransaction",
            TransactionGroup::Other => "OtherTransaction",
        }
    }

    /// Rollup metric every transaction in this group contributes to.
    #[must_use]
    pub fn rollup(self) -> &'static str {
        match self {
            TransactionGroup::Web => "HttpDispatcher",
            TransactionGroup::Other => "OtherTransaction/all",
        }
    }
}

/// A timed unit of work inside a transaction (function call, query, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    /// Seconds
    pub duration: f64,
    /// Seconds not spent in child segments
    pub exclusive: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlNode {
    pub sql: String,
    /// Datastore metric the query was recorded under
    pub metric: String,
    /// Seconds
    pub duration: f64,
}

/// Everything recorded about one completed transaction.
///
/// Timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionData {
    pub name: String,
    pub group: TransactionGroup,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default)]
    pub request_uri: Option<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub slow_sql: Vec<SqlNode>,
    #[serde(default)]
    pub custom_metrics: Vec<ValueMetric>,
}

impl TransactionData {
    #[must_use]
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Full metric path, e.g. `WebTransaction/users/show`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.group.prefix(), self.name)
    }
}

/// An error captured during a transaction, as reported to the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorTrace {
    pub timestamp_ms: f64,
    pub path: String,
    pub message: String,
    pub kind: String,
    pub stack_trace: Vec<String>,
    pub request_uri: Option<String>,
}

/// Aggregated timings for one distinct SQL statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowSqlTrace {
    pub path: String,
    pub request_uri: Option<String>,
    pub sql: String,
    pub metric: String,
    pub call_count: u64,
    pub total_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
}

/// The slowest transaction of a harvest period with its segment breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionTrace {
    pub start_ms: f64,
    pub duration_ms: f64,
    pub path: String,
    pub request_uri: Option<String>,
    pub segments: Vec<Segment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_uses_group_prefix() {
        let data = TransactionData {
            name: "users/show".to_string(),
            group: TransactionGroup::Other,
            start_time: 10.0,
            end_time: 10.25,
            ..Default::default()
        };
        assert_eq!(data.path(), "OtherTransaction/users/show");
        assert!((data.duration() - 0.25).abs() < f64::EPSILON);
    }
}

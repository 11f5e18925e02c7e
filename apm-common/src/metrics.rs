//! Metric identities and accumulated statistics.

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};

/// Metric identity: a name plus an optional scope (empty string when unscoped).
///
/// Scoped metrics attribute a segment's time to the transaction it ran in,
/// e.g. name `Datastore/select` scoped to `WebTransaction/users/show`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub name: String,
    #[serde(default)]
    pub scope: String,
}

impl MetricKey {
    pub fn unscoped(name: impl Into<String>) -> Self {
        Self { name: name.into(), scope: String::new() }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self { name: name.into(), scope: scope.into() }
    }
}

/// Timing statistics for one metric over a harvest period.
///
/// Value metrics reuse the same shape with the value standing in for both
/// total and exclusive time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeStats {
    pub call_count: u64,
    pub total_call_time: f64,
    pub total_exclusive_call_time: f64,
    pub min_call_time: f64,
    pub max_call_time: f64,
    pub sum_of_squares: f64,
}

impl TimeStats {
    #[must_use]
    pub fn from_time(duration: f64, exclusive: f64) -> Self {
        Self {
            call_count: 1,
            total_call_time: duration,
            total_exclusive_call_time: exclusive,
            min_call_time: duration,
            max_call_time: duration,
            sum_of_squares: duration * duration,
        }
    }

    #[must_use]
    pub fn from_value(value: f64) -> Self {
        Self::from_time(value, value)
    }

    /// Fold another set of statistics into this one.
    pub fn merge(&mut self, other: &TimeStats) {
        if other.call_count == 0 {
            return;
        }

        if self.call_count == 0 {
            self.min_call_time = other.min_call_time;
            self.max_call_time = other.max_call_time;
        } else {
            self.min_call_time = self.min_call_time.min(other.min_call_time);
            self.max_call_time = self.max_call_time.max(other.max_call_time);
        }

        self.call_count += other.call_count;
        self.total_call_time += other.total_call_time;
        self.total_exclusive_call_time += other.total_exclusive_call_time;
        self.sum_of_squares += other.sum_of_squares;
    }
}

impl Serialize for TimeStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(6)?;
        tuple.serialize_element(&self.call_count)?;
        tuple.serialize_element(&self.total_call_time)?;
        tuple.serialize_element(&self.total_exclusive_call_time)?;
        tuple.serialize_element(&self.min_call_time)?;
        tuple.serialize_element(&self.max_call_time)?;
        tuple.serialize_element(&self.sum_of_squares)?;
        tuple.end()
    }
}

/// A single named value to fold into the metric table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetric {
    pub name: String,
    pub value: f64,
}

impl ValueMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self { name: name.into(), value }
    }
}

/// How a metric is identified on the wire: by full key, or by the numeric ID
/// the collector handed back after an earlier successful send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricSpec {
    Named(MetricKey),
    Id(u64),
}

/// One row of the metric payload: `[spec, [count, total, exclusive, min, max, sumsq]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricData {
    pub spec: MetricSpec,
    pub stats: TimeStats,
}

impl Serialize for MetricData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.spec, &self.stats).serialize(serializer)
    }
}

/// Metric ID assignments returned by a successful metric send.
pub type MetricIds = Vec<(MetricKey, u64)>;

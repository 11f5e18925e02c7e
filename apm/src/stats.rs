//! Metric aggregation for one harvest period.
//!
//! [`StatsEngine`] is the aggregator the application keeps behind its locks.
//! Transactions are folded into a private workarea first and the workarea is
//! merged into the shared engine afterwards, so the expensive extraction step
//! never runs under a lock.
//!
//! # Contents
//!
//! - Metric table: `(name, scope)` → [`TimeStats`]
//! - Error traces, capped by `agent_limits.errors_per_harvest`
//! - Slow SQL, one entry per distinct statement, capped by `agent_limits.slow_sql_data`
//! - The slowest transaction trace above the tracer threshold

use apm_common::{
    Configuration, ErrorTrace, MetricData, MetricIds, MetricKey, MetricSpec, SlowSqlTrace,
    TimeStats, TransactionData, TransactionTrace, ValueMetric,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::StatsError;

#[derive(Debug, Default)]
pub struct StatsEngine {
    settings: Option<Arc<Configuration>>,
    stats_table: HashMap<MetricKey, TimeStats>,
    metric_ids: HashMap<MetricKey, u64>,
    error_traces: Vec<ErrorTrace>,
    sql_stats: HashMap<String, SlowSqlTrace>,
    transaction_trace: Option<TransactionTrace>,
}

impl StatsEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration limits currently in force, `None` before the first
    /// registration.
    #[must_use]
    pub fn settings(&self) -> Option<&Arc<Configuration>> {
        self.settings.as_ref()
    }

    /// Drop everything accumulated, including metric IDs from a prior
    /// session, and adopt a fresh configuration.
    pub fn reset_stats(&mut self, settings: Arc<Configuration>) {
        *self = Self { settings: Some(settings), ..Self::default() };
    }

    /// Empty engine sharing this one's configuration.
    #[must_use]
    pub fn create_workarea(&self) -> Self {
        Self { settings: self.settings.clone(), ..Self::default() }
    }

    /// Take the current contents, leaving an empty engine in place.
    ///
    /// Metric IDs are kept on both sides so the snapshot can be reported
    /// compactly and later periods keep using them.
    pub fn harvest_snapshot(&mut self) -> Self {
        let mut fresh = self.create_workarea();
        fresh.metric_ids = self.metric_ids.clone();
        std::mem::replace(self, fresh)
    }

    #[must_use]
    pub fn metrics_count(&self) -> usize {
        self.stats_table.len()
    }

    #[must_use]
    pub fn get(&self, key: &MetricKey) -> Option<&TimeStats> {
        self.stats_table.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats_table.is_empty()
            && self.error_traces.is_empty()
            && self.sql_stats.is_empty()
            && self.transaction_trace.is_none()
    }

    pub fn record_time_metric(&mut self, key: MetricKey, duration: f64, exclusive: f64) {
        self.stats_table.entry(key).or_default().merge(&TimeStats::from_time(duration, exclusive));
    }

    pub fn record_value_metric(&mut self, metric: &ValueMetric) {
        self.stats_table
            .entry(MetricKey::unscoped(metric.name.as_str()))
            .or_default()
            .merge(&TimeStats::from_value(metric.value));
    }

    pub fn merge_value_metrics<I>(&mut self, metrics: I)
    where
        I: IntoIterator<Item = ValueMetric>,
    {
        for metric in metrics {
            self.record_value_metric(&metric);
        }
    }

    /// Fold one completed transaction into this engine.
    ///
    /// Validation happens before anything is recorded, so a rejected
    /// transaction leaves the engine untouched.
    ///
    /// # Errors
    /// Returns an error if the engine has no configuration or the
    /// transaction's timings are invalid
    pub fn record_transaction(&mut self, data: &TransactionData) -> Result<(), StatsError> {
        let settings = self.settings.clone().ok_or(StatsError::Unconfigured)?;
        validate(data)?;

        let path = data.path();
        let duration = data.duration();
        let children: f64 = data.segments.iter().map(|s| s.duration).sum();
        let exclusive = (duration - children).max(0.0);

        self.record_time_metric(MetricKey::unscoped(path.as_str()), duration, exclusive);
        self.record_time_metric(MetricKey::unscoped(data.group.prefix()), duration, exclusive);
        self.record_time_metric(MetricKey::unscoped(data.group.rollup()), duration, exclusive);

        for segment in &data.segments {
            self.record_time_metric(
                MetricKey::scoped(segment.name.as_str(), path.as_str()),
                segment.duration,
                segment.exclusive,
            );
            self.record_time_metric(
                MetricKey::unscoped(segment.name.as_str()),
                segment.duration,
                segment.exclusive,
            );
        }

        if !data.errors.is_empty() {
            let error_path = format!("Errors/{path}");
            for _ in &data.errors {
                self.record_value_metric(&ValueMetric::new("Errors/all", 1.0));
                self.record_value_metric(&ValueMetric::new(error_path.as_str(), 1.0));
            }
        }

        if settings.collect_errors {
            for error in &data.errors {
                if self.error_traces.len() >= settings.agent_limits.errors_per_harvest {
                    break;
                }
                self.error_traces.push(ErrorTrace {
                    timestamp_ms: data.end_time * 1000.0,
                    path: path.clone(),
                    message: error.message.clone(),
                    kind: error.kind.clone(),
                    stack_trace: error.stack_trace.clone(),
                    request_uri: data.request_uri.clone(),
                });
            }
        }

        if settings.collect_traces {
            for node in &data.slow_sql {
                let duration_ms = node.duration * 1000.0;
                self.merge_sql(
                    SlowSqlTrace {
                        path: path.clone(),
                        request_uri: data.request_uri.clone(),
                        sql: node.sql.clone(),
                        metric: node.metric.clone(),
                        call_count: 1,
                        total_time_ms: duration_ms,
                        min_time_ms: duration_ms,
                        max_time_ms: duration_ms,
                    },
                    settings.agent_limits.slow_sql_data,
                );
            }

            let tracer = &settings.transaction_tracer;
            if tracer.enabled && duration >= tracer.transaction_threshold {
                self.offer_transaction_trace(TransactionTrace {
                    start_ms: data.start_time * 1000.0,
                    duration_ms: duration * 1000.0,
                    path,
                    request_uri: data.request_uri.clone(),
                    segments: data.segments.clone(),
                });
            }
        }

        for metric in &data.custom_metrics {
            self.record_value_metric(metric);
        }

        Ok(())
    }

    /// Merge only the metric table of `other`.
    pub fn merge_metric_stats(&mut self, other: &StatsEngine) {
        for (key, stats) in &other.stats_table {
            self.stats_table.entry(key.clone()).or_default().merge(stats);
        }
    }

    /// Merge errors, slow SQL and transaction traces of `other`.
    pub fn merge_other_stats(&mut self, other: StatsEngine) {
        let (error_limit, sql_limit) = self
            .settings
            .as_ref()
            .map_or((usize::MAX, usize::MAX), |s| {
                (s.agent_limits.errors_per_harvest, s.agent_limits.slow_sql_data)
            });

        let room = error_limit.saturating_sub(self.error_traces.len());
        self.error_traces.extend(other.error_traces.into_iter().take(room));

        for (_, trace) in other.sql_stats {
            self.merge_sql(trace, sql_limit);
        }

        if let Some(trace) = other.transaction_trace {
            self.offer_transaction_trace(trace);
        }
    }

    /// Metric rows to report, using collector-issued IDs where known.
    #[must_use]
    pub fn metric_data(&self) -> Vec<MetricData> {
        let mut keys: Vec<&MetricKey> = self.stats_table.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| MetricData {
                spec: match self.metric_ids.get(key) {
                    Some(&id) => MetricSpec::Id(id),
                    None => MetricSpec::Named(key.clone()),
                },
                stats: self.stats_table[key],
            })
            .collect()
    }

    #[must_use]
    pub fn error_data(&self) -> Vec<ErrorTrace> {
        self.error_traces.clone()
    }

    /// Slow SQL entries, slowest first.
    #[must_use]
    pub fn slow_sql_data(&self) -> Vec<SlowSqlTrace> {
        let mut traces: Vec<SlowSqlTrace> = self.sql_stats.values().cloned().collect();
        traces.sort_by(|a, b| b.max_time_ms.total_cmp(&a.max_time_ms));
        traces
    }

    #[must_use]
    pub fn transaction_trace_data(&self) -> Vec<TransactionTrace> {
        self.transaction_trace.iter().cloned().collect()
    }

    pub fn update_metric_ids(&mut self, ids: MetricIds) {
        self.metric_ids.extend(ids);
    }

    fn merge_sql(&mut self, trace: SlowSqlTrace, limit: usize) {
        if let Some(existing) = self.sql_stats.get_mut(&trace.sql) {
            existing.call_count += trace.call_count;
            existing.total_time_ms += trace.total_time_ms;
            existing.min_time_ms = existing.min_time_ms.min(trace.min_time_ms);
            if trace.max_time_ms > existing.max_time_ms {
                existing.max_time_ms = trace.max_time_ms;
                existing.path = trace.path;
                existing.request_uri = trace.request_uri;
            }
            return;
        }

        if self.sql_stats.len() >= limit {
            // Full: evict the fastest statement if the newcomer is slower
            let fastest = self
                .sql_stats
                .iter()
                .min_by(|a, b| a.1.max_time_ms.total_cmp(&b.1.max_time_ms))
                .map(|(sql, t)| (sql.clone(), t.max_time_ms));
            match fastest {
                Some((sql, max)) if max < trace.max_time_ms => {
                    self.sql_stats.remove(&sql);
                }
                _ => return,
            }
        }

        self.sql_stats.insert(trace.sql.clone(), trace);
    }

    fn offer_transaction_trace(&mut self, trace: TransactionTrace) {
        match &self.transaction_trace {
            Some(current) if current.duration_ms >= trace.duration_ms => {}
            _ => self.transaction_trace = Some(trace),
        }
    }
}

fn validate(data: &TransactionData) -> Result<(), StatsError> {
    let finite = data.start_time.is_finite()
        && data.end_time.is_finite()
        && data.segments.iter().all(|s| s.duration.is_finite() && s.exclusive.is_finite())
        && data.custom_metrics.iter().all(|m| m.value.is_finite());
    if !finite {
        return Err(StatsError::NonFiniteTiming { name: data.name.clone() });
    }
    if data.end_time < data.start_time {
        return Err(StatsError::NegativeDuration {
            name: data.name.clone(),
            start: data.start_time,
            end: data.end_time,
        });
    }
    Ok(())
}

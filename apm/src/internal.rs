//! Supportability metrics about the agent's own work.
//!
//! Harvest and transaction recording report their own cost here. The buffer
//! is filled outside the aggregator locks and merged into the live
//! [`StatsEngine`](crate::stats::StatsEngine) afterwards, so those numbers
//! show up in the following harvest.

use apm_common::ValueMetric;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct InternalMetrics {
    metrics: Vec<ValueMetric>,
}

impl InternalMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.push(ValueMetric::new(name, value));
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_count(&mut self, name: impl Into<String>, count: usize) {
        self.record(name, count as f64);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Drain everything recorded so far.
    pub fn take(&mut self) -> Vec<ValueMetric> {
        std::mem::take(&mut self.metrics)
    }
}

/// Records the wall time of a scope into [`InternalMetrics`] when dropped.
///
/// The guard borrows the buffer mutably, so further recording inside the
/// scope goes through [`InternalTrace::metrics`].
pub struct InternalTrace<'a> {
    name: &'static str,
    start: Instant,
    metrics: &'a mut InternalMetrics,
}

impl<'a> InternalTrace<'a> {
    pub fn new(name: &'static str, metrics: &'a mut InternalMetrics) -> Self {
        Self { name, start: Instant::now(), metrics }
    }

    pub fn metrics(&mut self) -> &mut InternalMetrics {
        self.metrics
    }
}

impl Drop for InternalTrace<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.metrics.record(self.name, elapsed);
    }
}

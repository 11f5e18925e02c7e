//! Registration backoff

use log::Level;
use std::time::Duration;

/// Delay before attempt `n + 1`, and the level to log the failure at.
const SCHEDULE: [(u64, Option<Level>); 6] = [
    (15, None),
    (15, None),
    (30, None),
    (60, Some(Level::Warn)),
    (120, None),
    (300, Some(Level::Error)),
];

/// Delay used once the schedule is exhausted
const FINAL_DELAY_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    pub delay: Duration,
    /// Escalated log level for this failure; `None` logs at debug only
    pub level: Option<Level>,
}

/// Endless sequence of backoff steps, one per failed registration.
#[derive(Debug, Clone, Default)]
pub struct RetrySchedule {
    failures: usize,
}

impl RetrySchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed attempts seen so far.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn next_step(&mut self) -> RetryStep {
        let (secs, level) = SCHEDULE.get(self.failures).copied().unwrap_or((FINAL_DELAY_SECS, None));
        self.failures += 1;
        RetryStep { delay: Duration::from_secs(secs), level }
    }
}

impl Iterator for RetrySchedule {
    type Item = RetryStep;

    fn next(&mut self) -> Option<RetryStep> {
        Some(self.next_step())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_follow_schedule_then_plateau() {
        let delays: Vec<u64> = RetrySchedule::new().take(9).map(|s| s.delay.as_secs()).collect();
        assert_eq!(delays, [15, 15, 30, 60, 120, 300, 300, 300, 300]);
    }

    #[test]
    fn test_escalation_only_on_fourth_and_sixth_failure() {
        let levels: Vec<Option<Level>> = RetrySchedule::new().take(8).map(|s| s.level).collect();
        assert_eq!(
            levels,
            [None, None, None, Some(Level::Warn), None, Some(Level::Error), None, None]
        );
    }

    #[test]
    fn test_counts_failures() {
        let mut schedule = RetrySchedule::new();
        schedule.next_step();
        schedule.next_step();
        assert_eq!(schedule.failures(), 2);
    }
}

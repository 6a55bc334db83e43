//! Retry budgets and backoff schedules.

use chrono::Duration;

/// How long to wait before the next attempt, given how many attempts have
/// already been made.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackoffPolicy {
    /// 10 minutes for attempts 1-3, 30 minutes for 4-6, 60 minutes beyond.
    #[default]
    Staircase,
    /// Explicit per-kind table. Attempt `n` waits `intervals[n - 1]`, clamped
    /// to the last entry.
    Intervals(Vec<Duration>),
    /// No wait; the caller gates timing itself (saga steps).
    Immediate,
}

impl BackoffPolicy {
    /// Builds an interval table from whole seconds.
    pub fn from_secs(intervals: &[i64]) -> Self {
        BackoffPolicy::Intervals(intervals.iter().map(|s| Duration::seconds(*s)).collect())
    }

    /// Seconds-scale staircase used for outbox delivery:
    /// 10s ×3, 30s ×3, 60s ×4, 5m ×10, then 10m.
    pub fn outbox() -> Self {
        let mut intervals = Vec::with_capacity(21);
        intervals.extend(std::iter::repeat_n(Duration::seconds(10), 3));
        intervals.extend(std::iter::repeat_n(Duration::seconds(30), 3));
        intervals.extend(std::iter::repeat_n(Duration::seconds(60), 4));
        intervals.extend(std::iter::repeat_n(Duration::minutes(5), 10));
        intervals.push(Duration::minutes(10));
        BackoffPolicy::Intervals(intervals)
    }

    /// Delay after the `tried_times`-th attempt has started.
    pub fn delay_for(&self, tried_times: u32) -> Duration {
        match self {
            BackoffPolicy::Staircase => match tried_times {
                0..=3 => Duration::minutes(10),
                4..=6 => Duration::minutes(30),
                _ => Duration::minutes(60),
            },
            BackoffPolicy::Intervals(intervals) => {
                let Some(last) = intervals.len().checked_sub(1) else {
                    return BackoffPolicy::Staircase.delay_for(tried_times);
                };
                let index = (tried_times.saturating_sub(1) as usize).min(last);
                intervals[index]
            }
            BackoffPolicy::Immediate => Duration::zero(),
        }
    }
}

/// Attempt budget, deadline and backoff for one record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub try_times: u32,
    /// Deadline, relative to the scheduled start.
    pub expire_after: Duration,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(try_times: u32, expire_after: Duration) -> Self {
        Self {
            try_times,
            expire_after,
            backoff: BackoffPolicy::Staircase,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Saga default: 3 attempts within one day.
    pub fn saga_default() -> Self {
        Self::new(3, Duration::days(1))
    }

    /// Outbox default: 30 attempts within one day on the seconds staircase.
    pub fn event_default() -> Self {
        Self::new(30, Duration::days(1)).with_backoff(BackoffPolicy::outbox())
    }
}

//! Sweep settings.

use std::time::Duration;

/// Tuning of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSettings {
    /// Records fetched per page.
    pub batch_size: usize,
    /// Instances expected to contend for the lease; spreads the contention delay.
    pub max_concurrency: usize,
    /// Time between two ticks.
    pub interval: Duration,
    /// Lease TTL. A crashed holder blocks the sweep for at most this long.
    pub max_lock_duration: Duration,
}

impl SweepSettings {
    pub fn new(batch_size: usize, interval: Duration, max_lock_duration: Duration) -> Self {
        Self {
            batch_size,
            max_concurrency: 10,
            interval,
            max_lock_duration,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        to_chrono(self.max_lock_duration)
    }

    /// Look-ahead of the due-record query: records due within half an
    /// interval are claimed now and dispatched with a delay.
    pub fn half_interval(&self) -> chrono::Duration {
        to_chrono(self.interval / 2)
    }

    /// Step added to the start delay after each lost lease.
    pub fn contention_step(&self) -> Duration {
        self.interval / self.max_concurrency.max(1) as u32
    }
}

/// Archival of terminal records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSettings {
    pub batch_size: usize,
    /// Time a terminal record stays live after its deadline.
    pub grace: chrono::Duration,
    pub interval: Duration,
    pub max_lock_duration: Duration,
}

impl ArchiveSettings {
    pub(crate) fn as_sweep(&self) -> SweepSettings {
        SweepSettings::new(self.batch_size, self.interval, self.max_lock_duration)
            .with_max_concurrency(1)
    }
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            grace: chrono::Duration::days(7),
            interval: Duration::from_secs(3600),
            max_lock_duration: Duration::from_secs(300),
        }
    }
}

/// Settings of every periodic job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub task: SweepSettings,
    pub event: SweepSettings,
    pub saga: SweepSettings,
    pub archive: ArchiveSettings,
    pub partition_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task: SweepSettings::new(10, Duration::from_secs(60), Duration::from_secs(300)),
            event: SweepSettings::new(10, Duration::from_secs(60), Duration::from_secs(30)),
            saga: SweepSettings::new(10, Duration::from_secs(60), Duration::from_secs(300)),
            archive: ArchiveSettings::default(),
            partition_interval: Duration::from_secs(86_400),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

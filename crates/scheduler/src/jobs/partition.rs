use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SharedClock;
use record_store::{ARCHIVE_TABLES, LeaseLockStore, PartitionManager, next_month};

use crate::{PeriodicJob, Result, SweepOutcome, SweepRunner, SweepSettings};

pub const PARTITION_ROTATION: &str = "partition_rotation";

/// Creates next month's partition of every archive table ahead of time.
/// Existing partitions are left untouched, so a tick can run any number of
/// times.
pub struct PartitionRotation {
    runner: SweepRunner,
    partitions: Arc<dyn PartitionManager>,
}

impl PartitionRotation {
    pub fn new(
        service_name: impl Into<String>,
        interval: Duration,
        partitions: Arc<dyn PartitionManager>,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        let settings = SweepSettings::new(ARCHIVE_TABLES.len(), interval, Duration::from_secs(300))
            .with_max_concurrency(1);
        Self {
            runner: SweepRunner::new(PARTITION_ROTATION, service_name, settings, locks, clock),
            partitions,
        }
    }

    async fn rotate(&self, now: DateTime<Utc>) -> Result<usize> {
        let month = next_month(now.date_naive());
        let mut created = 0;
        for table in ARCHIVE_TABLES {
            if self.partitions.ensure_monthly_partition(table, month).await? {
                created += 1;
            }
        }
        Ok(created)
    }
}

#[async_trait]
impl PeriodicJob for PartitionRotation {
    fn name(&self) -> &'static str {
        self.runner.sweep()
    }

    fn interval(&self) -> Duration {
        self.runner.settings().interval
    }

    fn start_delay(&self) -> Duration {
        self.runner.start_delay()
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        self.runner.run(|now| self.rotate(now)).await
    }
}

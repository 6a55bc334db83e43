//! Monthly range partitions for archive tables.

use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate};

use crate::Result;

/// Archive tables partitioned by `archived_at` month.
pub const ARCHIVE_TABLES: [&str; 4] = [
    "archived_task_record",
    "archived_event_record",
    "archived_saga",
    "archived_saga_step",
];

/// Creates archive partitions ahead of time.
#[async_trait]
pub trait PartitionManager: Send + Sync {
    /// Ensures `table` has a partition covering the month starting at `month`.
    /// Returns true if a partition was created, false if it already existed.
    async fn ensure_monthly_partition(&self, table: &str, month: NaiveDate) -> Result<bool>;
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

/// First day of the month after the one containing `date`.
pub fn next_month(date: NaiveDate) -> NaiveDate {
    month_start(month_start(date) + Days::new(32))
}

/// Partition table name, e.g. `archived_task_record_p202611`.
pub fn partition_name(table: &str, month: NaiveDate) -> String {
    format!("{table}_p{:04}{:02}", month.year(), month.month())
}

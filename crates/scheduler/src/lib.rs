//! Periodic sweeps over durable records.
//!
//! Every sweep runs under a cluster-wide lease lock named
//! `{sweep}[{service}]` and only discovers work: due records are claimed
//! (their next attempt started and saved) and then handed to a worker pool.
//! The [`Scheduler`] drives each [`PeriodicJob`] on its own timer.

pub mod config;
pub mod error;
pub mod job;
pub mod jobs;
pub mod scheduler;
pub mod sweep;

pub use config::{ArchiveSettings, SchedulerConfig, SweepSettings};
pub use error::{Result, SchedulerError};
pub use job::PeriodicJob;
pub use jobs::{
    ARCHIVE_SWEEP, ArchiveSweep, EVENT_SWEEP, EventSweep, PARTITION_ROTATION, PartitionRotation,
    RecordDispatcher, RecordSweep, SAGA_COMPENSATION_SWEEP, SAGA_ROLLBACK_SWEEP, SagaSweep,
    TASK_SWEEP, TaskSweep,
};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use sweep::{SweepOutcome, SweepRunner};

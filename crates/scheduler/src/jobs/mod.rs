//! The periodic jobs.

mod archive;
mod partition;
mod records;
mod sagas;

pub use archive::{ARCHIVE_SWEEP, ArchiveSweep};
pub use partition::{PARTITION_ROTATION, PartitionRotation};
pub use records::{EVENT_SWEEP, EventSweep, RecordDispatcher, RecordSweep, TASK_SWEEP, TaskSweep};
pub use sagas::{SAGA_COMPENSATION_SWEEP, SAGA_ROLLBACK_SWEEP, SagaSweep};

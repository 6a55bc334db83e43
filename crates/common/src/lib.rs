//! Shared building blocks for the reliability substrate.
//!
//! Everything here is storage- and handler-agnostic: record identifiers,
//! an injectable clock, and the bounded worker pool that decouples record
//! discovery from record execution.

pub mod clock;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use types::{HandlerError, RecordId, non_blank};
pub use worker::WorkerPool;

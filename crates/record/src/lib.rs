//! Durable retry records.
//!
//! A [`DurableRecord`] is a persisted unit of work with an attempt budget, a
//! backoff schedule, an absolute deadline and a lifecycle state. The same
//! [`Lifecycle`] machine drives task records, outbox event records, sagas and
//! each saga step; only the in-flight and success vocabulary differs per
//! [`RecordFamily`].

pub mod backoff;
pub mod error;
pub mod lifecycle;
pub mod payload;
pub mod record;
pub mod saga;
pub mod state;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use common::RecordId;
pub use error::{RecordError, Result};
pub use lifecycle::Lifecycle;
pub use payload::{Payload, PayloadType};
pub use record::{DurableRecord, Version};
pub use saga::{SagaRecord, SagaStep};
pub use state::{RecordFamily, RecordState};

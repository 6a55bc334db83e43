//! Durable asynchronous tasks.
//!
//! A task is a [`TaskHandler`] invocation persisted as a durable record before
//! it runs. The [`TaskSupervisor`] creates records (deduplicating on the
//! idempotency key) and the [`TaskRunner`] executes them on a worker pool.
//! Records that crash or fail mid-flight are picked up again by the task sweep.

pub mod error;
pub mod handler;
pub mod registry;
pub mod runner;
pub mod supervisor;

pub use error::{Result, TaskError};
pub use handler::TaskHandler;
pub use registry::TaskRegistry;
pub use runner::TaskRunner;
pub use supervisor::{SubmitOptions, TaskSupervisor};

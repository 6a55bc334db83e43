//! HTTP route handlers.

pub mod ops;
pub mod sagas;
pub mod sweeps;
pub mod tasks;

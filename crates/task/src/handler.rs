//! The task handler contract.

use async_trait::async_trait;
use common::HandlerError;
use record::{PayloadType, RetryPolicy};

/// Business logic run by a durable task.
///
/// Handlers must be idempotent: a task is delivered at least once, and a crash
/// between `process` returning and the record being saved replays it.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Param: PayloadType;
    type Output: PayloadType;

    /// Stable identifier stored on the record and used to find the handler
    /// again when the record is re-dispatched.
    const KIND: &'static str;

    async fn process(&self, param: &Self::Param) -> Result<Self::Output, HandlerError>;

    /// Called after a successful attempt, before the record is saved.
    async fn on_success(&self, _param: &Self::Param, _output: &Self::Output) {}

    /// Called after every failed attempt.
    async fn on_fail(&self, _param: &Self::Param, _error: &HandlerError) {}

    /// Overrides the retry budget and deadline requested by the caller.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

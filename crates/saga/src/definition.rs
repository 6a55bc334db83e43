use record::{PayloadType, RetryPolicy};

use crate::Process;

/// A saga type: its context, its process graph and its retry budget.
///
/// The context is stored as the saga's payload and handed from step to step.
/// Its `TYPE_TAG` is how [`SagaSupervisor`](crate::SagaSupervisor) picks the
/// saga to run for a context value.
pub trait SagaDefinition: Send + Sync + 'static {
    type Context: PayloadType + Clone;

    /// Stable saga type name, persisted as the saga's kind.
    const SAGA_TYPE: &'static str;

    /// Builds the process graph. Called once, when the state machine is created.
    fn process(&self) -> Process<Self::Context>;

    /// Attempt budget, deadline and resume backoff. Defaults to 3 attempts
    /// within one day.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::saga_default()
    }
}

//! Persisted saga orchestration.
//!
//! A saga type is a [`SagaDefinition`]: a context type plus a [`Process`]
//! graph of coded steps with forward and compensating handlers. A
//! [`SagaStateMachine`] runs that graph against a persisted saga, saving
//! progress per step, and compensates completed steps in reverse order once
//! the saga runs out of attempts. The [`SagaSupervisor`] routes new contexts
//! and persisted sagas to the right state machine.

pub mod definition;
pub mod error;
pub mod process;
pub mod state_machine;
pub mod supervisor;

pub use definition::SagaDefinition;
pub use error::{Result, SagaError};
pub use process::{CompensateFn, Compensation, ForwardFn, Process, StepDeclaration};
pub use state_machine::{
    LOCAL_TRIES, MISSING_ROLLBACK, SagaRunner, SagaStateMachine, SagaSubmission,
};
pub use supervisor::{SagaSupervisor, SagaSupervisorBuilder};

//! Record families and lifecycle states.

use serde::{Deserialize, Serialize};

use crate::{RecordError, Result};

/// Which kind of durable record a lifecycle belongs to.
///
/// Tasks and events use the `CONFIRMING`/`DELIVERED` vocabulary; sagas and
/// saga steps use `RUNNING`/`DONE` and additionally support the rollback states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordFamily {
    Task,
    Event,
    Saga,
    SagaStep,
}

impl RecordFamily {
    /// The state a record is in while an attempt is in flight.
    pub fn in_flight_state(&self) -> RecordState {
        match self {
            RecordFamily::Task | RecordFamily::Event => RecordState::Confirming,
            RecordFamily::Saga | RecordFamily::SagaStep => RecordState::Running,
        }
    }

    /// The terminal success state.
    pub fn success_state(&self) -> RecordState {
        match self {
            RecordFamily::Task | RecordFamily::Event => RecordState::Delivered,
            RecordFamily::Saga | RecordFamily::SagaStep => RecordState::Done,
        }
    }

    /// Returns true if records of this family may be compensated.
    pub fn supports_rollback(&self) -> bool {
        matches!(self, RecordFamily::Saga | RecordFamily::SagaStep)
    }

    /// States a sweep considers eligible for another attempt.
    pub fn retryable_states(&self) -> Vec<RecordState> {
        vec![RecordState::Init, self.in_flight_state()]
    }

    /// Terminal states eligible for archival.
    pub fn archivable_states(&self) -> Vec<RecordState> {
        let mut states = vec![
            RecordState::Cancel,
            RecordState::Expired,
            RecordState::Failed,
            self.success_state(),
        ];
        if self.supports_rollback() {
            states.push(RecordState::Rollbacked);
        }
        states
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordFamily::Task => "task",
            RecordFamily::Event => "event",
            RecordFamily::Saga => "saga",
            RecordFamily::SagaStep => "saga_step",
        }
    }
}

impl std::fmt::Display for RecordFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a durable record.
///
/// State transitions:
/// ```text
/// INIT ──► CONFIRMING|RUNNING ──┬──► DELIVERED|DONE
///   │            │  ▲           ├──► FAILED   (attempts exhausted)
///   │            └──┘ retry     └──► EXPIRED  (deadline passed)
///   └──────────────────────────────► CANCEL
///
/// sagas and steps only:
/// FAILED|DONE ──► ROLLBACKING ──┬──► ROLLBACKED
///                               └──► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Created, no attempt started yet.
    #[default]
    Init,
    /// Task or event attempt in flight.
    Confirming,
    /// Saga or saga step attempt in flight.
    Running,
    Cancel,
    Expired,
    Failed,
    /// Task or event finished successfully.
    Delivered,
    /// Saga or saga step finished successfully.
    Done,
    Rollbacking,
    Rollbacked,
}

impl RecordState {
    /// Returns true if no further forward attempts will be made.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Cancel
                | RecordState::Expired
                | RecordState::Failed
                | RecordState::Delivered
                | RecordState::Done
                | RecordState::Rollbacked
        )
    }

    /// Returns true if a sweep may start another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecordState::Init | RecordState::Confirming | RecordState::Running
        )
    }

    /// Storage code. In-flight and success states share a code across families.
    pub fn code(&self) -> i16 {
        match self {
            RecordState::Init => 0,
            RecordState::Confirming | RecordState::Running => -1,
            RecordState::Cancel => -2,
            RecordState::Expired => -3,
            RecordState::Failed => -4,
            RecordState::Rollbacking => -5,
            RecordState::Rollbacked => -6,
            RecordState::Delivered | RecordState::Done => 1,
        }
    }

    /// Decodes a storage code for the given family.
    pub fn from_code(family: RecordFamily, code: i16) -> Result<Self> {
        let state = match code {
            0 => RecordState::Init,
            -1 => family.in_flight_state(),
            -2 => RecordState::Cancel,
            -3 => RecordState::Expired,
            -4 => RecordState::Failed,
            -5 if family.supports_rollback() => RecordState::Rollbacking,
            -6 if family.supports_rollback() => RecordState::Rollbacked,
            1 => family.success_state(),
            other => return Err(RecordError::UnknownStateCode(other)),
        };
        Ok(state)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Init => "INIT",
            RecordState::Confirming => "CONFIRMING",
            RecordState::Running => "RUNNING",
            RecordState::Cancel => "CANCEL",
            RecordState::Expired => "EXPIRED",
            RecordState::Failed => "FAILED",
            RecordState::Delivered => "DELIVERED",
            RecordState::Done => "DONE",
            RecordState::Rollbacking => "ROLLBACKING",
            RecordState::Rollbacked => "ROLLBACKED",
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

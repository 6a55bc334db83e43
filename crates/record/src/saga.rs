//! Saga aggregate and per-step progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BackoffPolicy, DurableRecord, Lifecycle, Payload, RecordFamily, RecordId, RecordState, Result,
    RetryPolicy,
};

/// Persisted progress of one process-graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    /// Node code; together with the saga id it identifies the step.
    pub code: i32,
    pub name: String,
    /// Context handed to the forward handler.
    pub input: Option<Payload>,
    /// Context returned by the forward handler.
    pub output: Option<Payload>,
    pub lifecycle: Lifecycle,
}

impl SagaStep {
    /// A new untouched step sharing the saga's budget and deadline.
    pub fn new(
        code: i32,
        name: impl Into<String>,
        now: DateTime<Utc>,
        try_times: u32,
        expire_at: DateTime<Utc>,
    ) -> Self {
        let mut lifecycle = Lifecycle::new(
            RecordFamily::SagaStep,
            now,
            &RetryPolicy::new(try_times, chrono::Duration::zero()),
        );
        lifecycle.expire_at = expire_at;
        Self {
            code,
            name: name.into(),
            input: None,
            output: None,
            lifecycle,
        }
    }

    pub fn state(&self) -> RecordState {
        self.lifecycle.state
    }

    /// Starts a forward attempt with `input` as the handler context.
    ///
    /// Step timing is gated by the saga, so steps never wait on their own
    /// `next_try_time`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>, input: Payload) -> Result<bool> {
        let started = self
            .lifecycle
            .begin_attempt(now, &BackoffPolicy::Immediate)?;
        if started {
            self.input = Some(input);
        }
        Ok(started)
    }

    pub fn complete(&mut self, output: Payload) -> bool {
        if !self.lifecycle.complete() {
            return false;
        }
        self.output = Some(output);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> RecordState {
        self.lifecycle.fail(error)
    }

    /// Returns true if the step ran (fully or partially) and is not yet compensated.
    pub fn needs_compensation(&self) -> bool {
        !matches!(self.state(), RecordState::Init | RecordState::Rollbacked)
    }

    pub fn begin_rollback(&mut self, now: DateTime<Utc>) -> bool {
        if !self.needs_compensation() {
            return false;
        }
        self.lifecycle.state = RecordState::Rollbacking;
        self.lifecycle.last_try_time = Some(now);
        true
    }

    pub fn finish_rollback(&mut self) -> bool {
        if self.state() != RecordState::Rollbacking {
            return false;
        }
        self.lifecycle.state = RecordState::Rollbacked;
        self.lifecycle.last_error = None;
        true
    }

    /// Records a compensation failure; the step stays `ROLLBACKING`.
    pub fn rollback_failed(&mut self, error: impl Into<String>) {
        self.lifecycle.last_error = Some(error.into());
    }

    /// Marks a defect that must be surfaced rather than retried.
    pub fn mark_defect(&mut self, error: impl Into<String>) {
        self.lifecycle.state = RecordState::Failed;
        self.lifecycle.last_error = Some(error.into());
    }
}

/// A saga: one aggregate-level record plus its step records.
///
/// `record.kind` is the saga type, `record.payload` the initial context and
/// `record.result` the most recent context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub record: DurableRecord,
    /// Ordered by code.
    pub steps: Vec<SagaStep>,
}

impl SagaRecord {
    /// Creates an `INIT` saga with no steps.
    pub fn new(
        saga_type: impl Into<String>,
        service_name: impl Into<String>,
        context: Payload,
        uuid: impl Into<String>,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Self {
        let mut record = DurableRecord::new(
            RecordFamily::Saga,
            saga_type,
            service_name,
            context,
            now,
            policy,
        );
        record.uuid = Some(uuid.into());
        Self {
            record,
            steps: Vec::new(),
        }
    }

    pub fn id(&self) -> RecordId {
        self.record.id
    }

    pub fn uuid(&self) -> &str {
        self.record.uuid.as_deref().unwrap_or_default()
    }

    pub fn saga_type(&self) -> &str {
        &self.record.kind
    }

    pub fn state(&self) -> RecordState {
        self.record.state()
    }

    /// The latest persisted context.
    pub fn context(&self) -> &Payload {
        self.record.result.as_ref().unwrap_or(&self.record.payload)
    }

    pub fn step(&self, code: i32) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.code == code)
    }

    pub fn step_mut(&mut self, code: i32) -> Option<&mut SagaStep> {
        self.steps.iter_mut().find(|s| s.code == code)
    }

    /// Returns the step for `code`, creating an untouched one if missing.
    pub fn ensure_step(&mut self, code: i32, name: &str, now: DateTime<Utc>) -> &mut SagaStep {
        let index = match self.steps.iter().position(|s| s.code == code) {
            Some(index) => index,
            None => {
                let step = SagaStep::new(
                    code,
                    name,
                    now,
                    self.record.lifecycle.try_times,
                    self.record.lifecycle.expire_at,
                );
                let index = self.steps.partition_point(|s| s.code < code);
                self.steps.insert(index, step);
                index
            }
        };
        &mut self.steps[index]
    }

    pub fn all_steps_done(&self) -> bool {
        self.steps.iter().all(|s| s.state() == RecordState::Done)
    }

    /// Returns true if every touched step has been compensated.
    pub fn rollback_complete(&self) -> bool {
        self.steps.iter().all(|s| !s.needs_compensation())
    }

    pub fn begin_attempt(&mut self, now: DateTime<Utc>, backoff: &BackoffPolicy) -> Result<bool> {
        self.record.begin_attempt(now, backoff)
    }

    /// Stores the final context and moves to `DONE`.
    pub fn finish_running(&mut self, context: Payload) -> bool {
        self.record.complete(Some(context))
    }

    /// Records a failed pass. The saga stays `RUNNING` while attempts remain.
    pub fn fail(&mut self, context: Payload, error: impl Into<String>) -> RecordState {
        if self.record.lifecycle.is_in_flight() {
            self.record.result = Some(context);
        }
        self.record.fail(error)
    }

    /// Moves a `FAILED` saga to `ROLLBACKING`, due at `next_try_time`.
    ///
    /// Returns true if the saga is (now or already) rolling back. An expired
    /// saga becomes `EXPIRED` instead.
    pub fn begin_rollback(&mut self, now: DateTime<Utc>, next_try_time: DateTime<Utc>) -> bool {
        let lifecycle = &mut self.record.lifecycle;
        if lifecycle.state == RecordState::Rollbacking {
            return true;
        }
        if lifecycle.state != RecordState::Failed {
            return false;
        }
        if lifecycle.is_expired(now) {
            lifecycle.state = RecordState::Expired;
            return false;
        }
        lifecycle.state = RecordState::Rollbacking;
        lifecycle.next_try_time = next_try_time;
        true
    }

    /// Pushes the next rollback pass out to `next_try_time`.
    pub fn reschedule(&mut self, now: DateTime<Utc>, next_try_time: DateTime<Utc>) {
        self.record.lifecycle.last_try_time = Some(now);
        self.record.lifecycle.next_try_time = next_try_time;
    }

    pub fn finish_rollback(&mut self) -> bool {
        let lifecycle = &mut self.record.lifecycle;
        if lifecycle.state != RecordState::Rollbacking {
            return false;
        }
        lifecycle.state = RecordState::Rollbacked;
        lifecycle.last_error = None;
        true
    }

    /// Ends a rollback pass that could not compensate every step.
    pub fn abandon_rollback(&mut self, error: impl Into<String>) {
        let lifecycle = &mut self.record.lifecycle;
        if lifecycle.state == RecordState::Rollbacking {
            lifecycle.state = RecordState::Failed;
            lifecycle.last_error = Some(error.into());
        }
    }
}

//! Saga orchestrator.
//!
//! A [`SagaStateMachine`] drives one saga type's process graph against a
//! persisted [`SagaRecord`]. Progress is saved after every step transition,
//! so a crash at any point leaves a saga that the saga sweeps can resume or
//! roll back.
//!
//! Forward execution walks the graph in [`Process::flatten`] order and stops
//! at the first step that is not `DONE`. Steps already `DONE` are not run
//! again; their stored output becomes the running context. Compensation walks
//! the same order backwards, so a step is always compensated before anything
//! that ran ahead of it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, RecordId, SharedClock, non_blank};
use record::{Payload, PayloadType, RecordState, RetryPolicy, SagaRecord};
use record_store::{SagaRepository, StoreError};
use uuid::Uuid;

use crate::process::CompensateFn;
use crate::{Compensation, Process, Result, SagaDefinition, SagaError};

/// In-process attempts of a forward or compensating handler before the
/// failure is recorded on the step.
pub const LOCAL_TRIES: u32 = 3;

/// Error recorded on a step that ran but has no compensating handler.
pub const MISSING_ROLLBACK: &str = "missing rollback handler";

/// Outcome of submitting a saga.
#[derive(Debug, Clone)]
pub enum SagaSubmission {
    /// A new saga was created.
    Accepted(SagaRecord),
    /// A saga with the same idempotency key already exists; it is returned
    /// untouched.
    Duplicate(SagaRecord),
}

impl SagaSubmission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SagaSubmission::Accepted(_))
    }

    pub fn saga(&self) -> &SagaRecord {
        match self {
            SagaSubmission::Accepted(saga) | SagaSubmission::Duplicate(saga) => saga,
        }
    }

    pub fn into_saga(self) -> SagaRecord {
        match self {
            SagaSubmission::Accepted(saga) | SagaSubmission::Duplicate(saga) => saga,
        }
    }
}

/// Type-erased view of a state machine, as used by the supervisor and the
/// saga sweeps.
///
/// `begin_*` methods claim a saga for a pass and persist the claim; the
/// matching pass method does the work. Both reject a saga of another type.
#[async_trait]
pub trait SagaRunner: Send + Sync {
    fn saga_type(&self) -> &str;

    /// Type tag of the context this saga type runs on.
    fn context_type(&self) -> &str;

    /// Creates a saga from an encoded context. See [`SagaStateMachine::run`].
    async fn run_payload(
        &self,
        context: Payload,
        run_immediately: bool,
        uuid: Option<&str>,
    ) -> Result<SagaSubmission>;

    async fn load(&self, id: RecordId) -> Result<Option<SagaRecord>>;

    /// Looks up a saga of this type by idempotency key, within this service.
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<SagaRecord>>;

    /// Starts a forward attempt. Returns false if the saga is not due or not
    /// resumable; an exhausted or expired saga is persisted in its terminal
    /// state (or `ROLLBACKING`, if it has something to compensate).
    async fn begin_resume(&self, saga: &mut SagaRecord, now: DateTime<Utc>) -> Result<bool>;

    /// Runs forward from the first step that is not `DONE`.
    async fn resume(&self, saga: SagaRecord) -> Result<SagaRecord>;

    /// Moves a `FAILED` saga to `ROLLBACKING`, or re-claims one already
    /// rolling back. Returns false if there is nothing to roll back.
    async fn begin_rollback(&self, saga: &mut SagaRecord, now: DateTime<Utc>) -> Result<bool>;

    /// Compensates every step that ran, newest first.
    async fn rollback(&self, saga: SagaRecord) -> Result<SagaRecord>;
}

/// Orchestrates sagas of one [`SagaDefinition`].
pub struct SagaStateMachine<D: SagaDefinition> {
    definition: D,
    process: Process<D::Context>,
    policy: RetryPolicy,
    service_name: String,
    repo: Arc<dyn SagaRepository>,
    clock: SharedClock,
}

impl<D: SagaDefinition> SagaStateMachine<D> {
    /// Builds and validates the process graph.
    pub fn new(
        definition: D,
        service_name: impl Into<String>,
        repo: Arc<dyn SagaRepository>,
        clock: SharedClock,
    ) -> Result<Self> {
        let process = definition.process();
        process.validate()?;
        let policy = definition.retry_policy();
        Ok(Self {
            definition,
            process,
            policy,
            service_name: service_name.into(),
            repo,
            clock,
        })
    }

    pub fn definition(&self) -> &D {
        &self.definition
    }

    pub fn process(&self) -> &Process<D::Context> {
        &self.process
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Creates a saga for `context` and, if `run_immediately`, runs its first
    /// forward pass inline.
    ///
    /// A non-blank `uuid` that already names a saga of this type returns that
    /// saga as [`SagaSubmission::Duplicate`]. Without a key a random one is
    /// generated. Otherwise the saga is left `INIT` for the saga sweep.
    #[tracing::instrument(skip(self, context), fields(saga_type = D::SAGA_TYPE))]
    pub async fn run(
        &self,
        context: D::Context,
        run_immediately: bool,
        uuid: Option<&str>,
    ) -> Result<SagaSubmission> {
        let uuid = non_blank(uuid);
        if let Some(key) = uuid.as_deref()
            && let Some(existing) = self.find_by_uuid(key).await?
        {
            tracing::warn!(uuid = %key, "Saga already submitted");
            return Ok(SagaSubmission::Duplicate(existing));
        }
        let uuid = uuid.unwrap_or_else(|| Uuid::new_v4().to_string());

        let now = self.clock.now();
        let saga = self.build(&context, &uuid, now)?;
        let mut saga = match self.repo.insert(&saga).await {
            Ok(saga) => saga,
            Err(StoreError::DuplicateKey { .. }) => {
                let existing = self
                    .find_by_uuid(&uuid)
                    .await?
                    .ok_or_else(|| SagaError::NotFound(uuid.clone()))?;
                return Ok(SagaSubmission::Duplicate(existing));
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!("saga_started_total", "saga_type" => D::SAGA_TYPE).increment(1);
        tracing::info!(saga_id = %saga.id(), %uuid, "Saga created");

        if run_immediately && self.begin_resume(&mut saga, now).await? {
            saga = self.resume(saga).await?;
        }
        Ok(SagaSubmission::Accepted(saga))
    }

    /// A new `INIT` saga with one untouched step per graph node.
    fn build(&self, context: &D::Context, uuid: &str, now: DateTime<Utc>) -> Result<SagaRecord> {
        let mut saga = SagaRecord::new(
            D::SAGA_TYPE,
            self.service_name.as_str(),
            Payload::encode(context)?,
            uuid,
            now,
            &self.policy,
        );
        for node in self.process.flatten() {
            saga.ensure_step(node.code(), node.name(), now);
        }
        Ok(saga)
    }

    fn check_type(&self, saga: &SagaRecord) -> Result<()> {
        if saga.saga_type() != D::SAGA_TYPE {
            return Err(SagaError::TypeMismatch {
                saga_id: saga.id(),
                expected: D::SAGA_TYPE.to_string(),
                actual: saga.saga_type().to_string(),
            });
        }
        let context_type = &saga.record.payload.type_tag;
        if context_type != <D::Context as PayloadType>::TYPE_TAG {
            return Err(SagaError::TypeMismatch {
                saga_id: saga.id(),
                expected: <D::Context as PayloadType>::TYPE_TAG.to_string(),
                actual: context_type.clone(),
            });
        }
        Ok(())
    }

    async fn save(&self, saga: &mut SagaRecord) -> Result<()> {
        *saga = self.repo.update(saga).await?;
        Ok(())
    }

    /// Returns true if a step that ran has a compensating handler.
    fn has_compensation(&self, saga: &SagaRecord) -> bool {
        self.process.flatten().iter().any(|node| {
            node.has_rollback()
                && saga
                    .step(node.code())
                    .is_some_and(|step| step.needs_compensation())
        })
    }

    /// Bookkeeping for a saga that just became `FAILED`. Not persisted here.
    fn on_failed(&self, saga: &mut SagaRecord, now: DateTime<Utc>) {
        metrics::counter!("saga_failed_total", "saga_type" => D::SAGA_TYPE).increment(1);
        if self.has_compensation(saga) && saga.begin_rollback(now, self.rollback_lease(now)) {
            tracing::info!(saga_id = %saga.id(), "Saga failed, rollback scheduled");
        } else {
            tracing::warn!(saga_id = %saga.id(), state = %saga.state(), "Saga failed");
        }
    }

    /// When the rollback sweep may pick a claimed saga up again.
    fn rollback_lease(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.policy.backoff.delay_for(0)
    }

    /// Ends a forward pass at a failed step.
    async fn fail_pass(
        &self,
        mut saga: SagaRecord,
        context: &D::Context,
        error: String,
    ) -> Result<SagaRecord> {
        let state = saga.fail(Payload::encode(context)?, error.as_str());
        tracing::warn!(
            saga_id = %saga.id(),
            %state,
            tried = saga.record.lifecycle.tried_times,
            error = %error,
            "Saga pass failed"
        );
        if state == RecordState::Failed {
            self.on_failed(&mut saga, self.clock.now());
        }
        self.save(&mut saga).await?;
        Ok(saga)
    }

    async fn run_forward(
        &self,
        node: &Process<D::Context>,
        context: &D::Context,
    ) -> std::result::Result<D::Context, String> {
        let mut last_error = String::new();
        for attempt in 1..=LOCAL_TRIES {
            match (node.forward())(context.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    tracing::warn!(step = node.code(), attempt, error = %e, "Saga step handler failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(last_error)
    }

    async fn run_compensation(
        &self,
        node: &Process<D::Context>,
        compensate: &CompensateFn<D::Context>,
        compensation: Compensation<D::Context>,
    ) -> std::result::Result<(), String> {
        let mut last_error = String::new();
        for attempt in 1..=LOCAL_TRIES {
            match compensate(compensation.clone()).await {
                Ok(true) => return Ok(()),
                Ok(false) => last_error = "compensation reported no effect".to_string(),
                Err(e) => last_error = e.to_string(),
            }
            tracing::warn!(step = node.code(), attempt, error = %last_error, "Saga rollback handler failed");
        }
        Err(last_error)
    }

    fn compensation_for(
        &self,
        saga: &SagaRecord,
        code: i32,
        context: &D::Context,
    ) -> Result<Compensation<D::Context>> {
        let step = saga
            .step(code)
            .ok_or_else(|| SagaError::NotFound(format!("saga {} step {code}", saga.id())))?;
        Ok(Compensation {
            input: step
                .input
                .as_ref()
                .map(|p| p.decode::<D::Context>())
                .transpose()?,
            output: step
                .output
                .as_ref()
                .map(|p| p.decode::<D::Context>())
                .transpose()?,
            context: context.clone(),
        })
    }
}

#[async_trait]
impl<D: SagaDefinition> SagaRunner for SagaStateMachine<D> {
    fn saga_type(&self) -> &str {
        D::SAGA_TYPE
    }

    fn context_type(&self) -> &str {
        <D::Context as PayloadType>::TYPE_TAG
    }

    async fn run_payload(
        &self,
        context: Payload,
        run_immediately: bool,
        uuid: Option<&str>,
    ) -> Result<SagaSubmission> {
        let context = context.decode::<D::Context>()?;
        self.run(context, run_immediately, uuid).await
    }

    async fn load(&self, id: RecordId) -> Result<Option<SagaRecord>> {
        Ok(self.repo.get(id).await?)
    }

    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<SagaRecord>> {
        Ok(self
            .repo
            .find_by_uuid(&self.service_name, D::SAGA_TYPE, uuid)
            .await?)
    }

    async fn begin_resume(&self, saga: &mut SagaRecord, now: DateTime<Utc>) -> Result<bool> {
        self.check_type(saga)?;
        match saga.begin_attempt(now, &self.policy.backoff) {
            Ok(true) => {
                self.save(saga).await?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) if e.is_terminal() => {
                tracing::warn!(saga_id = %saga.id(), error = %e, "Saga cannot resume");
                saga.record.lifecycle.last_error = Some(e.to_string());
                if saga.state() == RecordState::Failed {
                    self.on_failed(saga, now);
                }
                self.save(saga).await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip_all, fields(saga_type = D::SAGA_TYPE, saga_id = %saga.id()))]
    async fn resume(&self, saga: SagaRecord) -> Result<SagaRecord> {
        self.check_type(&saga)?;
        let mut saga = saga;
        if saga.state() != RecordState::Running {
            tracing::debug!(state = %saga.state(), "Only running sagas resume");
            return Ok(saga);
        }

        let mut context: D::Context = saga.context().decode()?;

        for node in self.process.flatten() {
            let code = node.code();
            let now = self.clock.now();
            let step = saga.ensure_step(code, node.name(), now);

            match step.state() {
                RecordState::Done => {
                    if let Some(output) = &step.output {
                        context = output.decode()?;
                    }
                    continue;
                }
                RecordState::Init | RecordState::Running => {}
                state => {
                    let error = format!("step {code} is {state}");
                    return self.fail_pass(saga, &context, error).await;
                }
            }

            match step.begin_attempt(now, Payload::encode(&context)?) {
                Ok(true) => {}
                Ok(false) => return Ok(saga),
                Err(e) => return self.fail_pass(saga, &context, e.to_string()).await,
            }
            self.save(&mut saga).await?;

            let started = Instant::now();
            let outcome = self.run_forward(node, &context).await;
            metrics::histogram!("saga_step_duration_seconds", "saga_type" => D::SAGA_TYPE)
                .record(started.elapsed().as_secs_f64());

            match outcome {
                Ok(output) => {
                    let payload = Payload::encode(&output)?;
                    saga.ensure_step(code, node.name(), now).complete(payload);
                    context = output;
                    self.save(&mut saga).await?;
                    tracing::debug!(step = code, name = node.name(), "Saga step done");
                }
                Err(error) => {
                    saga.ensure_step(code, node.name(), now).fail(error.as_str());
                    let error = format!("step {code} failed: {error}");
                    return self.fail_pass(saga, &context, error).await;
                }
            }
        }

        if saga.all_steps_done() {
            saga.finish_running(Payload::encode(&context)?);
            self.save(&mut saga).await?;
            metrics::counter!("saga_completed_total", "saga_type" => D::SAGA_TYPE).increment(1);
            tracing::info!("Saga done");
        }
        Ok(saga)
    }

    async fn begin_rollback(&self, saga: &mut SagaRecord, now: DateTime<Utc>) -> Result<bool> {
        self.check_type(saga)?;
        let before = saga.state();
        let lease = self.rollback_lease(now);
        let started = saga.begin_rollback(now, lease);
        if started && before == RecordState::Rollbacking {
            saga.reschedule(now, lease);
        }
        if started || saga.state() != before {
            self.save(saga).await?;
        }
        Ok(started)
    }

    #[tracing::instrument(skip_all, fields(saga_type = D::SAGA_TYPE, saga_id = %saga.id()))]
    async fn rollback(&self, saga: SagaRecord) -> Result<SagaRecord> {
        self.check_type(&saga)?;
        let mut saga = saga;
        if saga.state() != RecordState::Rollbacking {
            tracing::debug!(state = %saga.state(), "Only rolling-back sagas roll back");
            return Ok(saga);
        }

        let context: D::Context = saga.context().decode()?;

        for node in self.process.flatten().into_iter().rev() {
            let code = node.code();
            let touched = saga
                .step(code)
                .is_some_and(|step| step.needs_compensation());
            if !touched {
                continue;
            }

            let Some(compensate) = node.compensate() else {
                if let Some(step) = saga.step_mut(code) {
                    step.mark_defect(MISSING_ROLLBACK);
                }
                saga.abandon_rollback(format!("step {code}: {MISSING_ROLLBACK}"));
                self.save(&mut saga).await?;
                metrics::counter!("saga_failed_total", "saga_type" => D::SAGA_TYPE).increment(1);
                tracing::error!(step = code, name = node.name(), "Saga step has no rollback handler");
                return Err(SagaError::MissingCompensation {
                    saga_id: saga.id(),
                    code,
                });
            };

            let compensation = self.compensation_for(&saga, code, &context)?;
            if let Some(step) = saga.step_mut(code) {
                step.begin_rollback(self.clock.now());
            }
            self.save(&mut saga).await?;

            match self.run_compensation(node, compensate, compensation).await {
                Ok(()) => {
                    if let Some(step) = saga.step_mut(code) {
                        step.finish_rollback();
                    }
                    self.save(&mut saga).await?;
                    tracing::debug!(step = code, name = node.name(), "Saga step rolled back");
                }
                Err(error) => {
                    if let Some(step) = saga.step_mut(code) {
                        step.rollback_failed(error.as_str());
                    }
                    saga.abandon_rollback(format!("step {code} rollback failed: {error}"));
                    self.save(&mut saga).await?;
                    metrics::counter!("saga_failed_total", "saga_type" => D::SAGA_TYPE)
                        .increment(1);
                    tracing::warn!(step = code, error = %error, "Saga rollback abandoned");
                    return Ok(saga);
                }
            }
        }

        if saga.rollback_complete() {
            saga.finish_rollback();
            metrics::counter!("saga_rollbacked_total", "saga_type" => D::SAGA_TYPE).increment(1);
            tracing::info!("Saga rolled back");
        } else {
            // Steps persisted for codes the current graph no longer has.
            saga.abandon_rollback("steps outside the process graph were not compensated");
            metrics::counter!("saga_failed_total", "saga_type" => D::SAGA_TYPE).increment(1);
        }
        self.save(&mut saga).await?;
        Ok(saga)
    }
}

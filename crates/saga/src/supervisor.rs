use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::WorkerPool;
use record::{Payload, PayloadType, RecordState, SagaRecord};

use crate::{Result, SagaError, SagaRunner, SagaSubmission};

/// Routes saga submissions and passes to the state machine for each saga type.
///
/// New sagas are resolved by the type tag of their context; persisted sagas
/// by their saga type, after checking that the stored context still has the
/// type that saga expects. Passes handed to the worker pool re-read the saga
/// first, so a stale copy is never written back.
#[derive(Clone)]
pub struct SagaSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    by_type: HashMap<String, Arc<dyn SagaRunner>>,
    by_context: HashMap<String, Vec<Arc<dyn SagaRunner>>>,
    pool: WorkerPool,
}

impl SagaSupervisor {
    pub fn builder(pool: WorkerPool) -> SagaSupervisorBuilder {
        SagaSupervisorBuilder {
            runners: Vec::new(),
            pool,
        }
    }

    /// Registered saga types, sorted. Saga sweeps only look at these.
    pub fn supported_saga_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.inner.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Context type tags that resolve to a saga type, sorted.
    pub fn supported_context_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.inner.by_context.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn runner(&self, saga_type: &str) -> Result<&Arc<dyn SagaRunner>> {
        self.inner
            .by_type
            .get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    fn resolve(&self, context_type: &str) -> Result<&Arc<dyn SagaRunner>> {
        match self.inner.by_context.get(context_type).map(Vec::as_slice) {
            Some([runner]) => Ok(runner),
            Some([_, _, ..]) => Err(SagaError::AmbiguousContext(context_type.to_string())),
            _ => Err(SagaError::UnknownContext(context_type.to_string())),
        }
    }

    /// The runner for a persisted saga, rejecting a saga whose stored context
    /// type no longer matches its saga type.
    fn checked(&self, saga: &SagaRecord) -> Result<&Arc<dyn SagaRunner>> {
        let runner = self.runner(saga.saga_type())?;
        let stored = &saga.record.payload.type_tag;
        if stored != runner.context_type() {
            return Err(SagaError::TypeMismatch {
                saga_id: saga.id(),
                expected: runner.context_type().to_string(),
                actual: stored.clone(),
            });
        }
        Ok(runner)
    }

    /// Starts the saga registered for `C`.
    ///
    /// Fails if no saga, or more than one, accepts `C`.
    pub async fn run<C: PayloadType>(
        &self,
        context: &C,
        run_immediately: bool,
        uuid: Option<&str>,
    ) -> Result<SagaSubmission> {
        let runner = self.resolve(C::TYPE_TAG)?;
        let submission = runner
            .run_payload(Payload::encode(context)?, run_immediately, uuid)
            .await?;
        self.follow_up(&submission);
        Ok(submission)
    }

    /// Starts a saga of an explicit type with an already-encoded context.
    pub async fn run_by_type(
        &self,
        saga_type: &str,
        context: Payload,
        run_immediately: bool,
        uuid: Option<&str>,
    ) -> Result<SagaSubmission> {
        let submission = self
            .runner(saga_type)?
            .run_payload(context, run_immediately, uuid)
            .await?;
        self.follow_up(&submission);
        Ok(submission)
    }

    pub async fn find_by_uuid(&self, saga_type: &str, uuid: &str) -> Result<Option<SagaRecord>> {
        self.runner(saga_type)?.find_by_uuid(uuid).await
    }

    pub async fn begin_resume(&self, saga: &mut SagaRecord, now: DateTime<Utc>) -> Result<bool> {
        self.checked(saga)?.begin_resume(saga, now).await
    }

    /// Runs a forward pass inline. A saga that ends up `ROLLBACKING` gets its
    /// rollback scheduled right away.
    pub async fn resume(&self, saga: SagaRecord) -> Result<SagaRecord> {
        let saga = self.checked(&saga)?.resume(saga).await?;
        if saga.state() == RecordState::Rollbacking {
            self.schedule_rollback(&saga, Duration::ZERO)?;
        }
        Ok(saga)
    }

    pub async fn begin_rollback(&self, saga: &mut SagaRecord, now: DateTime<Utc>) -> Result<bool> {
        self.checked(saga)?.begin_rollback(saga, now).await
    }

    /// Runs a rollback pass inline.
    pub async fn rollback(&self, saga: SagaRecord) -> Result<SagaRecord> {
        self.checked(&saga)?.rollback(saga).await
    }

    /// Hands a forward pass to the worker pool after `delay`.
    ///
    /// Returns `Ok(false)` if the pool refused the job.
    pub fn schedule_resume(&self, saga: &SagaRecord, delay: Duration) -> Result<bool> {
        self.checked(saga)?;
        let supervisor = self.clone();
        let saga_type = saga.saga_type().to_string();
        let id = saga.id();
        Ok(self.inner.pool.schedule(delay, async move {
            let result: Result<()> = async {
                let Some(saga) = supervisor.runner(&saga_type)?.load(id).await? else {
                    return Ok(());
                };
                supervisor.resume(saga).await.map(|_| ())
            }
            .await;
            if let Err(e) = result {
                tracing::error!(saga_id = %id, %saga_type, error = %e, "Saga resume failed");
            }
        }))
    }

    /// Hands a rollback pass to the worker pool after `delay`.
    pub fn schedule_rollback(&self, saga: &SagaRecord, delay: Duration) -> Result<bool> {
        self.checked(saga)?;
        let supervisor = self.clone();
        let saga_type = saga.saga_type().to_string();
        let id = saga.id();
        Ok(self.inner.pool.schedule(delay, async move {
            let result: Result<()> = async {
                let Some(saga) = supervisor.runner(&saga_type)?.load(id).await? else {
                    return Ok(());
                };
                supervisor.rollback(saga).await.map(|_| ())
            }
            .await;
            if let Err(e) = result {
                tracing::error!(saga_id = %id, %saga_type, error = %e, "Saga rollback failed");
            }
        }))
    }

    fn follow_up(&self, submission: &SagaSubmission) {
        let SagaSubmission::Accepted(saga) = submission else {
            return;
        };
        if saga.state() == RecordState::Rollbacking
            && let Err(e) = self.schedule_rollback(saga, Duration::ZERO)
        {
            tracing::error!(saga_id = %saga.id(), error = %e, "Could not schedule saga rollback");
        }
    }
}

impl fmt::Debug for SagaSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaSupervisor")
            .field("saga_types", &self.supported_saga_types())
            .field("pool", &self.inner.pool.name())
            .finish()
    }
}

pub struct SagaSupervisorBuilder {
    runners: Vec<Arc<dyn SagaRunner>>,
    pool: WorkerPool,
}

impl SagaSupervisorBuilder {
    pub fn register<R: SagaRunner + 'static>(mut self, runner: R) -> Self {
        self.runners.push(Arc::new(runner));
        self
    }

    /// Fails if two runners claim the same saga type.
    pub fn build(self) -> Result<SagaSupervisor> {
        let mut by_type = HashMap::new();
        let mut by_context: HashMap<String, Vec<Arc<dyn SagaRunner>>> = HashMap::new();
        for runner in self.runners {
            let saga_type = runner.saga_type().to_string();
            if by_type.contains_key(&saga_type) {
                return Err(SagaError::DuplicateSagaType(saga_type));
            }
            by_context
                .entry(runner.context_type().to_string())
                .or_default()
                .push(Arc::clone(&runner));
            by_type.insert(saga_type, runner);
        }
        Ok(SagaSupervisor {
            inner: Arc::new(Inner {
                by_type,
                by_context,
                pool: self.pool,
            }),
        })
    }
}

//! Saga resume and rollback sweeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SharedClock;
use record::{RecordFamily, RecordState, SagaRecord};
use record_store::{Cursor, LeaseLockStore, RecordQuery, SagaRepository};
use saga::{SagaError, SagaSupervisor};

use crate::{PeriodicJob, Result, SweepOutcome, SweepRunner, SweepSettings};

pub const SAGA_COMPENSATION_SWEEP: &str = "saga_compensation";
pub const SAGA_ROLLBACK_SWEEP: &str = "saga_rollback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Forward,
    Rollback,
}

/// Finds due sagas of the registered saga types and hands a pass to the
/// supervisor's worker pool.
///
/// The compensation sweep resumes sagas left `INIT` or interrupted while
/// `RUNNING`; the rollback sweep re-claims `ROLLBACKING` sagas whose previous
/// pass never finished. Sagas of types this instance does not run are left
/// alone.
pub struct SagaSweep {
    pass: Pass,
    runner: SweepRunner,
    sagas: Arc<dyn SagaRepository>,
    supervisor: SagaSupervisor,
}

impl SagaSweep {
    pub fn compensation(
        service_name: impl Into<String>,
        settings: SweepSettings,
        sagas: Arc<dyn SagaRepository>,
        supervisor: SagaSupervisor,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            pass: Pass::Forward,
            runner: SweepRunner::new(SAGA_COMPENSATION_SWEEP, service_name, settings, locks, clock),
            sagas,
            supervisor,
        }
    }

    pub fn rollback(
        service_name: impl Into<String>,
        settings: SweepSettings,
        sagas: Arc<dyn SagaRepository>,
        supervisor: SagaSupervisor,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            pass: Pass::Rollback,
            runner: SweepRunner::new(SAGA_ROLLBACK_SWEEP, service_name, settings, locks, clock),
            sagas,
            supervisor,
        }
    }

    pub fn runner(&self) -> &SweepRunner {
        &self.runner
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let saga_types = self.supervisor.supported_saga_types();
        if saga_types.is_empty() {
            return Ok(0);
        }
        let states = match self.pass {
            Pass::Forward => RecordFamily::Saga.retryable_states(),
            Pass::Rollback => vec![RecordState::Rollbacking],
        };
        let mut query = RecordQuery::due(self.runner.service_name(), states, now)
            .kinds(saga_types)
            .limit(self.runner.settings().batch_size);

        let mut processed = 0;
        loop {
            let page = self.sagas.query(&query).await?;
            let Some(last) = page.last() else {
                break;
            };
            query = query.after(Cursor::after(&last.record));
            for saga in page {
                let claimed = match self.pass {
                    Pass::Forward => self.claim_forward(saga, now).await?,
                    Pass::Rollback => self.claim_rollback(saga, now).await?,
                };
                if claimed {
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    async fn claim_forward(&self, mut saga: SagaRecord, now: DateTime<Utc>) -> Result<bool> {
        match self.supervisor.begin_resume(&mut saga, now).await {
            Ok(true) => {
                self.supervisor.schedule_resume(&saga, Duration::ZERO)?;
                Ok(true)
            }
            // Out of attempts: the saga failed and, if anything can be
            // compensated, went on to ROLLBACKING.
            Ok(false) if saga.state() == RecordState::Rollbacking => {
                self.supervisor.schedule_rollback(&saga, Duration::ZERO)?;
                Ok(true)
            }
            Ok(false) => Ok(saga.record.is_terminal()),
            Err(e) => skip_or_abort(&saga, e),
        }
    }

    async fn claim_rollback(&self, mut saga: SagaRecord, now: DateTime<Utc>) -> Result<bool> {
        match self.supervisor.begin_rollback(&mut saga, now).await {
            Ok(true) => {
                self.supervisor.schedule_rollback(&saga, Duration::ZERO)?;
                Ok(true)
            }
            Ok(false) => Ok(saga.record.is_terminal()),
            Err(e) => skip_or_abort(&saga, e),
        }
    }
}

/// Version clashes and corrupted sagas are skipped; anything else aborts the
/// tick.
fn skip_or_abort(saga: &SagaRecord, error: SagaError) -> Result<bool> {
    match error {
        SagaError::Store(e) if e.is_conflict() => {
            tracing::debug!(saga_id = %saga.id(), "Saga claimed elsewhere");
            Ok(false)
        }
        e @ (SagaError::TypeMismatch { .. } | SagaError::Record(_)) => {
            tracing::error!(
                saga_id = %saga.id(),
                saga_type = saga.saga_type(),
                error = %e,
                "Saga skipped"
            );
            Ok(false)
        }
        e => Err(e.into()),
    }
}

#[async_trait]
impl PeriodicJob for SagaSweep {
    fn name(&self) -> &'static str {
        self.runner.sweep()
    }

    fn interval(&self) -> Duration {
        self.runner.settings().interval
    }

    fn start_delay(&self) -> Duration {
        self.runner.start_delay()
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        self.runner.run(|now| self.sweep(now)).await
    }
}

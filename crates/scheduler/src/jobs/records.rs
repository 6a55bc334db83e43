//! Re-dispatch of due task and event records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SharedClock;
use outbox::EventPublisher;
use record::{BackoffPolicy, DurableRecord};
use record_store::{Cursor, LeaseLockStore, RecordQuery, RecordRepository};
use task::TaskRunner;

use crate::{PeriodicJob, Result, SweepOutcome, SweepRunner, SweepSettings};

pub const TASK_SWEEP: &str = "task_compensation";
pub const EVENT_SWEEP: &str = "event_compensation";

/// Executes claimed flat records.
pub trait RecordDispatcher: Send + Sync + 'static {
    fn repository(&self) -> &Arc<dyn RecordRepository>;

    fn backoff_for(&self, kind: &str) -> BackoffPolicy;

    /// Hands an in-flight record to the worker pool. False if refused.
    fn dispatch(&self, record: &DurableRecord, delay: Duration) -> bool;
}

impl RecordDispatcher for TaskRunner {
    fn repository(&self) -> &Arc<dyn RecordRepository> {
        TaskRunner::repository(self)
    }

    fn backoff_for(&self, kind: &str) -> BackoffPolicy {
        TaskRunner::backoff_for(self, kind)
    }

    fn dispatch(&self, record: &DurableRecord, delay: Duration) -> bool {
        TaskRunner::dispatch(self, record, delay)
    }
}

impl RecordDispatcher for EventPublisher {
    fn repository(&self) -> &Arc<dyn RecordRepository> {
        EventPublisher::repository(self)
    }

    fn backoff_for(&self, kind: &str) -> BackoffPolicy {
        EventPublisher::backoff_for(self, kind)
    }

    fn dispatch(&self, record: &DurableRecord, delay: Duration) -> bool {
        EventPublisher::dispatch(self, record, delay)
    }
}

/// Finds task or event records that are due, or stuck in flight past their
/// next try time, and dispatches them again.
///
/// Records due within half an interval are claimed now: the attempt starts at
/// the record's own next try time and the dispatch is delayed until then.
pub struct RecordSweep<D> {
    runner: SweepRunner,
    dispatcher: D,
}

/// Sweep over task records.
pub type TaskSweep = RecordSweep<TaskRunner>;

/// Sweep over outbox event records.
pub type EventSweep = RecordSweep<EventPublisher>;

impl RecordSweep<TaskRunner> {
    pub fn for_tasks(
        service_name: impl Into<String>,
        settings: SweepSettings,
        runner: TaskRunner,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        Self::new(TASK_SWEEP, service_name, settings, runner, locks, clock)
    }
}

impl RecordSweep<EventPublisher> {
    pub fn for_events(
        settings: SweepSettings,
        publisher: EventPublisher,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        let service_name = publisher.service_name().to_string();
        Self::new(EVENT_SWEEP, service_name, settings, publisher, locks, clock)
    }
}

impl<D: RecordDispatcher> RecordSweep<D> {
    pub fn new(
        sweep: &'static str,
        service_name: impl Into<String>,
        settings: SweepSettings,
        dispatcher: D,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            runner: SweepRunner::new(sweep, service_name, settings, locks, clock),
            dispatcher,
        }
    }

    pub fn runner(&self) -> &SweepRunner {
        &self.runner
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let repo = self.dispatcher.repository();
        let settings = self.runner.settings();
        let mut query = RecordQuery::due(
            self.runner.service_name(),
            repo.family().retryable_states(),
            now + settings.half_interval(),
        )
        .limit(settings.batch_size);

        let mut processed = 0;
        loop {
            let page = repo.query(&query).await?;
            let Some(last) = page.last() else {
                break;
            };
            query = query.after(Cursor::after(last));
            for record in page {
                if self.claim(record, now).await? {
                    processed += 1;
                }
            }
        }
        Ok(processed)
    }

    /// Starts the next attempt of `record` and dispatches it. Exhausted and
    /// expired records are saved in their terminal state instead.
    async fn claim(&self, mut record: DurableRecord, now: DateTime<Utc>) -> Result<bool> {
        let start = record.lifecycle.next_try_time.max(now);
        let backoff = self.dispatcher.backoff_for(&record.kind);
        let attempt = record.begin_attempt(start, &backoff);
        if let Ok(false) = attempt {
            return Ok(false);
        }

        let saved = match self.dispatcher.repository().update(&record).await {
            Ok(saved) => saved,
            Err(e) if e.is_conflict() => {
                tracing::debug!(record_id = %record.id, "Record claimed elsewhere");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        match attempt {
            Ok(_) => {
                let delay = (start - now).to_std().unwrap_or_default();
                tracing::debug!(
                    sweep = self.runner.sweep(),
                    record_id = %saved.id,
                    kind = %saved.kind,
                    tried = saved.lifecycle.tried_times,
                    delay_ms = delay.as_millis() as u64,
                    "Record re-dispatched"
                );
                if !self.dispatcher.dispatch(&saved, delay) {
                    tracing::warn!(record_id = %saved.id, "Worker pool refused record");
                }
            }
            Err(e) => {
                tracing::warn!(
                    sweep = self.runner.sweep(),
                    record_id = %saved.id,
                    kind = %saved.kind,
                    state = %saved.state(),
                    error = %e,
                    "Record retired"
                );
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl<D: RecordDispatcher> PeriodicJob for RecordSweep<D> {
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

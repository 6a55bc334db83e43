use std::sync::Arc;

use common::{RecordId, WorkerPool};
use record::{BackoffPolicy, DurableRecord, RecordState};
use record_store::RecordRepository;

use crate::{Result, TaskRegistry};

/// Executes in-flight task records on a worker pool.
///
/// The runner never starts an attempt itself. Callers (the supervisor or the
/// task sweep) run `begin_attempt`, persist the record, then hand it here.
#[derive(Clone)]
pub struct TaskRunner {
    repo: Arc<dyn RecordRepository>,
    registry: Arc<TaskRegistry>,
    pool: WorkerPool,
}

impl TaskRunner {
    pub fn new(
        repo: Arc<dyn RecordRepository>,
        registry: Arc<TaskRegistry>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            repo,
            registry,
            pool,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn RecordRepository> {
        &self.repo
    }

    /// Backoff between attempts of `kind`.
    pub fn backoff_for(&self, kind: &str) -> BackoffPolicy {
        self.registry.backoff(kind)
    }

    /// Schedules `record` to execute after `delay`.
    ///
    /// Returns false if the pool refused the job; the record then stays due in
    /// storage for the next sweep.
    pub fn dispatch(&self, record: &DurableRecord, delay: std::time::Duration) -> bool {
        let runner = self.clone();
        let id = record.id;
        let kind = record.kind.clone();
        self.pool.schedule(delay, async move {
            if let Err(e) = runner.execute(id).await {
                tracing::error!(record_id = %id, %kind, error = %e, "Task execution failed");
            }
        })
    }

    /// Runs one attempt of the task stored under `id` and saves the outcome.
    ///
    /// The record is re-read first; if it was cancelled or finished in the
    /// meantime the handler is not called. Returns the state after the attempt.
    #[tracing::instrument(skip(self))]
    pub async fn execute(&self, id: RecordId) -> Result<RecordState> {
        let Some(mut record) = self.repo.get(id).await? else {
            tracing::debug!(record_id = %id, "Task record gone before execution");
            return Ok(RecordState::Cancel);
        };
        if !record.lifecycle.is_in_flight() {
            return Ok(record.state());
        }

        metrics::counter!("task_attempts_total").increment(1);

        let outcome = match self.registry.get(&record.kind) {
            Some(handler) => handler.execute(&record.payload).await,
            None => Err(format!("no task handler registered for kind '{}'", record.kind)),
        };

        match outcome {
            Ok(output) => {
                record.complete(Some(output));
                metrics::counter!("task_completed_total").increment(1);
                tracing::info!(
                    record_id = %id,
                    kind = %record.kind,
                    tried = record.lifecycle.tried_times,
                    "Task completed"
                );
            }
            Err(message) => {
                let state = record.fail(message.as_str());
                if state == RecordState::Failed {
                    metrics::counter!("task_failed_total").increment(1);
                }
                tracing::warn!(
                    record_id = %id,
                    kind = %record.kind,
                    tried = record.lifecycle.tried_times,
                    %state,
                    error = %message,
                    "Task attempt failed"
                );
            }
        }

        let saved = self.repo.update(&record).await?;
        Ok(saved.state())
    }
}

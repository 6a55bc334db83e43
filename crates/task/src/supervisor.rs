use std::sync::Arc;

use chrono::Duration;
use common::{Clock, SharedClock, non_blank};
use record::{DurableRecord, Payload, RecordFamily, RetryPolicy};
use record_store::{RecordRepository, RecordRepositoryExt, StoreError};

use crate::{Result, TaskError, TaskHandler, TaskRunner};

/// Options for submitting a task.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Idempotency key. A second submission with the same key is not accepted.
    pub uuid: Option<String>,
    /// Deadline measured from the scheduled start.
    pub expire: Duration,
    /// Maximum number of attempts.
    pub retry_times: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            uuid: None,
            expire: Duration::days(1),
            retry_times: 3,
        }
    }
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn retry_times(mut self, retry_times: u32) -> Self {
        self.retry_times = retry_times;
        self
    }
}

/// Creates task records and starts them.
///
/// Submissions scheduled within the near-immediate window start their first
/// attempt right away; later ones are left `INIT` for the task sweep.
#[derive(Clone)]
pub struct TaskSupervisor {
    service_name: String,
    runner: TaskRunner,
    clock: SharedClock,
    near_immediate: Duration,
}

impl TaskSupervisor {
    pub fn new(service_name: impl Into<String>, runner: TaskRunner, clock: SharedClock) -> Self {
        Self {
            service_name: service_name.into(),
            runner,
            clock,
            near_immediate: Duration::seconds(5),
        }
    }

    /// Sets the delay below which a submission is dispatched inline.
    pub fn with_near_immediate(mut self, threshold: Duration) -> Self {
        self.near_immediate = threshold;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    fn repo(&self) -> &Arc<dyn RecordRepository> {
        self.runner.repository()
    }

    /// Submits `param` to run now. See [`TaskSupervisor::delay`].
    pub async fn run<H: TaskHandler>(
        &self,
        param: &H::Param,
        options: SubmitOptions,
    ) -> Result<bool> {
        self.delay::<H>(param, Duration::zero(), options).await
    }

    /// Submits `param` to run after `delay`.
    ///
    /// Returns `Ok(false)` without creating anything if a task with the same
    /// idempotency key already exists for this service.
    #[tracing::instrument(skip(self, param, options), fields(kind = H::KIND, uuid = ?options.uuid))]
    pub async fn delay<H: TaskHandler>(
        &self,
        param: &H::Param,
        delay: Duration,
        options: SubmitOptions,
    ) -> Result<bool> {
        if !self.runner.registry().contains(H::KIND) {
            return Err(TaskError::UnknownKind(H::KIND.to_string()));
        }

        let uuid = non_blank(options.uuid.as_deref());
        if let Some(ref key) = uuid
            && self.repo().exists_by_uuid(&self.service_name, key).await?
        {
            tracing::warn!(uuid = %key, "Task already submitted");
            return Ok(false);
        }

        let policy = self
            .runner
            .registry()
            .retry_policy(H::KIND)
            .unwrap_or_else(|| RetryPolicy::new(options.retry_times, options.expire));

        let now = self.clock.now();
        let record = DurableRecord::new(
            RecordFamily::Task,
            H::KIND,
            self.service_name.clone(),
            Payload::encode(param)?,
            now,
            &policy,
        )
        .with_uuid(uuid.as_deref())
        .scheduled_at(now + delay);

        self.start(record, delay).await
    }

    /// Looks up a live task by idempotency key.
    pub async fn query(&self, uuid: &str) -> Result<Option<DurableRecord>> {
        Ok(self.repo().find_by_uuid(&self.service_name, uuid).await?)
    }

    /// Starts another attempt of `record` now, if it is due.
    ///
    /// Returns `Ok(false)` if the record is not runnable yet. An exhausted or
    /// expired record is saved in its terminal state and the error returned.
    #[tracing::instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn resume(&self, mut record: DurableRecord) -> Result<bool> {
        let backoff = self.runner.backoff_for(&record.kind);
        match record.begin_attempt(self.clock.now(), &backoff) {
            Ok(true) => {
                let saved = self.repo().update(&record).await?;
                Ok(self.runner.dispatch(&saved, std::time::Duration::ZERO))
            }
            Ok(false) => Ok(false),
            Err(e) => {
                self.repo().update(&record).await?;
                Err(e.into())
            }
        }
    }

    /// Prevents any further attempt of the task with this key.
    ///
    /// Returns false if the task already reached a terminal state.
    pub async fn cancel(&self, uuid: &str) -> Result<bool> {
        let mut record = self
            .query(uuid)
            .await?
            .ok_or_else(|| TaskError::NotFound(uuid.to_string()))?;
        if !record.cancel() {
            return Ok(false);
        }
        self.repo().update(&record).await?;
        tracing::info!(record_id = %record.id, %uuid, "Task cancelled");
        Ok(true)
    }

    /// Re-submits the parameter of an existing task under a new key.
    pub async fn copy_and_run(&self, source_uuid: &str, uuid: &str) -> Result<bool> {
        self.copy_and_delay(source_uuid, uuid, Duration::zero()).await
    }

    pub async fn copy_and_delay(
        &self,
        source_uuid: &str,
        uuid: &str,
        delay: Duration,
    ) -> Result<bool> {
        let source = self
            .query(source_uuid)
            .await?
            .ok_or_else(|| TaskError::NotFound(source_uuid.to_string()))?;

        let now = self.clock.now();
        let record = source.copy_as(Some(uuid), now).scheduled_at(now + delay);

        if let Some(ref key) = record.uuid
            && self.repo().exists_by_uuid(&self.service_name, key).await?
        {
            return Ok(false);
        }

        self.start(record, delay).await
    }

    /// Persists a new record, starting its first attempt inline when it is
    /// due within the near-immediate window.
    async fn start(&self, mut record: DurableRecord, delay: Duration) -> Result<bool> {
        let inline = delay < self.near_immediate;
        if inline {
            let backoff = self.runner.backoff_for(&record.kind);
            let at = record.lifecycle.next_try_time;
            record.begin_attempt(at, &backoff)?;
        }

        let saved = match self.repo().insert(&record).await {
            Ok(saved) => saved,
            Err(StoreError::DuplicateKey { uuid, .. }) => {
                tracing::warn!(%uuid, "Task already submitted");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            record_id = %saved.id,
            kind = %saved.kind,
            next_try_time = %saved.lifecycle.next_try_time,
            inline,
            "Task submitted"
        );

        if inline {
            self.runner.dispatch(&saved, delay.to_std().unwrap_or_default());
        }
        Ok(true)
    }
}

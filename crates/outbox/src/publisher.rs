use std::collections::HashMap;
use std::sync::Arc;

use common::{Clock, RecordId, SharedClock, WorkerPool};
use record::{BackoffPolicy, DurableRecord, Payload, RecordFamily, RecordState, RetryPolicy};
use record_store::RecordRepository;

use crate::{EventSubscriber, IntegrationEvent, Result, SubscriberRegistry, Transport};

/// Writes integration events to the outbox and delivers them.
///
/// Cheap to clone; clones share the same configuration.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

struct Inner {
    service_name: String,
    repo: Arc<dyn RecordRepository>,
    transport: Option<Arc<dyn Transport>>,
    routes: HashMap<String, String>,
    subscribers: SubscriberRegistry,
    policies: HashMap<String, RetryPolicy>,
    pool: WorkerPool,
    clock: SharedClock,
}

impl EventPublisher {
    pub fn builder(
        service_name: impl Into<String>,
        repo: Arc<dyn RecordRepository>,
        pool: WorkerPool,
        clock: SharedClock,
    ) -> EventPublisherBuilder {
        EventPublisherBuilder {
            service_name: service_name.into(),
            repo,
            transport: None,
            routes: HashMap::new(),
            subscribers: SubscriberRegistry::new(),
            policies: HashMap::new(),
            pool,
            clock,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn repository(&self) -> &Arc<dyn RecordRepository> {
        &self.inner.repo
    }

    /// Backoff between delivery attempts of `event_type`.
    pub fn backoff_for(&self, event_type: &str) -> BackoffPolicy {
        self.inner
            .policies
            .get(event_type)
            .map(|p| p.backoff.clone())
            .unwrap_or_else(BackoffPolicy::outbox)
    }

    /// Builds an unsaved `INIT` record for `event`.
    pub fn create<E: IntegrationEvent>(
        &self,
        event: &E,
        uuid: Option<&str>,
    ) -> Result<DurableRecord> {
        let record = DurableRecord::new(
            RecordFamily::Event,
            E::EVENT_TYPE,
            self.inner.service_name.clone(),
            Payload::encode(event)?,
            self.inner.clock.now(),
            &E::retry_policy(),
        )
        .with_uuid(uuid);
        Ok(record)
    }

    /// Records `event` and starts delivering it right away.
    #[tracing::instrument(skip(self, event), fields(event_type = E::EVENT_TYPE))]
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<RecordId> {
        let record = self.create(event, None)?;
        self.publish_new(record).await
    }

    /// Starts the first delivery attempt of an unsaved record, saves it and
    /// hands it to the worker pool.
    pub async fn publish_new(&self, record: DurableRecord) -> Result<RecordId> {
        let saved = self.persist_new(record).await?;
        self.dispatch(&saved, std::time::Duration::ZERO);
        Ok(saved.id)
    }

    /// Starts the first delivery attempt of an unsaved record and saves it
    /// without dispatching. If the process dies before dispatch, the event
    /// sweep delivers it once the attempt's backoff has passed.
    pub async fn persist_new(&self, mut record: DurableRecord) -> Result<DurableRecord> {
        let backoff = self.backoff_for(&record.kind);
        record.begin_attempt(self.inner.clock.now(), &backoff)?;
        Ok(self.inner.repo.insert(&record).await?)
    }

    /// Schedules delivery of an in-flight record after `delay`.
    pub fn dispatch(&self, record: &DurableRecord, delay: std::time::Duration) -> bool {
        let publisher = self.clone();
        let id = record.id;
        self.inner.pool.schedule(delay, async move {
            if let Err(e) = publisher.deliver(id).await {
                tracing::error!(record_id = %id, error = %e, "Event delivery could not be saved");
            }
        })
    }

    /// Makes one delivery attempt of the event stored under `id`.
    ///
    /// Routed event types go to the transport; the rest fan out to in-process
    /// subscribers. A failure is recorded and the event stays due.
    pub async fn deliver(&self, id: RecordId) -> Result<RecordState> {
        let Some(mut record) = self.inner.repo.get(id).await? else {
            return Ok(RecordState::Cancel);
        };
        if !record.lifecycle.is_in_flight() {
            return Ok(record.state());
        }

        let outcome = match (
            self.inner.transport.as_ref(),
            self.inner.routes.get(&record.kind),
        ) {
            (Some(transport), Some(destination)) => transport
                .send(destination, &record.payload)
                .await
                .map_err(|e| e.to_string()),
            _ => {
                self.inner
                    .subscribers
                    .trigger(&record.kind, &record.payload)
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                record.complete(None);
                metrics::counter!("event_delivered_total").increment(1);
                tracing::info!(record_id = %id, event_type = %record.kind, "Event delivered");
            }
            Err(message) => {
                let state = record.fail(message.as_str());
                metrics::counter!("event_delivery_failed_total").increment(1);
                tracing::warn!(
                    record_id = %id,
                    event_type = %record.kind,
                    tried = record.lifecycle.tried_times,
                    %state,
                    error = %message,
                    "Event delivery failed"
                );
            }
        }

        let saved = self.inner.repo.update(&record).await?;
        Ok(saved.state())
    }
}

/// Configures routes, subscribers and per-type policies of an [`EventPublisher`].
pub struct EventPublisherBuilder {
    service_name: String,
    repo: Arc<dyn RecordRepository>,
    transport: Option<Arc<dyn Transport>>,
    routes: HashMap<String, String>,
    subscribers: SubscriberRegistry,
    policies: HashMap<String, RetryPolicy>,
    pool: WorkerPool,
    clock: SharedClock,
}

impl EventPublisherBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sends events of type `E` to `destination` through the transport.
    pub fn route<E: IntegrationEvent>(mut self, destination: impl Into<String>) -> Self {
        self.register::<E>();
        self.routes
            .insert(E::EVENT_TYPE.to_string(), destination.into());
        self
    }

    /// Delivers events of type `E` to `subscriber` when they are not routed.
    pub fn subscribe<E, S>(mut self, subscriber: S) -> Self
    where
        E: IntegrationEvent,
        S: EventSubscriber<E>,
    {
        self.register::<E>();
        self.subscribers.subscribe::<E, S>(subscriber);
        self
    }

    /// Declares `E` so its retry policy applies to sweeps and redelivery.
    pub fn event<E: IntegrationEvent>(mut self) -> Self {
        self.register::<E>();
        self
    }

    fn register<E: IntegrationEvent>(&mut self) {
        self.policies
            .insert(E::EVENT_TYPE.to_string(), E::retry_policy());
    }

    pub fn build(self) -> EventPublisher {
        EventPublisher {
            inner: Arc::new(Inner {
                service_name: self.service_name,
                repo: self.repo,
                transport: self.transport,
                routes: self.routes,
                subscribers: self.subscribers,
                policies: self.policies,
                pool: self.pool,
                clock: self.clock,
            }),
        }
    }
}

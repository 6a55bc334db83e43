//! In-process event subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::HandlerError;
use record::Payload;

use crate::IntegrationEvent;

/// Receives events of type `E` delivered in-process.
#[async_trait]
pub trait EventSubscriber<E: IntegrationEvent>: Send + Sync + 'static {
    async fn on_event(&self, event: &E) -> Result<(), HandlerError>;
}

#[async_trait]
trait ErasedSubscriber: Send + Sync {
    async fn handle(&self, payload: &Payload) -> Result<(), String>;
}

struct Erased<E, S> {
    subscriber: S,
    _event: std::marker::PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, S> ErasedSubscriber for Erased<E, S>
where
    E: IntegrationEvent,
    S: EventSubscriber<E>,
{
    async fn handle(&self, payload: &Payload) -> Result<(), String> {
        let event: E = payload.decode().map_err(|e| e.to_string())?;
        self.subscriber
            .on_event(&event)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Subscribers by event type.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    subscribers: HashMap<String, Vec<Arc<dyn ErasedSubscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E, S>(&mut self, subscriber: S)
    where
        E: IntegrationEvent,
        S: EventSubscriber<E>,
    {
        self.subscribers
            .entry(E::EVENT_TYPE.to_string())
            .or_default()
            .push(Arc::new(Erased {
                subscriber,
                _event: std::marker::PhantomData,
            }));
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers.get(event_type).map_or(0, Vec::len)
    }

    /// Delivers `payload` to every subscriber of `event_type`, in registration
    /// order. Every subscriber runs even if an earlier one failed; the errors
    /// are joined into one message.
    pub async fn trigger(&self, event_type: &str, payload: &Payload) -> Result<(), String> {
        let Some(subscribers) = self.subscribers.get(event_type) else {
            tracing::debug!(%event_type, "No subscribers for event");
            return Ok(());
        };

        let mut errors = Vec::new();
        for subscriber in subscribers {
            if let Err(e) = subscriber.handle(payload).await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .subscribers
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &counts)
            .finish()
    }
}

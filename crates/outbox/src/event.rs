use record::{PayloadType, RetryPolicy};

/// An event published to other services through the outbox.
///
/// `EVENT_TYPE` becomes the record kind and is what destinations are routed
/// and subscribers are registered by.
pub trait IntegrationEvent: PayloadType {
    const EVENT_TYPE: &'static str;

    /// Delivery budget, deadline and backoff for this event type.
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::event_default()
    }
}

//! Transactional outbox.
//!
//! Integration events are written as durable records before delivery is
//! attempted. Delivery goes to a [`Transport`] destination when one is routed
//! for the event type, and otherwise fans out in-process to the registered
//! subscribers. Failed deliveries stay due and are retried by the event sweep.

pub mod error;
pub mod event;
pub mod pending;
pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use error::{OutboxError, Result};
pub use event::IntegrationEvent;
pub use pending::PendingEvents;
pub use publisher::{EventPublisher, EventPublisherBuilder};
pub use subscriber::{EventSubscriber, SubscriberRegistry};
pub use transport::{InMemoryTransport, Transport, TransportError};

//! Message transport trait and in-memory implementation.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use record::Payload;
use thiserror::Error;

/// A send that the transport did not acknowledge.
#[derive(Debug, Clone, Error)]
#[error("Transport error: {0}")]
pub struct TransportError(pub String);

/// Sends event payloads to a named destination (topic, queue, exchange).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the broker acknowledged the message.
    async fn send(&self, destination: &str, payload: &Payload) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct InMemoryTransportState {
    sent: Vec<(String, Payload)>,
    fail_on_send: bool,
}

/// In-memory transport for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<RwLock<InMemoryTransportState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the transport to reject every send.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_send = fail;
    }

    /// Messages acknowledged so far, in send order.
    pub fn sent(&self) -> Vec<(String, Payload)> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, destination: &str, payload: &Payload) -> Result<(), TransportError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.fail_on_send {
            return Err(TransportError(format!("broker unavailable for {destination}")));
        }
        state.sent.push((destination.to_string(), payload.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_records_message() {
        let transport = InMemoryTransport::new();
        transport.send("orders", &Payload::unit()).await.unwrap();

        assert_eq!(transport.sent_count(), 1);
        assert_eq!(transport.sent()[0].0, "orders");
    }

    #[tokio::test]
    async fn test_fail_on_send() {
        let transport = InMemoryTransport::new();
        transport.set_fail_on_send(true);

        assert!(transport.send("orders", &Payload::unit()).await.is_err());
        assert_eq!(transport.sent_count(), 0);
    }
}

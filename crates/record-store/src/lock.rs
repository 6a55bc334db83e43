//! Lease lock contract.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::Result;

/// A named, TTL-bound advisory lock backed by one row per name.
///
/// At most one token holds a name at a time. The lock only throttles how many
/// instances run a sweep concurrently; record writes stay optimistic.
#[async_trait]
pub trait LeaseLockStore: Send + Sync {
    /// Takes the lock for `ttl` if it is free, expired, or already held by `token`.
    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Releases the lock if `token` still owns it. Returns false otherwise.
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

/// Random owner token, fresh for every acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock name for a sweep of one service, e.g. `task_compensation[billing]`.
pub fn lock_name(sweep: &str, service_name: &str) -> String {
    format!("{sweep}[{service_name}]")
}

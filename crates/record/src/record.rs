use chrono::{DateTime, Utc};
use common::{RecordId, non_blank};
use serde::{Deserialize, Serialize};

use crate::{
    BackoffPolicy, Lifecycle, Payload, RecordFamily, RecordState, Result, RetryPolicy,
};

/// Optimistic concurrency counter of a stored record.
///
/// A record that has never been written is at version 0; every successful
/// write bumps it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of a record not yet written.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version after the first write.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A persisted unit of work: a task, an outbox event, or the aggregate row of
/// a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub id: RecordId,
    /// Business idempotency key, unique per service within one record table.
    pub uuid: Option<String>,
    /// Handler or type identifier used for redispatch.
    pub kind: String,
    pub service_name: String,
    pub payload: Payload,
    /// Output of the successful attempt (or, for sagas, the latest context).
    pub result: Option<Payload>,
    pub lifecycle: Lifecycle,
    pub version: Version,
}

impl DurableRecord {
    /// Creates an `INIT` record due immediately.
    pub fn new(
        family: RecordFamily,
        kind: impl Into<String>,
        service_name: impl Into<String>,
        payload: Payload,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Self {
        Self {
            id: RecordId::new(),
            uuid: None,
            kind: kind.into(),
            service_name: service_name.into(),
            payload,
            result: None,
            lifecycle: Lifecycle::new(family, now, policy),
            version: Version::initial(),
        }
    }

    /// Sets the idempotency key. Blank keys are dropped.
    pub fn with_uuid(mut self, uuid: Option<&str>) -> Self {
        self.uuid = non_blank(uuid);
        self
    }

    /// Defers the first attempt to `at`, shifting the deadline by the same amount.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        let shift = at - self.lifecycle.next_try_time;
        if shift > chrono::Duration::zero() {
            self.lifecycle.expire_at += shift;
        }
        self.lifecycle.next_try_time = at;
        self
    }

    /// A fresh `INIT` copy with a new identity, the same kind, payload and
    /// budget, and a deadline of the same length starting at `now`.
    pub fn copy_as(&self, uuid: Option<&str>, now: DateTime<Utc>) -> Self {
        let policy = RetryPolicy::new(
            self.lifecycle.try_times,
            self.lifecycle.expire_at - self.lifecycle.created_at,
        );
        Self::new(
            self.family(),
            self.kind.clone(),
            self.service_name.clone(),
            self.payload.clone(),
            now,
            &policy,
        )
        .with_uuid(uuid)
    }

    pub fn family(&self) -> RecordFamily {
        self.lifecycle.family
    }

    pub fn state(&self) -> RecordState {
        self.lifecycle.state
    }

    pub fn is_terminal(&self) -> bool {
        self.lifecycle.is_terminal()
    }

    /// See [`Lifecycle::begin_attempt`].
    pub fn begin_attempt(&mut self, now: DateTime<Utc>, backoff: &BackoffPolicy) -> Result<bool> {
        self.lifecycle.begin_attempt(now, backoff)
    }

    /// Stores `output` and moves to the success state. No-op unless in flight.
    pub fn complete(&mut self, output: Option<Payload>) -> bool {
        if !self.lifecycle.complete() {
            return false;
        }
        self.result = output;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> RecordState {
        self.lifecycle.fail(error)
    }

    pub fn cancel(&mut self) -> bool {
        self.lifecycle.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(now: DateTime<Utc>) -> DurableRecord {
        DurableRecord::new(
            RecordFamily::Task,
            "send_email",
            "billing",
            Payload::raw("send_email", serde_json::json!({"to": "a@example.com"})),
            now,
            &RetryPolicy::new(3, Duration::hours(1)),
        )
    }

    #[test]
    fn test_version_ordering() {
        assert_eq!(Version::initial().next(), Version::first());
        assert!(Version::new(3) > Version::new(2));
        assert_eq!(i64::from(Version::new(7)), 7);
    }

    #[test]
    fn test_new_record_defaults() {
        let now = Utc::now();
        let record = task(now);
        assert_eq!(record.state(), RecordState::Init);
        assert_eq!(record.version, Version::initial());
        assert_eq!(record.family(), RecordFamily::Task);
        assert!(record.uuid.is_none());
    }

    #[test]
    fn test_with_uuid_drops_blank_keys() {
        let now = Utc::now();
        assert_eq!(task(now).with_uuid(Some("  ")).uuid, None);
        assert_eq!(
            task(now).with_uuid(Some("k-1")).uuid.as_deref(),
            Some("k-1")
        );
    }

    #[test]
    fn test_scheduled_at_shifts_deadline() {
        let now = Utc::now();
        let record = task(now).scheduled_at(now + Duration::minutes(30));
        assert_eq!(record.lifecycle.next_try_time, now + Duration::minutes(30));
        assert_eq!(
            record.lifecycle.expire_at,
            now + Duration::minutes(30) + Duration::hours(1)
        );
    }

    #[test]
    fn test_complete_stores_output_only_when_in_flight() {
        let now = Utc::now();
        let mut record = task(now);
        assert!(!record.complete(Some(Payload::unit())));
        assert!(record.result.is_none());

        record.begin_attempt(now, &BackoffPolicy::Staircase).unwrap();
        assert!(record.complete(Some(Payload::unit())));
        assert_eq!(record.state(), RecordState::Delivered);
        assert_eq!(record.result, Some(Payload::unit()));
    }

    #[test]
    fn test_copy_as_resets_lifecycle() {
        let now = Utc::now();
        let mut source = task(now).with_uuid(Some("src"));
        source.begin_attempt(now, &BackoffPolicy::Staircase).unwrap();
        source.complete(None);

        let later = now + Duration::days(1);
        let copy = source.copy_as(Some("copy"), later);
        assert_ne!(copy.id, source.id);
        assert_eq!(copy.uuid.as_deref(), Some("copy"));
        assert_eq!(copy.state(), RecordState::Init);
        assert_eq!(copy.lifecycle.tried_times, 0);
        assert_eq!(copy.lifecycle.try_times, 3);
        assert_eq!(copy.lifecycle.expire_at, later + Duration::hours(1));
        assert_eq!(copy.payload, source.payload);
    }
}

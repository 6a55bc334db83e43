//! The retry state machine shared by every durable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BackoffPolicy, RecordError, RecordFamily, RecordState, Result, RetryPolicy};

/// Scheduling and lifecycle columns of a durable record.
///
/// Invariant: `tried_times <= try_times`. Terminal states are never left by
/// the forward machine; only the saga rollback path re-opens `FAILED`/`DONE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub family: RecordFamily,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    /// Absolute deadline. Any attempt started after it expires the record.
    pub expire_at: DateTime<Utc>,
    pub last_try_time: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may start.
    pub next_try_time: DateTime<Utc>,
    pub try_times: u32,
    pub tried_times: u32,
    pub last_error: Option<String>,
}

impl Lifecycle {
    /// A fresh `INIT` lifecycle, due immediately.
    pub fn new(family: RecordFamily, now: DateTime<Utc>, policy: &RetryPolicy) -> Self {
        Self {
            family,
            state: RecordState::Init,
            created_at: now,
            expire_at: now + policy.expire_after,
            last_try_time: None,
            next_try_time: now,
            try_times: policy.try_times,
            tried_times: 0,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == self.family.in_flight_state()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expire_at
    }

    pub fn retries_remaining(&self) -> u32 {
        self.try_times.saturating_sub(self.tried_times)
    }

    /// Starts an attempt at `now`.
    ///
    /// Returns `Ok(true)` if the record moved in flight, `Ok(false)` if it is
    /// not runnable right now (wrong state, or the next attempt is scheduled
    /// later). Exhaustion and expiry move the record to `FAILED`/`EXPIRED`
    /// and are reported as errors so the caller persists the terminal state.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>, backoff: &BackoffPolicy) -> Result<bool> {
        if self.state != RecordState::Init && !self.is_in_flight() {
            return Ok(false);
        }
        if self.tried_times >= self.try_times {
            self.state = RecordState::Failed;
            return Err(RecordError::RetriesExhausted {
                tried: self.tried_times,
                max: self.try_times,
            });
        }
        if self.is_expired(now) {
            self.state = RecordState::Expired;
            return Err(RecordError::Expired {
                expire_at: self.expire_at,
            });
        }
        if self.next_try_time > now {
            return Ok(false);
        }

        self.state = self.family.in_flight_state();
        self.tried_times += 1;
        self.last_try_time = Some(now);
        self.next_try_time = now + backoff.delay_for(self.tried_times);
        Ok(true)
    }

    /// Finishes the in-flight attempt successfully. No-op otherwise.
    pub fn complete(&mut self) -> bool {
        if !self.is_in_flight() {
            return false;
        }
        self.state = self.family.success_state();
        self.last_error = None;
        true
    }

    /// Records a failed attempt.
    ///
    /// The record stays in flight, due again at `next_try_time`, while attempts
    /// remain; otherwise it becomes `FAILED`. Returns the resulting state.
    pub fn fail(&mut self, error: impl Into<String>) -> RecordState {
        if !self.is_in_flight() {
            return self.state;
        }
        self.last_error = Some(error.into());
        if self.tried_times >= self.try_times {
            self.state = RecordState::Failed;
        }
        self.state
    }

    /// Prevents any future attempt. An in-flight handler is not interrupted.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = RecordState::Cancel;
        true
    }
}

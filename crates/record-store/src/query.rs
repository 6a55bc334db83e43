use chrono::{DateTime, Utc};
use common::RecordId;
use record::{DurableRecord, RecordState};

/// Keyset position in the `(created_at, id)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: RecordId,
}

impl Cursor {
    /// The position right after `record`.
    pub fn after(record: &DurableRecord) -> Self {
        Self {
            created_at: record.lifecycle.created_at,
            id: record.id,
        }
    }
}

/// Builder for record queries.
///
/// Results are always ordered by creation time ascending, ties broken by id.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Filter by owning service.
    pub service_name: Option<String>,

    /// Filter by kind (any of these).
    pub kinds: Option<Vec<String>>,

    /// Filter by state (any of these). Empty means any state.
    pub states: Vec<RecordState>,

    /// Only records with `next_try_time <= due_before`.
    pub due_before: Option<DateTime<Utc>>,

    /// Only records with `expire_at < expired_before`.
    pub expired_before: Option<DateTime<Utc>>,

    /// Only records strictly after this keyset position.
    pub after: Option<Cursor>,

    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of `service_name` in `states` whose next attempt is due by `horizon`.
    pub fn due(
        service_name: impl Into<String>,
        states: Vec<RecordState>,
        horizon: DateTime<Utc>,
    ) -> Self {
        Self::new()
            .service(service_name)
            .states(states)
            .due_before(horizon)
    }

    /// Records of `service_name` in terminal `states` whose deadline passed before `cutoff`.
    pub fn archivable(
        service_name: impl Into<String>,
        states: Vec<RecordState>,
        cutoff: DateTime<Utc>,
    ) -> Self {
        Self::new()
            .service(service_name)
            .states(states)
            .expired_before(cutoff)
    }

    pub fn service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn kinds(mut self, kinds: Vec<String>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn states(mut self, states: Vec<RecordState>) -> Self {
        self.states = states;
        self
    }

    pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
        self.due_before = Some(at);
        self
    }

    pub fn expired_before(mut self, at: DateTime<Utc>) -> Self {
        self.expired_before = Some(at);
        self
    }

    pub fn after(mut self, cursor: Cursor) -> Self {
        self.after = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluates the predicate part of the query against one record.
    pub fn matches(&self, record: &DurableRecord) -> bool {
        if let Some(ref service) = self.service_name
            && &record.service_name != service
        {
            return false;
        }
        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&record.kind)
        {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&record.state()) {
            return false;
        }
        if let Some(at) = self.due_before
            && record.lifecycle.next_try_time > at
        {
            return false;
        }
        if let Some(at) = self.expired_before
            && record.lifecycle.expire_at >= at
        {
            return false;
        }
        if let Some(cursor) = self.after
            && (record.lifecycle.created_at, record.id) <= (cursor.created_at, cursor.id)
        {
            return false;
        }
        true
    }
}

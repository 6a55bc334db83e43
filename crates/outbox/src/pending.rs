//! Events collected during one unit of work.

use common::RecordId;
use record::DurableRecord;

use crate::{EventPublisher, IntegrationEvent, Result};

/// Integration events raised inside a unit of work, published together once
/// the work is committed.
///
/// Dropping the context without calling [`PendingEvents::commit`] discards
/// the events, which is what a rolled-back unit of work wants.
#[derive(Debug, Default)]
pub struct PendingEvents {
    records: Vec<DurableRecord>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `event` for publication at commit.
    pub fn attach<E: IntegrationEvent>(
        &mut self,
        publisher: &EventPublisher,
        event: &E,
    ) -> Result<()> {
        self.records.push(publisher.create(event, None)?);
        Ok(())
    }

    /// Removes the first queued event equal to `event`. Returns true if one
    /// was queued.
    pub fn detach<E: IntegrationEvent>(&mut self, event: &E) -> Result<bool> {
        let payload = record::Payload::encode(event)?;
        let position = self
            .records
            .iter()
            .position(|r| r.kind == E::EVENT_TYPE && r.payload == payload);
        Ok(match position {
            Some(index) => {
                self.records.remove(index);
                true
            }
            None => false,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Persists every queued event, then starts delivering each one exactly
    /// once. Consumes the context so it cannot be flushed twice.
    ///
    /// If saving fails part-way, the events already saved are still delivered
    /// by the event sweep.
    pub async fn commit(self, publisher: &EventPublisher) -> Result<Vec<RecordId>> {
        let mut saved = Vec::with_capacity(self.records.len());
        for record in self.records {
            saved.push(publisher.persist_new(record).await?);
        }
        for record in &saved {
            publisher.dispatch(record, std::time::Duration::ZERO);
        }
        Ok(saved.into_iter().map(|r| r.id).collect())
    }
}

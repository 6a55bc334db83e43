//! Archival of terminal records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{RecordId, SharedClock};
use record::RecordFamily;
use record_store::{Cursor, LeaseLockStore, RecordQuery, RecordRepository, SagaRepository};

use crate::{ArchiveSettings, PeriodicJob, Result, SweepOutcome, SweepRunner};

pub const ARCHIVE_SWEEP: &str = "archive";

/// Moves terminal tasks, events and sagas whose deadline passed more than the
/// grace period ago into the archive tables.
///
/// Each page is migrated in one storage call that copies before it deletes.
/// Sagas take their steps with them.
pub struct ArchiveSweep {
    runner: SweepRunner,
    grace: chrono::Duration,
    tasks: Arc<dyn RecordRepository>,
    events: Arc<dyn RecordRepository>,
    sagas: Arc<dyn SagaRepository>,
}

impl ArchiveSweep {
    pub fn new(
        service_name: impl Into<String>,
        settings: ArchiveSettings,
        tasks: Arc<dyn RecordRepository>,
        events: Arc<dyn RecordRepository>,
        sagas: Arc<dyn SagaRepository>,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            runner: SweepRunner::new(
                ARCHIVE_SWEEP,
                service_name,
                settings.as_sweep(),
                locks,
                clock,
            ),
            grace: settings.grace,
            tasks,
            events,
            sagas,
        }
    }

    fn query(&self, family: RecordFamily, now: DateTime<Utc>) -> RecordQuery {
        RecordQuery::archivable(
            self.runner.service_name(),
            family.archivable_states(),
            now - self.grace,
        )
        .limit(self.runner.settings().batch_size)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut archived = 0;
        for repo in [&self.tasks, &self.events] {
            archived += self.archive_records(repo.as_ref(), now).await?;
        }
        archived += self.archive_sagas(now).await?;
        Ok(archived)
    }

    async fn archive_records(&self, repo: &dyn RecordRepository, now: DateTime<Utc>) -> Result<usize> {
        let family = repo.family();
        let mut query = self.query(family, now);
        let mut archived = 0;
        loop {
            let page = repo.query(&query).await?;
            let Some(last) = page.last() else {
                break;
            };
            query = query.after(Cursor::after(last));
            let ids: Vec<RecordId> = page.iter().map(|r| r.id).collect();
            let moved = repo.archive(&ids, now).await?;
            record_archived(family, moved);
            archived += moved;
        }
        Ok(archived)
    }

    async fn archive_sagas(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut query = self.query(RecordFamily::Saga, now);
        let mut archived = 0;
        loop {
            let page = self.sagas.query(&query).await?;
            let Some(last) = page.last() else {
                break;
            };
            query = query.after(Cursor::after(&last.record));
            let ids: Vec<RecordId> = page.iter().map(|s| s.id()).collect();
            let moved = self.sagas.archive(&ids, now).await?;
            record_archived(RecordFamily::Saga, moved);
            archived += moved;
        }
        Ok(archived)
    }
}

fn record_archived(family: RecordFamily, moved: usize) {
    if moved == 0 {
        return;
    }
    metrics::counter!("archived_records_total", "table" => family.as_str()).increment(moved as u64);
    tracing::info!(family = %family, moved, "Archived terminal records");
}

#[async_trait]
impl PeriodicJob for ArchiveSweep {
    fn name(&self) -> &'static str {
        self.runner.sweep()
    }

    fn interval(&self) -> Duration {
        self.runner.settings().interval
    }

    fn start_delay(&self) -> Duration {
        self.runner.start_delay()
    }

    async fn run_once(&self) -> Result<SweepOutcome> {
        self.runner.run(|now| self.sweep(now)).await
    }
}

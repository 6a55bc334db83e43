//! Lease-locked execution of one sweep tick.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Clock, SharedClock};
use record_store::{LeaseLockStore, LeaseToken, lock_name};

use crate::{Result, SweepSettings};

/// What a sweep tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The lease was held and the body ran to the end.
    Completed { processed: usize },
    /// Another instance holds the lease.
    Contended,
    /// A previous tick of the same sweep is still running in this process.
    Skipped,
}

/// Runs the body of a sweep under its lease lock.
///
/// Each tick takes the lock `{sweep}[{service}]` with a fresh token and always
/// releases it when the body returns, whether it succeeded or not. A lost lock
/// yields the tick and grows the start delay of the next one by
/// `interval / max_concurrency`, wrapping at one interval, so contending
/// instances drift apart.
pub struct SweepRunner {
    sweep: &'static str,
    service_name: String,
    settings: SweepSettings,
    locks: Arc<dyn LeaseLockStore>,
    clock: SharedClock,
    running: AtomicBool,
    start_delay_ms: AtomicU64,
}

impl SweepRunner {
    pub fn new(
        sweep: &'static str,
        service_name: impl Into<String>,
        settings: SweepSettings,
        locks: Arc<dyn LeaseLockStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            sweep,
            service_name: service_name.into(),
            settings,
            locks,
            clock,
            running: AtomicBool::new(false),
            start_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn sweep(&self) -> &'static str {
        self.sweep
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    pub fn lock_name(&self) -> String {
        lock_name(self.sweep, &self.service_name)
    }

    /// Extra wait before the next scheduled tick.
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms.load(Ordering::Acquire))
    }

    /// Runs `body` with the lease held. `body` gets the tick time and returns
    /// how many records it handled.
    pub async fn run<F, Fut>(&self, body: F) -> Result<SweepOutcome>
    where
        F: FnOnce(DateTime<Utc>) -> Fut,
        Fut: Future<Output = Result<usize>>,
    {
        let Some(_guard) = RunningGuard::enter(&self.running) else {
            tracing::info!(sweep = self.sweep, "Previous sweep still running, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let name = self.lock_name();
        let token = LeaseToken::generate();
        let now = self.clock.now();
        if !self
            .locks
            .try_acquire(&name, token.as_str(), self.settings.lock_ttl(), now)
            .await?
        {
            self.on_contention();
            return Ok(SweepOutcome::Contended);
        }

        let result = body(now).await;

        match self.locks.release(&name, token.as_str()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(sweep = self.sweep, lock = %name, "Lease expired before release")
            }
            Err(e) => {
                tracing::error!(sweep = self.sweep, lock = %name, error = %e, "Lease release failed")
            }
        }

        let processed = result?;
        metrics::counter!("sweep_records_total", "sweep" => self.sweep).increment(processed as u64);
        if processed > 0 {
            tracing::info!(sweep = self.sweep, processed, "Sweep finished");
        }
        Ok(SweepOutcome::Completed { processed })
    }

    fn on_contention(&self) {
        metrics::counter!("sweep_lock_contention_total", "sweep" => self.sweep).increment(1);
        let step = self.settings.contention_step().as_millis() as u64;
        let interval = (self.settings.interval.as_millis() as u64).max(1);
        let delay = self
            .start_delay_ms
            .load(Ordering::Acquire)
            .saturating_add(step)
            % interval;
        self.start_delay_ms.store(delay, Ordering::Release);
        tracing::debug!(
            sweep = self.sweep,
            start_delay_ms = delay,
            "Sweep lease held elsewhere"
        );
    }
}

impl std::fmt::Debug for SweepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepRunner")
            .field("sweep", &self.sweep)
            .field("service_name", &self.service_name)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Clears the re-entrancy flag when the tick ends, even on panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

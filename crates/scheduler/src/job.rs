use std::time::Duration;

use async_trait::async_trait;

use crate::{Result, SweepOutcome};

/// A periodic entry point driven by the [`Scheduler`](crate::Scheduler)
/// timer, or triggered by hand.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Stable name, also the lease lock prefix.
    fn name(&self) -> &'static str;

    /// Time between two ticks.
    fn interval(&self) -> Duration;

    /// Extra wait before the next tick, grown by lease contention.
    fn start_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Runs one tick.
    async fn run_once(&self) -> Result<SweepOutcome>;
}

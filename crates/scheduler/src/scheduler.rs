use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::{PeriodicJob, Result, SchedulerError, SweepOutcome};

/// Shortest period a job loop ticks at. `time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Runs every registered job on its own timer.
///
/// A tick only discovers work and hands it to a worker pool, so a slow
/// handler never delays the next tick. Ticks of different jobs are
/// independent.
#[derive(Clone, Default)]
pub struct Scheduler {
    jobs: BTreeMap<&'static str, Arc<dyn PeriodicJob>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job`, replacing any job with the same name.
    pub fn with_job<J: PeriodicJob + 'static>(mut self, job: J) -> Self {
        self.jobs.insert(job.name(), Arc::new(job));
        self
    }

    /// Registered job names, sorted.
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.keys().copied().collect()
    }

    pub fn job(&self, name: &str) -> Option<&Arc<dyn PeriodicJob>> {
        self.jobs.get(name)
    }

    /// Runs one tick of `name` right away, outside its timer.
    pub async fn trigger(&self, name: &str) -> Result<SweepOutcome> {
        let job = self
            .job(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        job.run_once().await
    }

    /// Spawns one timer loop per job.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown, signal) = watch::channel(false);
        let tasks = self
            .jobs
            .values()
            .map(|job| tokio::spawn(run_job(Arc::clone(job), signal.clone())))
            .collect();
        tracing::info!(jobs = ?self.job_names(), "Scheduler started");
        SchedulerHandle { shutdown, tasks }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.job_names())
            .finish()
    }
}

/// Stops the timer loops started by [`Scheduler::start`].
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signals every loop to stop and waits for running ticks to end.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("Scheduler loops already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_job(job: Arc<dyn PeriodicJob>, mut shutdown: watch::Receiver<bool>) {
    let name = job.name();
    let period = job.interval();
    if period < MIN_INTERVAL {
        tracing::warn!(job = name, ?period, "Interval too short, ticking every second");
    }
    let mut ticker = time::interval(period.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let delay = job.start_delay();
        if !delay.is_zero() && !sleep_or_stop(delay, &mut shutdown).await {
            break;
        }

        match job.run_once().await {
            Ok(outcome) => tracing::debug!(job = name, ?outcome, "Tick finished"),
            Err(e) => tracing::error!(job = name, error = %e, "Tick failed"),
        }
    }
    tracing::debug!(job = name, "Job loop stopped");
}

/// Returns false if shutdown was signalled first.
async fn sleep_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = time::sleep(delay) => true,
    }
}

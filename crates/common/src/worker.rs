//! Bounded worker pool.
//!
//! Sweeps and supervisors only *discover* work; execution is handed to a
//! [`WorkerPool`] together with a start delay. A slow handler therefore
//! occupies a pool slot, never the sweep loop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{Notify, Semaphore};

/// A cloneable handle to a fixed-size pool of concurrent jobs.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool running at most `max_concurrency` jobs at once.
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        let size = max_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                size,
                permits: Arc::new(Semaphore::new(size)),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Jobs accepted but not yet finished, including delayed ones.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Runs `job` as soon as a slot frees up.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Duration::ZERO, job)
    }

    /// Runs `job` after `delay`, then waits for a free slot.
    ///
    /// Returns `false` when the pool has been shut down; the job is dropped and
    /// the owning record stays in storage for the next sweep.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            tracing::warn!(pool = %self.inner.name, "worker pool closed, job rejected");
            return false;
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("worker_pool_in_flight", "pool" => self.inner.name.clone()).increment(1.0);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _slot = InFlight(Arc::clone(&inner));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
                tracing::debug!(pool = %inner.name, "worker pool closed before job started");
                return;
            };
            if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(pool = %inner.name, panic = %message, "worker job panicked");
            }
        });

        true
    }

    /// Waits until every accepted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting jobs and waits up to `grace` for running ones.
    ///
    /// Jobs still pending after the grace period are abandoned; their records
    /// remain due and are re-discovered by the next sweep.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::Release);
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            tracing::warn!(
                pool = %self.inner.name,
                abandoned = self.in_flight(),
                "worker pool shutdown timed out"
            );
            self.inner.permits.close();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::gauge!("worker_pool_in_flight", "pool" => self.0.name.clone()).decrement(1.0);
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_submit_runs_job() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        assert!(pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        pool.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_honours_delay() {
        let pool = WorkerPool::new("test", 1);
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        pool.schedule(Duration::from_secs(30), async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("bounded", 2);
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.wait_idle().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_poison_pool() {
        let pool = WorkerPool::new("panics", 1);
        pool.submit(async { panic!("boom") });
        pool.wait_idle().await;

        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let pool = WorkerPool::new("closing", 1);
        pool.shutdown(Duration::from_millis(10)).await;
        assert!(!pool.submit(async {}));
        assert_eq!(pool.in_flight(), 0);
    }
}

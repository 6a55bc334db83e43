//! Tracing and metrics initialisation.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogFormat};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when it parses.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Installs the Prometheus recorder and describes the substrate's metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!("task_attempts_total", "Task attempts started");
    metrics::describe_counter!("task_completed_total", "Tasks delivered");
    metrics::describe_counter!("task_failed_total", "Task attempts that failed");
    metrics::describe_counter!("event_delivered_total", "Outbox events delivered");
    metrics::describe_counter!(
        "event_delivery_failed_total",
        "Outbox delivery attempts that failed"
    );
    metrics::describe_counter!("saga_started_total", "Sagas created");
    metrics::describe_counter!("saga_completed_total", "Sagas that reached DONE");
    metrics::describe_counter!("saga_failed_total", "Sagas left FAILED");
    metrics::describe_counter!("saga_rollbacked_total", "Sagas fully compensated");
    metrics::describe_histogram!(
        "saga_step_duration_seconds",
        metrics::Unit::Seconds,
        "Forward step handler latency"
    );
    metrics::describe_counter!("sweep_records_total", "Records claimed by a sweep");
    metrics::describe_counter!(
        "sweep_lock_contention_total",
        "Sweep ticks that lost the lease"
    );
    metrics::describe_counter!("archived_records_total", "Records moved to archive tables");
    metrics::describe_gauge!("worker_pool_in_flight", "Jobs running on a worker pool");
}

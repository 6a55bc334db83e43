//! Server entry point.

use std::sync::Arc;
use std::time::Duration;

use server::{Config, Runtime, connect_stores, telemetry};
use tokio::signal;

/// Time given to in-flight handlers once the server stops accepting requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    telemetry::init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = telemetry::init_metrics().expect("failed to install Prometheus recorder");

    // 3. Open stores and assemble supervisors and sweeps
    let stores = connect_stores(&config)
        .await
        .expect("failed to open record stores");
    let runtime = Arc::new(
        Runtime::builder(config.clone(), stores)
            .build()
            .expect("failed to assemble runtime"),
    );

    // 4. Start the periodic sweeps
    let scheduler = runtime.scheduler.start();

    // 5. Build the application
    let app = server::create_app(Arc::clone(&runtime), metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, service = %config.service_name, "starting server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop sweeping, then drain the worker pool
    scheduler.shutdown().await;
    runtime.shutdown(SHUTDOWN_GRACE).await;

    tracing::info!("server shut down gracefully");
}

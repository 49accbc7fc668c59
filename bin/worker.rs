//! Process entry point for the standalone worker binary: loads
//! configuration, connects to Postgres, and runs the reservation loop until
//! a termination signal triggers the drain-then-shutdown sequence.

use std::sync::Arc;

use snapqueue::queue::postgres::PostgresQueue;
use snapqueue::store::postgres::PostgresJobStore;
use snapqueue::{Config, EventBus, JobStore, Queue, Worker};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(config.worker_concurrency as u32 + 2)
        .connect(&database_url)
        .await
        .expect("failed to connect to Postgres");

    let bus = Arc::new(EventBus::default());
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
    let queue: Arc<dyn Queue> = Arc::new(PostgresQueue::new(
        pool,
        Arc::clone(&bus),
        config.max_attempts,
        config.backoff_base_ms,
        config.stall_window(),
    ));

    let worker = Arc::new(Worker::new(store, queue, bus, config));

    let shutdown_worker = Arc::clone(&worker);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install signal handler");
            return;
        }
        tracing::info!("shutdown signal received, draining in-flight jobs");
        shutdown_worker.request_shutdown();
    });

    tracing::info!("worker starting");
    worker.run().await;
    tracing::info!("worker stopped");
}

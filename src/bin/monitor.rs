use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;
use video_analysis_tracker::{
    config::AppConfig,
    services::{
        api::HttpAnalysisClient,
        store::{JobStore, RedisBackend},
        tracker::{JobEvent, Tracker},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting analysis job monitor");

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    // Initialize Prometheus metrics exporter
    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("METRICS_ADDR is not a valid socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");

    // Register application metrics
    metrics::describe_counter!(
        "analysis_jobs_submitted",
        "Total analysis jobs submitted through this tracker"
    );
    metrics::describe_counter!("analysis_polls_total", "Total status polls issued");
    metrics::describe_counter!(
        "analysis_poll_failures",
        "Status polls that failed and will be retried"
    );
    metrics::describe_counter!(
        "analysis_jobs_completed",
        "Jobs observed reaching the completed state"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed",
        "Jobs observed reaching the failed state"
    );
    metrics::describe_gauge!(
        "analysis_jobs_active",
        "Tracked jobs not yet in a terminal state"
    );

    // Initialize the durable job cache
    tracing::info!("Connecting to Redis job cache");
    let store_backend = RedisBackend::new(&config.redis_url, &config.owner_id)
        .expect("Failed to initialize Redis job cache");
    let store = JobStore::new(store_backend, config.owner_id.clone());

    // Initialize the analysis service client
    tracing::info!(base_url = %config.api_base_url, "Initializing analysis service client");
    let client = HttpAnalysisClient::new(&config.api_base_url, config.api_token.clone());

    let tracker = Tracker::new(Arc::new(client), store, config.owner_id.clone());
    let mut events = tracker.subscribe();

    // Reconcile with the service and restart polling for live jobs
    let resumed = tracker
        .resume()
        .await
        .expect("Failed to restore job state from cache");
    tracing::info!(resumed, "Monitor ready, watching job lifecycle events");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(JobEvent::Updated(job)) => {
                    tracing::info!(
                        job_id = %job.id,
                        status = %job.status,
                        processed = job.counts.processed,
                        failed = job.counts.failed,
                        progress = job.progress_percent(),
                        "job updated"
                    );
                }
                Ok(JobEvent::Removed { id, reason }) => {
                    tracing::info!(job_id = %id, ?reason, "job removed");
                }
                Ok(JobEvent::ResultsReady(job)) => {
                    tracing::info!(
                        job_id = %job.id,
                        items = job.results.len(),
                        "results available"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Monitor stopped");
}

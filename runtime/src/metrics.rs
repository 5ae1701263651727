//! Prometheus metrics for the delivery loops.
//!
//! This module provides metric collection for:
//! - Outbox publishing
//! - Inbox deduplication and handler failures
//! - Scheduled job outcomes
//! - Idempotency replays
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder other than
    /// this one is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                // In tests, several servers may race for the global recorder
                tracing::warn!(error = %e, "Metrics recorder already initialized, skipping");
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox
    describe_counter!(
        "relay_outbox_published_total",
        "Total number of outbox rows confirmed published"
    );
    describe_counter!(
        "relay_outbox_publish_failures_total",
        "Total number of outbox batches rolled back after a failure"
    );
    describe_histogram!(
        "relay_outbox_batch_duration_seconds",
        "Time taken to publish an outbox batch"
    );

    // Inbox / consumer
    describe_counter!(
        "relay_inbox_duplicates_total",
        "Total number of deliveries skipped as already processed"
    );
    describe_counter!(
        "relay_consumer_handled_total",
        "Total number of deliveries handled and recorded in the inbox"
    );
    describe_counter!(
        "relay_consumer_handler_failures_total",
        "Total number of deliveries left unacknowledged after a failure"
    );

    // Scheduled jobs
    describe_counter!(
        "relay_jobs_processed_total",
        "Total number of jobs whose work was enqueued"
    );
    describe_counter!(
        "relay_jobs_retried_total",
        "Total number of failed job attempts scheduled for retry"
    );
    describe_counter!(
        "relay_jobs_dead_lettered_total",
        "Total number of jobs that exhausted their attempts"
    );
    describe_histogram!(
        "relay_jobs_batch_duration_seconds",
        "Time taken to process a job batch"
    );

    // Idempotency
    describe_counter!(
        "relay_idempotency_replays_total",
        "Total number of requests answered from a stored response"
    );
}

/// Outbox publisher metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a published batch.
    pub fn record_batch(count: usize, duration: Duration) {
        counter!("relay_outbox_published_total").increment(count as u64);
        histogram!("relay_outbox_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rolled back batch.
    pub fn record_failure() {
        counter!("relay_outbox_publish_failures_total").increment(1);
    }
}

/// Event consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a handled delivery.
    pub fn record_handled() {
        counter!("relay_consumer_handled_total").increment(1);
    }

    /// Record a duplicate delivery.
    pub fn record_duplicate() {
        counter!("relay_inbox_duplicates_total").increment(1);
    }

    /// Record a failed delivery.
    pub fn record_failure() {
        counter!("relay_consumer_handler_failures_total").increment(1);
    }
}

/// Job worker metrics recorder.
pub struct JobMetrics;

impl JobMetrics {
    /// Record a committed batch.
    pub fn record_batch(processed: usize, retried: usize, dead_lettered: usize, duration: Duration) {
        counter!("relay_jobs_processed_total").increment(processed as u64);
        counter!("relay_jobs_retried_total").increment(retried as u64);
        counter!("relay_jobs_dead_lettered_total").increment(dead_lettered as u64);
        histogram!("relay_jobs_batch_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Idempotency metrics recorder.
pub struct IdempotencyMetrics;

impl IdempotencyMetrics {
    /// Record a replayed response.
    pub fn record_replay() {
        counter!("relay_idempotency_replays_total").increment(1);
    }
}

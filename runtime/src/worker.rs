//! Scheduled job worker: turns due jobs into outbox events.
//!
//! # Pattern: Claim-Enqueue-Settle
//!
//! ```text
//! every poll_interval:
//!     begin
//!     jobs = fetch_due(now, batch_size)           -- skip-locked
//!     for job in jobs:
//!         savepoint
//!         outbox.insert(handler.due_event(job))   -- fails: rollback to savepoint
//!     mark_processed(succeeded)
//!     for failed job:
//!         record_failure(attempts + 1, next_run_at = now + backoff)
//!         reached max_attempts: outbox.insert(handler.dead_letter_event(job))
//!     commit
//! ```
//!
//! Everything a batch does lands in one commit. A crash before the commit
//! leaves every job as it was, so a dead-letter event is written exactly when
//! the failed status is, and never again afterwards.

use crate::metrics::JobMetrics;
use chrono::{DateTime, Utc};
use relay_core::environment::{Clock, SystemClock};
use relay_core::jobs::{BackoffPolicy, JobFailure, JobStore, ScheduledJob};
use relay_core::outbox::{NewOutboxEvent, OutboxStore};
use relay_core::store::StoreError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const JOB_SAVEPOINT: &str = "job_step";

/// Errors that abort a whole batch. Nothing was committed.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The store failed outside a single job's enqueue step.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The dead-letter event of an exhausted job could not be built.
    #[error("Failed to build dead-letter event for job {job_id}: {reason}")]
    DeadLetter {
        /// Job that exhausted its attempts
        job_id: i64,
        /// Handler error
        reason: String,
    },
}

/// Builds the outbox events for a job.
pub trait JobHandler: Send + Sync {
    /// The event describing the job's work, enqueued when the job is due.
    ///
    /// # Errors
    ///
    /// An error counts as a failed attempt.
    fn due_event(&self, job: &ScheduledJob) -> Result<NewOutboxEvent, String>;

    /// The event announcing that the job exhausted its attempts.
    ///
    /// # Errors
    ///
    /// An error aborts the batch; the job is retried on the next tick.
    fn dead_letter_event(
        &self,
        job: &ScheduledJob,
        failure: &JobFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<NewOutboxEvent, String>;
}

/// Worker settings.
///
/// # Default Values
///
/// - `poll_interval`: 2 seconds
/// - `batch_size`: 50
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Maximum jobs per batch
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 50,
        }
    }
}

impl WorkerConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Outcome counts of one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Jobs whose due event was enqueued
    pub processed: usize,
    /// Jobs left pending for another attempt
    pub retried: usize,
    /// Jobs moved to failed with a dead-letter event
    pub dead_lettered: usize,
}

impl BatchReport {
    /// Jobs claimed by the batch.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.processed + self.retried + self.dead_lettered
    }
}

/// Background task processing due jobs.
pub struct JobWorker<S> {
    store: Arc<S>,
    handler: Arc<dyn JobHandler>,
    backoff: Arc<dyn BackoffPolicy>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl<S> JobWorker<S>
where
    S: JobStore + OutboxStore + 'static,
{
    /// Create a worker using the system clock and default settings.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        handler: Arc<dyn JobHandler>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            store,
            handler,
            backoff,
            clock: Arc::new(SystemClock),
            config: WorkerConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the clock deciding which jobs are due.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Process one batch of due jobs.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the batch could not be committed; every
    /// claimed job is left unchanged.
    pub async fn process_batch(&self) -> Result<BatchReport, WorkerError> {
        let started = Instant::now();
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let jobs = self
            .store
            .fetch_due(&mut tx, now, self.config.batch_size)
            .await?;
        if jobs.is_empty() {
            self.store.rollback(tx).await?;
            return Ok(BatchReport::default());
        }

        let mut processed = Vec::with_capacity(jobs.len());
        let mut failures = Vec::new();
        for job in &jobs {
            self.store.savepoint(&mut tx, JOB_SAVEPOINT).await?;
            match self.enqueue_due_event(&mut tx, job).await {
                Ok(()) => processed.push(job.id),
                Err(reason) => {
                    self.store
                        .rollback_to_savepoint(&mut tx, JOB_SAVEPOINT)
                        .await?;
                    failures.push((job, job.failure_transition(now, &*self.backoff, reason)));
                }
            }
            self.store.release_savepoint(&mut tx, JOB_SAVEPOINT).await?;
        }

        if !processed.is_empty() {
            self.store.mark_processed(&mut tx, &processed, now).await?;
        }

        let mut report = BatchReport {
            processed: processed.len(),
            ..BatchReport::default()
        };
        for (job, failure) in &failures {
            self.store.record_failure(&mut tx, failure, now).await?;
            if failure.is_dead_letter() {
                self.enqueue_dead_letter(&mut tx, job, failure, now).await?;
                report.dead_lettered += 1;
                error!(
                    job_id = job.id,
                    job_key = %job.idempotency_key,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "Job exhausted its attempts, dead-lettered"
                );
            } else {
                report.retried += 1;
                warn!(
                    job_id = job.id,
                    job_key = %job.idempotency_key,
                    attempts = failure.attempts,
                    max_attempts = job.max_attempts,
                    next_run_at = %failure.next_run_at,
                    error = %failure.last_error,
                    "Job attempt failed, scheduled for retry"
                );
            }
        }

        self.store.commit(tx).await?;

        JobMetrics::record_batch(
            report.processed,
            report.retried,
            report.dead_lettered,
            started.elapsed(),
        );
        debug!(
            processed = report.processed,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "Processed job batch"
        );
        Ok(report)
    }

    async fn enqueue_due_event(&self, tx: &mut S::Tx, job: &ScheduledJob) -> Result<(), String> {
        let mut event = self.handler.due_event(job)?;
        if event.trace.is_empty() {
            event.trace = job.trace.clone();
        }
        event
            .dedup_key
            .get_or_insert_with(|| format!("job:{}:due", job.id));

        self.store
            .insert_event(tx, &event)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn enqueue_dead_letter(
        &self,
        tx: &mut S::Tx,
        job: &ScheduledJob,
        failure: &JobFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        let mut event = self
            .handler
            .dead_letter_event(job, failure, failed_at)
            .map_err(|reason| WorkerError::DeadLetter {
                job_id: job.id,
                reason,
            })?;
        if event.trace.is_empty() {
            event.trace = job.trace.clone();
        }
        event
            .dedup_key
            .get_or_insert_with(|| format!("job:{}:dead-letter", job.id));

        self.store.insert_event(tx, &event).await?;
        Ok(())
    }

    /// Spawn the worker as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()>
    where
        S::Tx: 'static,
    {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Poll until the shutdown signal.
    ///
    /// A batch interrupted by shutdown is dropped and its transaction rolls
    /// back.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Job worker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Job worker interrupted, batch rolled back");
                    break;
                }
                result = self.process_batch() => {
                    if let Err(e) = result {
                        error!(error = %e, "Job batch failed, retrying next tick");
                    }
                }
            }
        }

        info!("Job worker stopped");
    }
}

//! Scheduled job queue: records, state machine and store contract.
//!
//! ```text
//!            enqueue ok
//! pending ────────────────► processed
//!    │  ▲
//!    │  │ enqueue failed, attempts < max
//!    ├──┘
//!    │ enqueue failed, attempts == max
//!    └────────────────────► failed  (one dead-letter event)
//! ```

use crate::store::{Admission, StoreError, Transactional};
use crate::trace_context::TraceContext;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Status of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for `next_run_at`
    Pending,
    /// Work was enqueued (terminal)
    Processed,
    /// Retries exhausted (terminal)
    Failed,
}

impl JobStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidData`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::InvalidData(format!("Invalid job status: {s}"))),
        }
    }

    /// Returns `true` for `processed` and `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Delay before the next attempt of a failed job.
pub trait BackoffPolicy: Send + Sync {
    /// Delay after the given number of failed attempts (starting at 1).
    fn delay(&self, attempts: u32) -> Duration;
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledJob {
    /// Caller-defined composite key; duplicates collapse to one row.
    pub idempotency_key: String,
    /// Job payload.
    pub payload: Value,
    /// First time the job is due.
    pub run_at: DateTime<Utc>,
    /// Attempts before the job is dead-lettered.
    pub max_attempts: u32,
    /// Trace context of the request that scheduled the job.
    pub trace: TraceContext,
}

impl NewScheduledJob {
    /// Create a job due at `run_at`.
    #[must_use]
    pub fn new(
        idempotency_key: impl Into<String>,
        payload: Value,
        run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            payload,
            run_at,
            max_attempts: max_attempts.max(1),
            trace: TraceContext::empty(),
        }
    }

    /// Attach the scheduling request's trace context.
    #[must_use]
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    /// Row id.
    pub id: i64,
    /// Caller-defined composite key.
    pub idempotency_key: String,
    /// Job payload.
    pub payload: Value,
    /// Current status.
    pub status: JobStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempts before the job is dead-lettered.
    pub max_attempts: u32,
    /// Earliest time of the next attempt.
    pub next_run_at: DateTime<Utc>,
    /// Error of the latest failed attempt.
    pub last_error: Option<String>,
    /// Trace context of the request that scheduled the job.
    pub trace: TraceContext,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Returns `true` if the job is pending and `next_run_at` has passed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at <= now
    }

    /// The state change for a failed attempt at `now`.
    ///
    /// The attempt counter is incremented. Reaching `max_attempts` moves the
    /// job to [`JobStatus::Failed`]; otherwise it stays pending and is due
    /// again after the backoff delay.
    #[must_use]
    pub fn failure_transition(
        &self,
        now: DateTime<Utc>,
        backoff: &dyn BackoffPolicy,
        error: impl Into<String>,
    ) -> JobFailure {
        let attempts = self.attempts.saturating_add(1);
        let status = if attempts >= self.max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };
        let delay = TimeDelta::from_std(backoff.delay(attempts)).unwrap_or(TimeDelta::MAX);

        JobFailure {
            job_id: self.id,
            attempts,
            status,
            next_run_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_error: error.into(),
        }
    }

    /// Apply a failure transition to this in-memory copy.
    pub fn apply_failure(&mut self, failure: &JobFailure, now: DateTime<Utc>) {
        self.attempts = failure.attempts;
        self.status = failure.status;
        self.next_run_at = failure.next_run_at;
        self.last_error = Some(failure.last_error.clone());
        self.updated_at = now;
    }
}

/// State written for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Job row id.
    pub job_id: i64,
    /// New attempt count.
    pub attempts: u32,
    /// New status, `Pending` or `Failed`.
    pub status: JobStatus,
    /// Next attempt time.
    pub next_run_at: DateTime<Utc>,
    /// Error of this attempt.
    pub last_error: String,
}

impl JobFailure {
    /// Returns `true` if this failure exhausted the job's attempts.
    #[must_use]
    pub fn is_dead_letter(&self) -> bool {
        self.status == JobStatus::Failed
    }
}

/// Job table access.
pub trait JobStore: Transactional {
    /// Enqueue a job. A job with the same idempotency key yields
    /// [`Admission::Duplicate`] and leaves the existing row untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be written.
    fn insert_job(
        &self,
        tx: &mut Self::Tx,
        job: &NewScheduledJob,
    ) -> impl Future<Output = Result<Admission<i64>, StoreError>> + Send;

    /// Claim up to `limit` pending jobs with `next_run_at <= now`, earliest first.
    ///
    /// Claimed jobs are skipped by concurrent callers until `tx` ends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rows cannot be read.
    fn fetch_due(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScheduledJob>, StoreError>> + Send;

    /// Move the given jobs to `processed`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_processed(
        &self,
        tx: &mut Self::Tx,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn record_failure(
        &self,
        tx: &mut Self::Tx,
        failure: &JobFailure,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    struct Fixed(Duration);

    impl BackoffPolicy for Fixed {
        fn delay(&self, _attempts: u32) -> Duration {
            self.0
        }
    }

    fn job(max_attempts: u32) -> ScheduledJob {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default();
        ScheduledJob {
            id: 1,
            idempotency_key: "appt-1|2025-01-01T00:00:00Z|sms".to_string(),
            payload: serde_json::json!({}),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_run_at: t0,
            last_error: None,
            trace: TraceContext::empty(),
            created_at: t0,
            updated_at: t0,
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [JobStatus::Pending, JobStatus::Processed, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()), Ok(status));
        }
        assert!(JobStatus::parse("running").is_err());
    }

    #[test]
    fn failure_below_max_stays_pending() {
        let job = job(3);
        let now = job.next_run_at;
        let failure = job.failure_transition(now, &Fixed(Duration::from_secs(60)), "boom");

        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.status, JobStatus::Pending);
        assert_eq!(failure.next_run_at, now + TimeDelta::seconds(60));
        assert!(!failure.is_dead_letter());
    }

    #[test]
    fn failure_reaching_max_dead_letters() {
        let mut job = job(3);
        job.attempts = 2;
        let failure = job.failure_transition(job.next_run_at, &Fixed(Duration::ZERO), "boom");

        assert_eq!(failure.attempts, 3);
        assert!(failure.is_dead_letter());
    }

    #[test]
    fn huge_backoff_saturates() {
        let job = job(3);
        let failure = job.failure_transition(job.next_run_at, &Fixed(Duration::MAX), "boom");
        assert_eq!(failure.next_run_at, DateTime::<Utc>::MAX_UTC);
    }

    proptest! {
        #[test]
        fn pending_until_exactly_max_attempts(max_attempts in 1u32..10, backoff_secs in 1u64..3600) {
            let mut job = job(max_attempts);
            let backoff = Fixed(Duration::from_secs(backoff_secs));
            let mut dead_letters = 0;

            for attempt in 1..=max_attempts {
                let now = job.next_run_at;
                let failure = job.failure_transition(now, &backoff, "boom");
                prop_assert_eq!(failure.attempts, attempt);
                if failure.is_dead_letter() {
                    dead_letters += 1;
                    prop_assert_eq!(attempt, max_attempts);
                } else {
                    prop_assert!(failure.attempts < max_attempts);
                    prop_assert_eq!(
                        failure.next_run_at - now,
                        TimeDelta::seconds(i64::try_from(backoff_secs).unwrap_or(i64::MAX))
                    );
                }
                job.apply_failure(&failure, now);
            }

            prop_assert_eq!(dead_letters, 1);
            prop_assert_eq!(job.status, JobStatus::Failed);
            prop_assert!(!job.is_due(job.next_run_at));
        }
    }
}

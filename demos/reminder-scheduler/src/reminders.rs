//! Reminder requests in, due reminders and dead letters out.
//!
//! A `booking.reminder.requested.v1` message becomes one scheduled job keyed
//! by `appointment_id|remind_at|channel`. When the job is due the worker
//! enqueues `scheduler.reminder.due.v1`; a job that keeps failing ends as one
//! `scheduler.reminder.dlq.v1`.

use chrono::{DateTime, SecondsFormat, Utc};
use relay_core::inbox::{HandlerError, MessageHandler};
use relay_core::jobs::{JobFailure, JobStore, NewScheduledJob, ScheduledJob};
use relay_core::message::{EventMeta, InboundMessage};
use relay_core::outbox::NewOutboxEvent;
use relay_core::store::Admission;
use relay_core::trace_context::TraceContext;
use relay_runtime::JobHandler;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Topic carrying reminder requests from the booking service.
pub const REMINDER_REQUESTED: &str = "booking.reminder.requested.v1";

/// Event type announcing a reminder that is due.
pub const REMINDER_DUE: &str = "scheduler.reminder.due.v1";

/// Event type announcing a reminder that could not be scheduled.
pub const REMINDER_DLQ: &str = "scheduler.reminder.dlq.v1";

/// Aggregate type of the scheduler's outbox events.
pub const AGGREGATE_TYPE: &str = "scheduler_job";

/// Why a reminder request was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidReminder {
    /// The payload is not the expected JSON object.
    #[error("Malformed reminder request: {0}")]
    Malformed(String),

    /// A required field is empty.
    #[error("Reminder request is missing {0}")]
    MissingField(&'static str),

    /// `remind_at` is not an RFC 3339 timestamp.
    #[error("Invalid remind_at: {0}")]
    InvalidRemindAt(String),
}

/// A reminder request as published by the booking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRequest {
    /// Appointment to remind about
    #[serde(default)]
    pub appointment_id: String,
    /// Owning business
    #[serde(default)]
    pub business_id: String,
    /// Delivery channel (`email`, `sms`, ...)
    #[serde(default)]
    pub channel: String,
    /// Channel-specific address
    #[serde(default)]
    pub recipient: String,
    /// When to send the reminder (RFC 3339)
    #[serde(default)]
    pub remind_at: String,
    /// Values for the notification template
    #[serde(default)]
    pub template_data: Map<String, Value>,
}

impl ReminderRequest {
    /// Decode and validate a request payload.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidReminder`] if the payload is not JSON, a required
    /// field is empty or `remind_at` does not parse.
    pub fn decode(payload: &[u8]) -> Result<Self, InvalidReminder> {
        let request: Self = serde_json::from_slice(payload)
            .map_err(|e| InvalidReminder::Malformed(e.to_string()))?;
        request.remind_at()?;
        Ok(request)
    }

    /// The validated reminder time.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidReminder`] if a required field is empty or
    /// `remind_at` does not parse.
    pub fn remind_at(&self) -> Result<DateTime<Utc>, InvalidReminder> {
        for (name, value) in [
            ("appointment_id", &self.appointment_id),
            ("business_id", &self.business_id),
            ("channel", &self.channel),
            ("recipient", &self.recipient),
            ("remind_at", &self.remind_at),
        ] {
            if value.is_empty() {
                return Err(InvalidReminder::MissingField(name));
            }
        }

        DateTime::parse_from_rfc3339(&self.remind_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| InvalidReminder::InvalidRemindAt(format!("{}: {e}", self.remind_at)))
    }

    /// Deduplication key of the job: `appointment_id|remind_at|channel`.
    #[must_use]
    pub fn job_key(&self) -> String {
        format!("{}|{}|{}", self.appointment_id, self.remind_at, self.channel)
    }

    /// The job to schedule, first due at `remind_at`.
    ///
    /// The stored payload carries `remind_at` normalized to UTC.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidReminder`] if the request does not validate.
    pub fn to_job(&self, max_attempts: u32) -> Result<NewScheduledJob, InvalidReminder> {
        let remind_at = self.remind_at()?;
        let mut normalized = self.clone();
        normalized.remind_at = remind_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let payload = serde_json::to_value(&normalized)
            .map_err(|e| InvalidReminder::Malformed(e.to_string()))?;

        Ok(NewScheduledJob::new(self.job_key(), payload, remind_at, max_attempts))
    }
}

/// Schedules a job for every reminder request.
///
/// Malformed requests are logged and acknowledged: redelivering them would
/// never succeed.
pub struct ReminderRequestHandler<S> {
    store: Arc<S>,
    max_attempts: u32,
}

impl<S> ReminderRequestHandler<S> {
    /// Create a handler scheduling jobs with `max_attempts` attempts.
    #[must_use]
    pub const fn new(store: Arc<S>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts,
        }
    }
}

impl<S: JobStore> MessageHandler<S> for ReminderRequestHandler<S> {
    async fn handle(&self, tx: &mut S::Tx, message: &InboundMessage) -> Result<(), HandlerError> {
        let meta = EventMeta::from_message(message);

        let job = match ReminderRequest::decode(&message.payload)
            .and_then(|request| request.to_job(self.max_attempts))
        {
            Ok(job) => job.with_trace(TraceContext::from_headers(&message.headers)),
            Err(e) => {
                error!(event_id = %meta.event_id, error = %e, "Dropping invalid reminder request");
                return Ok(());
            }
        };

        match self.store.insert_job(tx, &job).await? {
            Admission::Admitted(job_id) => info!(
                event_id = %meta.event_id,
                job_id,
                job_key = %job.idempotency_key,
                run_at = %job.run_at,
                "Reminder scheduled"
            ),
            Admission::Duplicate => debug!(
                event_id = %meta.event_id,
                job_key = %job.idempotency_key,
                "Reminder already scheduled"
            ),
        }
        Ok(())
    }
}

/// Builds the due and dead-letter events of reminder jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReminderJobHandler;

fn appointment_id(job: &ScheduledJob) -> Option<&str> {
    job.payload
        .get("appointment_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

impl JobHandler for ReminderJobHandler {
    fn due_event(&self, job: &ScheduledJob) -> Result<NewOutboxEvent, String> {
        let Value::Object(fields) = &job.payload else {
            return Err(format!("job {} payload is not an object", job.id));
        };
        let appointment_id =
            appointment_id(job).ok_or_else(|| format!("job {} payload has no appointment_id", job.id))?;
        NewOutboxEvent::json(AGGREGATE_TYPE, appointment_id, REMINDER_DUE, fields)
            .map_err(|e| e.to_string())
    }

    /// Never rejects a payload: a job that could not be enqueued because its
    /// payload is broken still gets its dead letter.
    fn dead_letter_event(
        &self,
        job: &ScheduledJob,
        _failure: &JobFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<NewOutboxEvent, String> {
        let mut fields = match &job.payload {
            Value::Object(fields) => fields.clone(),
            other => Map::from_iter([("payload".to_string(), other.clone())]),
        };
        fields.insert("error_reason".to_string(), Value::from("max attempts reached"));
        fields.insert(
            "failed_at".to_string(),
            Value::from(failed_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        let aggregate_id = appointment_id(job).map_or_else(|| job.id.to_string(), str::to_string);
        NewOutboxEvent::json(AGGREGATE_TYPE, aggregate_id, REMINDER_DLQ, &fields)
            .map_err(|e| e.to_string())
    }
}

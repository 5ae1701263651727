//! Reminder requests flowing through inbox, job queue, outbox and bus.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::{DateTime, TimeDelta, Utc};
use relay_core::event_bus::EventBus;
use relay_core::jobs::{JobStatus, JobStore, NewScheduledJob};
use relay_core::message::{EVENT_ID_HEADER, InboundMessage};
use relay_core::store::Transactional;
use relay_runtime::{
    EventConsumer, FixedBackoff, Handled, JobWorker, OutboxPublisher,
};
use relay_testing::{InMemoryEventBus, InMemoryStore, ManualClock};
use reminder_scheduler::reminders::{REMINDER_DLQ, REMINDER_DUE, REMINDER_REQUESTED};
use reminder_scheduler::{ReminderJobHandler, ReminderRequestHandler};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2030-05-01T07:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

struct Service {
    store: InMemoryStore,
    bus: InMemoryEventBus,
    clock: ManualClock,
    consumer: EventConsumer<InMemoryStore, ReminderRequestHandler<InMemoryStore>>,
    worker: JobWorker<InMemoryStore>,
    publisher: OutboxPublisher<InMemoryStore>,
    _shutdown: broadcast::Sender<()>,
}

impl Service {
    fn new(max_attempts: u32) -> Self {
        let clock = ManualClock::new(start());
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let bus = InMemoryEventBus::new();
        let shared = Arc::new(store.clone());
        let dyn_bus: Arc<dyn EventBus> = Arc::new(bus.clone());
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let consumer = EventConsumer::new(
            "reminder-requests",
            vec![REMINDER_REQUESTED.to_string()],
            Arc::clone(&dyn_bus),
            Arc::clone(&shared),
            Arc::new(ReminderRequestHandler::new(Arc::clone(&shared), max_attempts)),
            shutdown_rx,
        );
        let worker = JobWorker::new(
            Arc::clone(&shared),
            Arc::new(ReminderJobHandler),
            Arc::new(FixedBackoff::new(Duration::from_secs(60))),
        )
        .with_clock(Arc::new(clock.clone()));
        let publisher = OutboxPublisher::new(shared, Some(dyn_bus));

        Self {
            store,
            bus,
            clock,
            consumer,
            worker,
            publisher,
            _shutdown: shutdown,
        }
    }
}

fn request(event_id: &str, payload: &Value) -> InboundMessage {
    InboundMessage::new(REMINDER_REQUESTED, payload.to_string().into_bytes())
        .with_key("A1")
        .with_header(EVENT_ID_HEADER, event_id)
        .with_header("traceparent", TRACEPARENT)
}

fn reminder() -> Value {
    json!({
        "appointment_id": "A1",
        "business_id": "B1",
        "channel": "email",
        "recipient": "ada@example.com",
        "remind_at": "2030-05-01T10:00:00+02:00",
        "template_data": { "service": "haircut" },
    })
}

#[tokio::test]
async fn reminder_request_is_published_as_due_event_at_remind_at() {
    let service = Service::new(5);

    let handled = service
        .consumer
        .handle_message(&request("E1", &reminder()))
        .await
        .unwrap();
    assert_eq!(handled, Handled::Processed);

    let jobs = service.store.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].idempotency_key, "A1|2030-05-01T10:00:00+02:00|email");
    assert_eq!(jobs[0].trace.traceparent.as_deref(), Some(TRACEPARENT));

    // 07:00 UTC: not due yet.
    assert_eq!(service.worker.process_batch().await.unwrap().total(), 0);

    service.clock.advance(TimeDelta::hours(1));
    assert_eq!(service.worker.process_batch().await.unwrap().processed, 1);
    assert_eq!(service.publisher.publish_batch().await.unwrap(), 1);

    let due = service.bus.published_to(REMINDER_DUE);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].key, b"A1".to_vec());
    let payload: Value = serde_json::from_slice(&due[0].payload).unwrap();
    assert_eq!(payload["appointment_id"], "A1");
    assert_eq!(payload["business_id"], "B1");
    assert_eq!(payload["recipient"], "ada@example.com");
    assert_eq!(payload["remind_at"], "2030-05-01T08:00:00Z");
    assert_eq!(payload["template_data"]["service"], "haircut");

    let outbox = service.store.outbox_of_type(REMINDER_DUE);
    assert_eq!(outbox[0].aggregate_type, "scheduler_job");
    assert_eq!(outbox[0].aggregate_id, "A1");
}

#[tokio::test]
async fn repeated_requests_schedule_one_job() {
    let service = Service::new(5);

    // Same event redelivered, then a new event for the same reminder.
    service.consumer.handle_message(&request("E1", &reminder())).await.unwrap();
    let again = service
        .consumer
        .handle_message(&request("E1", &reminder()))
        .await
        .unwrap();
    service.consumer.handle_message(&request("E2", &reminder())).await.unwrap();

    assert_eq!(again, Handled::Duplicate);
    assert_eq!(service.store.inbox().len(), 2);
    assert_eq!(service.store.jobs().len(), 1);
}

#[tokio::test]
async fn malformed_requests_are_consumed_without_a_job() {
    let service = Service::new(5);

    let mut missing_channel = reminder();
    missing_channel["channel"] = json!("");

    for (event_id, payload) in [
        ("E1", b"{not json".to_vec()),
        ("E2", missing_channel.to_string().into_bytes()),
    ] {
        let message = InboundMessage::new(REMINDER_REQUESTED, payload)
            .with_header(EVENT_ID_HEADER, event_id);
        let handled = service.consumer.handle_message(&message).await.unwrap();
        assert_eq!(handled, Handled::Processed);
    }

    assert!(service.store.jobs().is_empty());
    assert_eq!(service.store.inbox().len(), 2);
}

#[tokio::test]
async fn job_with_broken_payload_is_dead_lettered_after_max_attempts() {
    let service = Service::new(3);

    let job = NewScheduledJob::new("broken|job|email", json!({ "channel": "email" }), start(), 3);
    let mut tx = service.store.begin().await.unwrap();
    let id = service
        .store
        .insert_job(&mut tx, &job)
        .await
        .unwrap()
        .admitted()
        .unwrap();
    service.store.commit(tx).await.unwrap();

    for attempt in 1..=3u32 {
        let report = service.worker.process_batch().await.unwrap();
        assert_eq!(report.total(), 1, "attempt {attempt}");
        service.clock.advance(TimeDelta::seconds(60));
    }
    assert_eq!(service.worker.process_batch().await.unwrap().total(), 0);

    let job = service.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);

    let dead = service.store.outbox_of_type(REMINDER_DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].aggregate_id, id.to_string());
    let payload: Value = serde_json::from_slice(&dead[0].payload).unwrap();
    assert_eq!(payload["channel"], "email");
    assert_eq!(payload["error_reason"], "max attempts reached");
    assert!(payload["failed_at"].as_str().unwrap().ends_with('Z'));
    assert!(service.store.outbox_of_type(REMINDER_DUE).is_empty());
}

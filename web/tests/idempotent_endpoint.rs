//! A booking endpoint guarded by `Idempotency-Key`, driven through the router.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use relay_core::outbox::{NewOutboxEvent, OutboxStore};
use relay_runtime::{Completion, IdempotencyExecutor, IdempotentOperation};
use relay_testing::{InMemoryStore, InMemoryTx};
use relay_web::{AppError, IDEMPOTENCY_KEY_HEADER, IdempotencyKey, REPLAYED_HEADER};
use relay_web::{json_response, outcome_response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tower::ServiceExt;

#[derive(Clone)]
struct AppState {
    store: InMemoryStore,
    executor: IdempotencyExecutor<InMemoryStore>,
    next_id: Arc<AtomicU32>,
    payments_down: Arc<AtomicBool>,
}

#[derive(Deserialize)]
struct BookRequest {
    slot: String,
}

struct BookAppointment {
    store: InMemoryStore,
    business_id: String,
    id: String,
    slot: String,
    payments_down: bool,
}

impl IdempotentOperation<InMemoryStore> for BookAppointment {
    type Error = AppError;

    async fn execute(self, tx: &mut InMemoryTx) -> Result<Completion, AppError> {
        let taken = self
            .store
            .records("appointments")
            .iter()
            .any(|(_, appointment)| appointment["slot"] == self.slot.as_str());
        if taken {
            let body = json_response(StatusCode::UNPROCESSABLE_ENTITY, &json!({ "error": "slot taken" }))?;
            return Ok(Completion::Finalize(body));
        }

        let appointment = json!({
            "id": &self.id,
            "business_id": &self.business_id,
            "slot": &self.slot,
        });
        self.store
            .put_record(tx, "appointments", &self.id, appointment.clone());
        let event = NewOutboxEvent::json(
            "appointment",
            &self.id,
            "booking.appointment.booked.v1",
            &appointment,
        )?;
        self.store.insert_event(tx, &event).await?;

        if self.payments_down {
            let body = json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "error": "payments unavailable" }),
            )?;
            return Ok(Completion::LeaveUnfinalized(body));
        }

        let body = json_response(StatusCode::CREATED, &json!({ "id": &self.id }))?;
        Ok(Completion::Finalize(body.with_resource_id(self.id)))
    }
}

async fn book(
    State(state): State<AppState>,
    Path(business_id): Path<String>,
    key: IdempotencyKey,
    Json(request): Json<BookRequest>,
) -> Result<Response, AppError> {
    let id = format!("appt-{}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let operation = BookAppointment {
        store: state.store.clone(),
        business_id: business_id.clone(),
        id,
        slot: request.slot,
        payments_down: state.payments_down.load(Ordering::SeqCst),
    };

    let outcome = state
        .executor
        .execute(&business_id, key.as_deref(), operation)
        .await?;
    Ok(outcome_response(outcome))
}

fn app() -> (Router, AppState) {
    let store = InMemoryStore::new();
    let state = AppState {
        executor: IdempotencyExecutor::new(Arc::new(store.clone())),
        store,
        next_id: Arc::new(AtomicU32::new(0)),
        payments_down: Arc::new(AtomicBool::new(false)),
    };
    let router = Router::new()
        .route("/businesses/:business_id/appointments", post(book))
        .with_state(state.clone());
    (router, state)
}

fn booking(key: Option<&str>, slot: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/businesses/biz-1/appointments")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
    }
    builder
        .body(Body::from(json!({ "slot": slot }).to_string()))
        .expect("valid request")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, bool, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let replayed = response.headers().contains_key(REPLAYED_HEADER);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, replayed, body)
}

#[tokio::test]
async fn retried_post_with_same_key_gets_identical_response() {
    let (router, state) = app();

    let (status1, replayed1, body1) = send(&router, booking(Some("K1"), "09:00")).await;
    let (status2, replayed2, body2) = send(&router, booking(Some("K1"), "09:00")).await;

    assert_eq!(status1, StatusCode::CREATED);
    assert_eq!(status2, StatusCode::CREATED);
    assert_eq!(body1, br#"{"id":"appt-1"}"#.to_vec());
    assert_eq!(body1, body2);
    assert!(!replayed1);
    assert!(replayed2);

    assert_eq!(state.store.records("appointments").len(), 1);
    assert_eq!(state.store.outbox().len(), 1);
    assert_eq!(
        state
            .store
            .idempotency_record("biz-1", "K1")
            .unwrap()
            .resource_id
            .as_deref(),
        Some("appt-1")
    );
}

#[tokio::test]
async fn requests_without_key_always_execute() {
    let (router, state) = app();

    let (first, _, _) = send(&router, booking(None, "09:00")).await;
    let (second, _, body) = send(&router, booking(None, "09:00")).await;

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(second, StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "slot taken");
    assert_eq!(state.store.records("appointments").len(), 1);
}

#[tokio::test]
async fn business_rejection_is_replayed() {
    let (router, state) = app();
    send(&router, booking(None, "09:00")).await;

    let (status1, _, body1) = send(&router, booking(Some("K2"), "09:00")).await;
    let (status2, replayed, body2) = send(&router, booking(Some("K2"), "09:00")).await;

    assert_eq!(status1, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(status2, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body1, body2);
    assert!(replayed);
    assert_eq!(
        state.store.idempotency_record("biz-1", "K2").unwrap().status_code,
        Some(422)
    );
}

#[tokio::test]
async fn dependency_failure_leaves_key_open_for_retry() {
    let (router, state) = app();
    state.payments_down.store(true, Ordering::SeqCst);

    let (status, _, _) = send(&router, booking(Some("K3"), "10:00")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(state.store.records("appointments").is_empty());
    assert!(state.store.outbox().is_empty());

    state.payments_down.store(false, Ordering::SeqCst);
    let (status, replayed, _) = send(&router, booking(Some("K3"), "10:00")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!replayed);
    assert_eq!(state.store.records("appointments").len(), 1);
    assert_eq!(state.store.outbox().len(), 1);
}

#[tokio::test]
async fn malformed_key_is_rejected_before_execution() {
    let (router, state) = app();
    let key = "k".repeat(256);

    let (status, _, body) = send(&router, booking(Some(&key), "09:00")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(state.store.records("appointments").is_empty());
}

#[tokio::test]
async fn concurrent_requests_with_same_key_create_one_resource() {
    let (router, state) = app();

    let (a, b) = tokio::join!(
        send(&router, booking(Some("K4"), "11:00")),
        send(&router, booking(Some("K4"), "11:00")),
    );

    assert_eq!(a.0, StatusCode::CREATED);
    assert_eq!(b.0, StatusCode::CREATED);
    assert_eq!(a.2, b.2);
    assert!(a.1 ^ b.1, "exactly one response is a replay");
    assert_eq!(state.store.records("appointments").len(), 1);
    assert_eq!(state.store.outbox().len(), 1);
}

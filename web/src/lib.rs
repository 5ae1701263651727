//! Axum integration for Relay's HTTP idempotency boundary, plus the
//! liveness and readiness routes of Relay services.
//!
//! A write endpoint reads the optional `Idempotency-Key` header, runs its
//! business logic through [`relay_runtime::IdempotencyExecutor`] and turns
//! the outcome into an HTTP response. A retry with the same key for the same
//! business receives the byte-identical status code and body.
//!
//! # Request Flow
//!
//! 1. **Extract** the key with [`IdempotencyKey`] (malformed keys are a 400)
//! 2. **Execute** the operation under the key
//! 3. **Respond** with [`outcome_response`], which replays stored outcomes
//!
//! # Example
//!
//! ```ignore
//! use axum::extract::{Path, State};
//! use relay_web::{AppError, IdempotencyKey, outcome_response};
//!
//! async fn book(
//!     State(state): State<AppState>,
//!     Path(business_id): Path<String>,
//!     key: IdempotencyKey,
//!     Json(request): Json<BookRequest>,
//! ) -> Result<Response, AppError> {
//!     let outcome = state
//!         .executor
//!         .execute(&business_id, key.as_deref(), BookAppointment::new(request))
//!         .await?;
//!     Ok(outcome_response(outcome))
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod health;
pub mod response;

pub use error::AppError;
pub use extractors::{IDEMPOTENCY_KEY_HEADER, IdempotencyKey, MAX_IDEMPOTENCY_KEY_LEN};
pub use health::{Readiness, ReadinessCheck, ReadinessReport, health_routes};
pub use response::{REPLAYED_HEADER, json_response, outcome_response, stored_response};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

//! Conversion of stored outcomes into HTTP responses.

use crate::error::AppError;
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use relay_core::idempotency::StoredResponse;
use relay_runtime::IdempotentOutcome;
use serde::Serialize;

/// Response header set to `true` when the body is a replay.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Build a [`StoredResponse`] with a JSON body.
///
/// # Errors
///
/// Returns a 500 [`AppError`] if `body` cannot be serialized.
pub fn json_response<T: Serialize>(
    status: StatusCode,
    body: &T,
) -> Result<StoredResponse, AppError> {
    let bytes = serde_json::to_vec(body).map_err(|e| {
        AppError::internal("Failed to serialize response").with_source(e.into())
    })?;
    Ok(StoredResponse::new(status.as_u16(), bytes))
}

/// Send a stored response verbatim: same status, same body bytes.
#[must_use]
pub fn stored_response(response: StoredResponse) -> Response {
    let Ok(status) = StatusCode::from_u16(response.status_code) else {
        return AppError::internal(format!(
            "Stored response has invalid status {}",
            response.status_code
        ))
        .into_response();
    };

    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(response.body),
    )
        .into_response()
}

/// Send the outcome of an idempotent execution, marking replays.
#[must_use]
pub fn outcome_response(outcome: IdempotentOutcome) -> Response {
    let replayed = outcome.is_replay();
    let mut response = stored_response(outcome.into_response());
    if replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    response
}

//! Error types for web handlers.
//!
//! [`AppError`] bridges store, operation and request errors to HTTP
//! responses through Axum's `IntoResponse`.
//!
//! Errors are never stored under an idempotency key: the transaction is
//! rolled back and a retry with the same key runs again. Deterministic
//! business rejections that should be replayed are returned as
//! [`Completion::Finalize`](relay_runtime::Completion) responses instead.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_core::store::StoreError;
use relay_runtime::IdempotencyError;
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// Renders as `{"code": ..., "message": ...}`. Server errors are logged with
/// their internal source, which is never sent to the client.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create an error with an explicit status and machine-readable code.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the internal cause.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// A malformed request (400), such as an invalid `Idempotency-Key`.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// A failure on our side (500).
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", message)
    }

    /// HTTP status of the error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            let source = self.source.as_ref().map(ToString::to_string);
            tracing::error!(
                status = %self.status,
                code = self.code,
                message = %self.message,
                source = source.as_deref().unwrap_or("none"),
                "Request failed"
            );
        }

        let body = ErrorBody {
            code: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::internal("An internal error occurred").with_source(anyhow::Error::new(err))
    }
}

impl<E> From<IdempotencyError<E>> for AppError
where
    E: Into<Self>,
{
    fn from(err: IdempotencyError<E>) -> Self {
        match err {
            IdempotencyError::Store(e) => e.into(),
            IdempotencyError::Operation(e) => e.into(),
        }
    }
}

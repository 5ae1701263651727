//! Custom Axum extractors.
//!
//! - [`IdempotencyKey`]: the optional `Idempotency-Key` request header
//!
//! # Examples
//!
//! ```ignore
//! use relay_web::IdempotencyKey;
//!
//! async fn handler(key: IdempotencyKey) -> String {
//!     format!("key: {:?}", key.as_deref())
//! }
//! ```

use crate::error::AppError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};

/// Request header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Longest accepted key, in characters.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Client-supplied idempotency key.
///
/// The header value is trimmed; a missing or blank header yields `None`.
/// Keys longer than [`MAX_IDEMPOTENCY_KEY_LEN`] or containing anything other
/// than visible ASCII are rejected with 400 Bad Request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdempotencyKey(pub Option<String>);

impl IdempotencyKey {
    /// The key, if the request carried one.
    #[must_use]
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parse_idempotency_key(&parts.headers).map(Self)
    }
}

fn parse_idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };

    let raw = std::str::from_utf8(value.as_bytes())
        .map_err(|_| AppError::bad_request("Idempotency-Key must be visible ASCII"))?;
    let key = raw.trim();

    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::bad_request(format!(
            "Idempotency-Key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AppError::bad_request("Idempotency-Key must be visible ASCII"));
    }

    Ok(Some(key.to_string()))
}

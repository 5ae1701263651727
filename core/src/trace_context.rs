//! W3C trace-context carrier.
//!
//! The trace context of the request that produced an event is captured as the
//! two W3C carrier strings (`traceparent`, `tracestate`), stored next to the
//! outbox row or scheduled job, and re-attached as message headers when the
//! event is finally published. Consumers read them back from the headers.

use crate::message::Headers;
use serde::{Deserialize, Serialize};

/// Header carrying the W3C `traceparent` value.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Header carrying the W3C `tracestate` value.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Stored trace-context carrier strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// W3C `traceparent` (`version-traceid-parentid-flags`).
    pub traceparent: Option<String>,
    /// W3C `tracestate` vendor list.
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Build a context from carrier strings. Empty strings count as absent.
    #[must_use]
    pub fn new(traceparent: impl Into<String>, tracestate: impl Into<String>) -> Self {
        Self {
            traceparent: non_empty(traceparent.into()),
            tracestate: non_empty(tracestate.into()),
        }
    }

    /// Context with no carrier values.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            traceparent: None,
            tracestate: None,
        }
    }

    /// Returns `true` when neither carrier string is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.traceparent.is_none() && self.tracestate.is_none()
    }

    /// Read the carrier strings back out of message headers.
    #[must_use]
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            traceparent: headers.get_str(TRACEPARENT_HEADER).map(str::to_string),
            tracestate: headers.get_str(TRACESTATE_HEADER).map(str::to_string),
        }
    }

    /// Write the carrier strings into message headers, replacing existing ones.
    pub fn inject(&self, headers: &mut Headers) {
        if let Some(traceparent) = &self.traceparent {
            headers.insert(TRACEPARENT_HEADER, traceparent.as_bytes());
        }
        if let Some(tracestate) = &self.tracestate {
            headers.insert(TRACESTATE_HEADER, tracestate.as_bytes());
        }
    }

    /// Trace id portion of a well-formed `traceparent`, for log correlation.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        let traceparent = self.traceparent.as_deref()?;
        let mut parts = traceparent.split('-');
        let _version = parts.next()?;
        let trace_id = parts.next()?;
        let is_hex = trace_id.len() == 32 && trace_id.bytes().all(|b| b.is_ascii_hexdigit());
        is_hex.then_some(trace_id)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

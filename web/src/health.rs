//! Liveness and readiness endpoints.
//!
//! `GET /healthz` answers as long as the process serves HTTP. `GET /readyz`
//! runs every registered [`ReadinessCheck`] concurrently, each bounded by a
//! timeout, and answers 503 if any of them fails.
//!
//! ```ignore
//! let readiness = Readiness::new()
//!     .with_check(ReadinessCheck::new("db", move || {
//!         let store = Arc::clone(&store);
//!         async move { store.ping().await }
//!     }));
//! let app = health_routes(readiness);
//! ```

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type CheckFn = dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync;

/// A named dependency check, such as a database ping.
#[derive(Clone)]
pub struct ReadinessCheck {
    name: String,
    check: Arc<CheckFn>,
}

impl ReadinessCheck {
    /// Create a check from a function returning a fresh future per request.
    #[must_use]
    pub fn new<F, Fut, E>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let check = move || -> BoxFuture<'static, Result<(), String>> {
            let future = check();
            Box::pin(async move { future.await.map_err(|e| e.to_string()) })
        };
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Name reported in the readiness body.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ReadinessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessCheck")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckStatus {
    /// Check name
    pub name: String,
    /// Whether the dependency answered in time
    pub ok: bool,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Readiness check response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    /// `true` when every check passed
    pub ready: bool,
    /// Per-check results, in registration order
    pub checks: Vec<CheckStatus>,
}

/// Liveness response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// The set of checks behind `GET /readyz`.
#[derive(Debug, Clone)]
pub struct Readiness {
    checks: Vec<ReadinessCheck>,
    timeout: Duration,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// No checks, 2 second timeout per check.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            checks: Vec::new(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Register a check.
    #[must_use]
    pub fn with_check(mut self, check: ReadinessCheck) -> Self {
        self.checks.push(check);
        self
    }

    /// Set how long each check may take.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run every check concurrently.
    pub async fn check(&self) -> ReadinessReport {
        let runs = self.checks.iter().map(|check| async move {
            let result = tokio::time::timeout(self.timeout, (check.check)()).await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(format!("no answer within {:?}", self.timeout)),
            };
            CheckStatus {
                name: check.name.clone(),
                ok: error.is_none(),
                error,
            }
        });
        let checks = join_all(runs).await;

        ReadinessReport {
            ready: checks.iter().all(|c| c.ok),
            checks,
        }
    }
}

/// Router serving `GET /healthz` and `GET /readyz`.
#[must_use]
pub fn health_routes(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness_check))
        .with_state(Arc::new(readiness))
}

#[allow(clippy::unused_async)]
async fn liveness() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

async fn readiness_check(
    State(readiness): State<Arc<Readiness>>,
) -> (StatusCode, Json<ReadinessReport>) {
    let report = readiness.check().await;
    if !report.ready {
        for failed in report.checks.iter().filter(|c| !c.ok) {
            tracing::warn!(
                check = %failed.name,
                error = failed.error.as_deref().unwrap_or_default(),
                "Readiness check failed"
            );
        }
    }

    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

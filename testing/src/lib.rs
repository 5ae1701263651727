//! # Relay Testing
//!
//! Testing utilities for the reliable event delivery core.
//!
//! This crate provides:
//! - [`InMemoryStore`]: every store contract, with real transaction, claiming
//!   and key-locking semantics, plus fault injection
//! - [`InMemoryEventBus`]: captures published messages, injects failures,
//!   redelivers unacknowledged deliveries
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - proptest strategies for failure schedules
//!
//! ## Example
//!
//! ```ignore
//! use relay_testing::{InMemoryEventBus, InMemoryStore, test_clock};
//!
//! #[tokio::test]
//! async fn publishes_committed_events() {
//!     let store = InMemoryStore::new();
//!     let bus = InMemoryEventBus::new();
//!     let publisher = OutboxPublisher::new(Arc::new(store.clone()), Some(Arc::new(bus.clone())));
//!
//!     // ... insert events, then:
//!     publisher.publish_batch().await?;
//!     assert!(store.unpublished().is_empty());
//! }
//! ```

use chrono::{DateTime, Utc};
use relay_core::environment::Clock;

pub mod event_bus;
pub mod store;

pub use event_bus::InMemoryEventBus;
pub use store::{Fault, InMemoryStore, InMemoryTx};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use relay_testing::mocks::FixedClock;
    /// use relay_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock moved by hand. Clones share the same time.
    ///
    /// ```
    /// use relay_testing::mocks::ManualClock;
    /// use relay_core::environment::Clock;
    /// use chrono::TimeDelta;
    ///
    /// let clock = ManualClock::default();
    /// let before = clock.now();
    /// clock.advance(TimeDelta::seconds(60));
    /// assert_eq!(clock.now() - before, TimeDelta::seconds(60));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::TimeDelta) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Outcome schedule for a sequence of attempts: `true` means the attempt
    /// fails. Failures always stop before the end of the schedule, so the
    /// last attempt succeeds.
    pub fn eventually_succeeds(max_failures: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 0..=max_failures).prop_map(|mut schedule| {
            schedule.push(false);
            schedule
        })
    }
}

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Output goes through the test harness writer so it only shows for failing
/// tests. The filter comes from `RUST_LOG`, defaulting to `debug` for the
/// relay crates.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relay_runtime=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};

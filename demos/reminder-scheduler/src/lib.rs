//! Reminder scheduling service.
//!
//! Consumes reminder requests exactly once through the inbox, stores them as
//! scheduled jobs and announces due reminders (or dead letters) through the
//! outbox. The binary in `main.rs` wires these pieces to Postgres and
//! Redpanda.

pub mod config;
pub mod reminders;

pub use config::{Config, ConfigError};
pub use reminders::{
    InvalidReminder, ReminderJobHandler, ReminderRequest, ReminderRequestHandler,
};

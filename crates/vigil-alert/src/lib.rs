//! Alert evaluation and notification scheduling.
//!
//! For every incoming snapshot the [`engine::AlertEngine`] extracts each
//! rule's metric ([`extract`]), averages it over the rule's window
//! ([`window`]) and applies asymmetric trigger/clear hysteresis
//! ([`hysteresis`]). Transitions are persisted, written to the audit trail
//! ([`history`]) and handed to a [`vigil_notify::NotificationSink`] without
//! waiting for delivery.
//!
//! Connectivity alerts take a separate path: a "down" report starts a grace
//! period in the [`status`] debounce worker and only fires if the system
//! stays down. Rules that remain triggered are re-notified by the
//! [`repeat`] scheduler.

pub mod engine;
pub mod error;
pub mod extract;
pub mod history;
pub mod hysteresis;
pub mod message;
pub mod repeat;
pub mod status;
pub mod window;

#[cfg(test)]
mod tests;

pub use engine::{AlertEngine, EngineConfig};
pub use error::AlertError;

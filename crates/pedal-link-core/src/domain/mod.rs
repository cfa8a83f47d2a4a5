//! Domain entities for Pedal-Link.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies: no MIDI backend, no async runtime, no file system.
//!
//! - [`connection`] – the connection status machine's data model: status,
//!   metrics, backoff policy, observability events and the folded snapshot.
//! - [`message_log`] – the bounded, filterable history of MIDI traffic.

pub mod connection;
pub mod message_log;

/// Milliseconds since the Unix epoch, or 0 if the system clock is before it.
pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

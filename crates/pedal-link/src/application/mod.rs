//! Application layer: the connection use cases.
//!
//! # What lives here?
//!
//! - **`connection_service`** – The connection state machine.  A single
//!   driver task owns the active `MidiTransport` and serializes connect,
//!   disconnect, reconnect, health checks and sends.  It publishes status,
//!   metrics, error and backoff events and records every send in the
//!   message log.
//!
//! - **`connection_store`** – Folds those events into an immutable
//!   `ConnectionSnapshot` that presentation layers read and subscribe to.

pub mod connection_service;
pub mod connection_store;

//! pedal-link library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does pedal-link do? (for beginners)
//!
//! Pedal-Link drives a delay/reverb pedal over MIDI.  The interesting part
//! is keeping that MIDI link healthy:
//!
//! 1. A transport opens a MIDI output, either directly through the OS MIDI
//!    API (`native`) or through a separate host process (`bridge`).
//! 2. Once connected, the connection service sends a lightweight probe every
//!    few seconds and measures its round trip.  A slow probe marks the link
//!    `degraded`; a failed one drops it.
//! 3. Failed and dropped links are retried with exponential backoff
//!    (1 s, 2 s, 4 s, 8 s, then every 15 s) until a connect succeeds or the
//!    user disconnects.
//! 4. Every message sent, and every message received on the optional input,
//!    lands in a bounded message log for display.

/// Application layer: connection service and store.
pub mod application;

/// Infrastructure layer: MIDI devices, transports, clock sender, inbound listener, config.
pub mod infrastructure;

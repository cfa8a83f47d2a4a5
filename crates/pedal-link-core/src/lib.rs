//! # pedal-link-core
//!
//! Shared library for Pedal-Link containing the connection data model, the
//! MIDI message log, and the byte-level MIDI helpers used by the transports.
//!
//! This crate has zero dependencies on OS APIs, MIDI backends, or an async
//! runtime, so everything in it is unit-testable on any platform.
//!
//! # Architecture overview
//!
//! Pedal-Link remote-controls a delay/reverb pedal over MIDI.  The piece
//! with real engineering depth is the connection layer: a state machine that
//! owns one MIDI output, pings it, classifies slow links as degraded and
//! reconnects with exponential backoff.  This crate holds the parts of that
//! layer that do not need I/O:
//!
//! - **`domain`** – connection status, metrics, backoff policy and the folded
//!   snapshot observers render; the capacity-bounded message log.
//! - **`midi`** – outbound message encoding, inbound decoding, clock follow.
//! - **`observe`** – typed publish/subscribe with unsubscribe tokens, and the
//!   snapshot-plus-subscribe contract shared by both stores.

pub mod domain;
pub mod midi;
pub mod observe;

// Re-export the most-used types at the crate root so callers can write
// `pedal_link_core::ConnectionStatus` instead of the full module path.
pub use domain::connection::{
    BackoffPolicy, BackoffState, ConnectionEvent, ConnectionMetrics, ConnectionSnapshot,
    ConnectionStatus,
};
pub use domain::message_log::{
    FilterKey, LogFilters, LogSnapshot, MessageLog, MidiDirection, MidiLogEntry, MidiMessageType,
    NewLogEntry, DEFAULT_LOG_CAPACITY,
};
pub use midi::messages::MidiMessage;
pub use observe::{ExternalStore, Listeners, Subscription};

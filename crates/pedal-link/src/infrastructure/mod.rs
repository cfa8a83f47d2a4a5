//! Infrastructure layer: MIDI backends, transports and settings.
//!
//! **Dependency rule**: this layer may depend on `pedal_link_core`, and the
//! transports implement the trait the application layer drives.  Nothing in
//! `pedal_link_core` imports from here.
//!
//! # Sub-modules
//!
//! - **`device`** – The `OutputDevice` seam over a MIDI output port, with a
//!   `midir` implementation and an in-memory `LoopbackDevice` for tests and
//!   demos.
//!
//! - **`transport`** – `MidiTransport` and its implementations: native
//!   (direct device access), bridge (JSON lines to a host process) and a
//!   scriptable mock.  Also host detection and transport selection.
//!
//! - **`clock_out`** – Sends MIDI clock (Start, Timing Clock ticks, Stop) to
//!   an output device at a given tempo.
//!
//! - **`inbound`** – Listens on a MIDI input and moves decoded messages into
//!   the message log.
//!
//! - **`storage`** – TOML configuration file.

pub mod clock_out;
pub mod device;
pub mod inbound;
pub mod storage;
pub mod transport;

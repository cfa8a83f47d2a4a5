//! MIDI byte-level helpers.
//!
//! - [`messages`] – outbound Control/Program Change encoding and validation.
//! - [`decode`] – classification of inbound messages for the message log.
//! - [`clock`] – tempo detection from inbound MIDI clock, outbound tick spacing.

pub mod clock;
pub mod decode;
pub mod messages;

pub use clock::{tick_interval, ClockFollower};
pub use decode::{decode_inbound, decode_status};
pub use messages::{hex_bytes, is_valid_midi_message, MidiMessage};

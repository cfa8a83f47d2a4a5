//! Outbound MIDI messages and byte-level validation.
//!
//! Channels are 1-based on the API (1-16, as printed on hardware) and
//! 0-based on the wire.  Out-of-range inputs are clamped rather than
//! rejected: channel 0 behaves as channel 1, and data bytes above 127 are
//! pinned to 127.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::message_log::{MidiDirection, MidiMessageType, NewLogEntry};

/// Control Change status nibble.
pub const CONTROL_CHANGE: u8 = 0xB0;
/// Program Change status nibble.
pub const PROGRAM_CHANGE: u8 = 0xC0;
/// System Exclusive start.
pub const SYSEX_START: u8 = 0xF0;
/// System Exclusive end.
pub const SYSEX_END: u8 = 0xF7;
/// Timing Clock (24 per quarter note).
pub const TIMING_CLOCK: u8 = 0xF8;
/// Start.
pub const START: u8 = 0xFA;
/// Continue.
pub const CONTINUE: u8 = 0xFB;
/// Stop.
pub const STOP: u8 = 0xFC;
/// Active Sensing, the liveness probe of choice.
pub const ACTIVE_SENSING: u8 = 0xFE;

/// Control number used by health probes that must go through the CC
/// primitive.  Sent with value 0 on channel 1.
pub const PROBE_CONTROL: u8 = 0;

/// A message the application sends to the pedal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiMessage {
    ControlChange { channel: u8, control: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    Realtime { status: u8 },
}

impl MidiMessage {
    pub fn control_change(channel: u8, control: u8, value: u8) -> Self {
        MidiMessage::ControlChange { channel, control, value }
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        MidiMessage::ProgramChange { channel, program }
    }

    /// The CC probe: `PROBE_CONTROL` = 0 on channel 1.
    pub fn probe() -> Self {
        MidiMessage::control_change(1, PROBE_CONTROL, 0)
    }

    /// Encodes the message for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            MidiMessage::ControlChange { channel, control, value } => {
                vec![CONTROL_CHANGE | wire_channel(channel), control.min(127), value.min(127)]
            }
            MidiMessage::ProgramChange { channel, program } => {
                vec![PROGRAM_CHANGE | wire_channel(channel), program.min(127)]
            }
            MidiMessage::Realtime { status } => vec![status],
        }
    }

    /// Log classification of this message.
    pub fn kind(&self) -> MidiMessageType {
        match self {
            MidiMessage::ControlChange { .. } => MidiMessageType::Cc,
            MidiMessage::ProgramChange { .. } => MidiMessageType::Pc,
            MidiMessage::Realtime { status } => match *status {
                TIMING_CLOCK | START | CONTINUE | STOP => MidiMessageType::Clock,
                _ => MidiMessageType::Other,
            },
        }
    }

    /// Builds the outbound log entry for this message.
    pub fn log_entry(&self, direction: MidiDirection) -> NewLogEntry {
        NewLogEntry::new(direction, self.kind(), self.to_string()).with_detail(hex_bytes(&self.to_bytes()))
    }
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::ControlChange { channel, control, value } => write!(
                f,
                "CC {} = {} (ch {})",
                control.min(127),
                value.min(127),
                display_channel(channel)
            ),
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "PC {} (ch {})", program.min(127), display_channel(channel))
            }
            MidiMessage::Realtime { status } => write!(f, "Realtime 0x{status:02x}"),
        }
    }
}

/// Clamps a 1-based channel into 1-16.
pub fn clamp_channel(channel: u8) -> u8 {
    channel.clamp(1, 16)
}

fn wire_channel(channel: u8) -> u8 {
    channel.saturating_sub(1) & 0x0F
}

fn display_channel(channel: u8) -> u8 {
    wire_channel(channel) + 1
}

/// Space-separated two-digit lowercase hex, e.g. `"b0 0b 40"`.
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validates the length of a MIDI message against its status byte.
pub fn is_valid_midi_message(msg: &[u8]) -> bool {
    let Some(&status) = msg.first() else {
        return false;
    };

    match status & 0xF0 {
        // Note Off, Note On, Poly Pressure, Control Change, Pitch Bend
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => msg.len() == 3 && data_bytes_ok(&msg[1..]),
        // Program Change, Channel Pressure
        0xC0 | 0xD0 => msg.len() == 2 && data_bytes_ok(&msg[1..]),
        0xF0 => is_valid_system_message(msg),
        _ => false,
    }
}

fn is_valid_system_message(msg: &[u8]) -> bool {
    match msg[0] {
        SYSEX_START => msg.len() >= 2 && msg[msg.len() - 1] == SYSEX_END,
        // MIDI Time Code Quarter Frame, Song Select
        0xF1 | 0xF3 => msg.len() == 2 && data_bytes_ok(&msg[1..]),
        // Song Position Pointer
        0xF2 => msg.len() == 3 && data_bytes_ok(&msg[1..]),
        // Tune Request and the realtime family
        0xF6 | TIMING_CLOCK | START | CONTINUE | STOP | ACTIVE_SENSING | 0xFF => msg.len() == 1,
        _ => false,
    }
}

fn data_bytes_ok(data: &[u8]) -> bool {
    data.iter().all(|b| *b < 0x80)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

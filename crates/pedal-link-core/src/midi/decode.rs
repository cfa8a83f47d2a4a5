//! Inbound decoder: raw bytes from the pedal to log entries.
//!
//! Classification looks only at the leading status byte.  The detail field
//! always carries the full message as space-separated hex.

use crate::domain::message_log::{MidiDirection, MidiMessageType, NewLogEntry};

use super::messages::{hex_bytes, CONTINUE, START, STOP, SYSEX_START, TIMING_CLOCK};

/// Classifies a status byte into a log type and a short summary.
pub fn decode_status(status: u8) -> (MidiMessageType, String) {
    match status & 0xF0 {
        0xC0 => return (MidiMessageType::Pc, "Program Change".to_string()),
        0xB0 => return (MidiMessageType::Cc, "Control Change".to_string()),
        _ => {}
    }
    match status {
        TIMING_CLOCK => (MidiMessageType::Clock, "Clock".to_string()),
        START => (MidiMessageType::Clock, "Start".to_string()),
        CONTINUE => (MidiMessageType::Clock, "Continue".to_string()),
        STOP => (MidiMessageType::Clock, "Stop".to_string()),
        SYSEX_START => (MidiMessageType::Sysex, "SysEx".to_string()),
        other => (MidiMessageType::Other, format!("0x{other:x}")),
    }
}

/// Decodes one inbound message.  Empty input yields `None`.
pub fn decode_inbound(bytes: &[u8]) -> Option<NewLogEntry> {
    let status = *bytes.first()?;
    let (kind, summary) = decode_status(status);
    Some(NewLogEntry::new(MidiDirection::In, kind, summary).with_detail(hex_bytes(bytes)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_change_on_any_channel() {
        let entry = decode_inbound(&[0xB0, 0x0B, 0x40]).unwrap();
        assert_eq!(entry.kind, MidiMessageType::Cc);
        assert_eq!(entry.summary, "Control Change");
        assert_eq!(entry.direction, MidiDirection::In);
        assert_eq!(entry.detail.as_deref(), Some("b0 0b 40"));

        assert_eq!(decode_status(0xBF).0, MidiMessageType::Cc);
    }

    #[test]
    fn test_program_change() {
        let entry = decode_inbound(&[0xC0, 0x05]).unwrap();
        assert_eq!(entry.kind, MidiMessageType::Pc);
        assert_eq!(entry.detail.as_deref(), Some("c0 05"));
        assert_eq!(decode_status(0xCA).0, MidiMessageType::Pc);
    }

    #[test]
    fn test_clock_family_has_distinct_summaries() {
        let cases = [(0xF8, "Clock"), (0xFA, "Start"), (0xFB, "Continue"), (0xFC, "Stop")];
        for (status, summary) in cases {
            let entry = decode_inbound(&[status]).unwrap();
            assert_eq!(entry.kind, MidiMessageType::Clock, "status {status:#x}");
            assert_eq!(entry.summary, summary);
        }
    }

    #[test]
    fn test_sysex() {
        let entry = decode_inbound(&[0xF0, 0x7E, 0xF7]).unwrap();
        assert_eq!(entry.kind, MidiMessageType::Sysex);
        assert_eq!(entry.detail.as_deref(), Some("f0 7e f7"));
    }

    #[test]
    fn test_other_uses_hex_status_as_summary() {
        let entry = decode_inbound(&[0x90, 0x3C, 0x64]).unwrap();
        assert_eq!(entry.kind, MidiMessageType::Other);
        assert_eq!(entry.summary, "0x90");

        assert_eq!(decode_status(0xFE).1, "0xfe");
    }

    #[test]
    fn test_empty_input_is_ignored() {
        assert!(decode_inbound(&[]).is_none());
    }
}

//! MIDI output device adapters.
//!
//! An [`OutputDevice`] is the thinnest possible wrapper around "a list of
//! MIDI outputs, one of which can be open at a time".  Transports build on
//! top of it; the IPC bridge host serves it over stdin/stdout.
//!
//! # Why a trait? (for beginners)
//!
//! Real MIDI hardware is not available in CI.  Putting the device behind a
//! trait lets the native transport and the bridge host run against
//! [`LoopbackDevice`] in tests (and with `--loopback` on the command line)
//! while production uses [`MidirOutputDevice`], which talks to CoreMIDI, ALSA
//! or WinMM through the `midir` crate.
//!
//! All methods take `&self`: implementations keep their state behind a mutex
//! so one device can be shared between the bridge host and its callers via
//! `Arc<dyn OutputDevice>`.

pub mod loopback;

use std::sync::{Mutex, MutexGuard};

use midir::{MidiOutput, MidiOutputConnection};
use thiserror::Error;
use tracing::{debug, info};

pub use loopback::LoopbackDevice;

/// Errors produced by MIDI device adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The host has no usable MIDI backend.
    #[error("MIDI backend unavailable: {0}")]
    Unavailable(String),

    /// A send was attempted before any output was opened.
    #[error("no MIDI output selected")]
    NoOutputSelected,

    /// The output exists but could not be opened.
    #[error("failed to open MIDI output {index}: {reason}")]
    Open { index: usize, reason: String },

    /// The output rejected the bytes (device unplugged, driver error).
    #[error("MIDI send failed: {0}")]
    Send(String),
}

/// One MIDI output endpoint with enumeration and selection.
#[cfg_attr(test, mockall::automock)]
pub trait OutputDevice: Send + Sync {
    /// Names of the available outputs, in backend order.
    fn list_outputs(&self) -> Result<Vec<String>, DeviceError>;

    /// Opens output `index`, releasing any previously open one.
    ///
    /// Returns `Ok(None)` when `index` is out of range.
    fn select_output(&self, index: usize) -> Result<Option<usize>, DeviceError>;

    /// Index of the currently open output.
    fn selected(&self) -> Option<usize>;

    /// Writes one complete MIDI message to the open output.
    fn send(&self, bytes: &[u8]) -> Result<(), DeviceError>;

    /// Closes the open output, if any.  Never fails.
    fn release(&self);
}

// ── midir ─────────────────────────────────────────────────────────────────────

struct OpenOutput {
    index: usize,
    connection: MidiOutputConnection,
}

/// [`OutputDevice`] backed by the platform MIDI API through `midir`.
pub struct MidirOutputDevice {
    client_name: String,
    open: Mutex<Option<OpenOutput>>,
}

impl MidirOutputDevice {
    /// Creates a device that registers with the MIDI system as `client_name`.
    ///
    /// No backend call happens until the first method is used.
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            open: Mutex::new(None),
        }
    }

    fn backend(&self) -> Result<MidiOutput, DeviceError> {
        MidiOutput::new(&self.client_name).map_err(|e| DeviceError::Unavailable(e.to_string()))
    }

    fn state(&self) -> MutexGuard<'_, Option<OpenOutput>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutputDevice for MidirOutputDevice {
    fn list_outputs(&self) -> Result<Vec<String>, DeviceError> {
        let midi_out = self.backend()?;
        midi_out
            .ports()
            .iter()
            .map(|port| {
                midi_out
                    .port_name(port)
                    .map_err(|e| DeviceError::Unavailable(e.to_string()))
            })
            .collect()
    }

    fn select_output(&self, index: usize) -> Result<Option<usize>, DeviceError> {
        self.release();

        let midi_out = self.backend()?;
        let ports = midi_out.ports();
        let Some(port) = ports.get(index) else {
            debug!(index, available = ports.len(), "output index out of range");
            return Ok(None);
        };
        let port_name = midi_out.port_name(port).unwrap_or_default();
        let connection = midi_out
            .connect(port, &format!("{} out", self.client_name))
            .map_err(|e| DeviceError::Open {
                index,
                reason: e.to_string(),
            })?;

        info!(index, port = %port_name, "MIDI output opened");
        *self.state() = Some(OpenOutput { index, connection });
        Ok(Some(index))
    }

    fn selected(&self) -> Option<usize> {
        self.state().as_ref().map(|open| open.index)
    }

    fn send(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state();
        let open = state.as_mut().ok_or(DeviceError::NoOutputSelected)?;
        open.connection
            .send(bytes)
            .map_err(|e| DeviceError::Send(e.to_string()))
    }

    fn release(&self) {
        if let Some(open) = self.state().take() {
            debug!(index = open.index, "MIDI output released");
            open.connection.close();
        }
    }
}

impl Drop for MidirOutputDevice {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MidirOutputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidirOutputDevice")
            .field("client_name", &self.client_name)
            .field("selected", &self.selected())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_messages_name_the_cause() {
        assert_eq!(
            DeviceError::Open {
                index: 2,
                reason: "busy".to_string()
            }
            .to_string(),
            "failed to open MIDI output 2: busy"
        );
        assert_eq!(DeviceError::NoOutputSelected.to_string(), "no MIDI output selected");
    }

    #[test]
    fn test_new_midir_device_has_nothing_selected() {
        // Arrange / Act: construction must not touch the MIDI backend.
        let device = MidirOutputDevice::new("pedal-link-test");

        // Assert
        assert_eq!(device.selected(), None);
        assert_eq!(device.send(&[0xFE]), Err(DeviceError::NoOutputSelected));
    }

    #[test]
    fn test_release_without_open_output_is_a_no_op() {
        let device = MidirOutputDevice::new("pedal-link-test");
        device.release();
        device.release();
        assert_eq!(device.selected(), None);
    }
}

//! In-memory MIDI output for tests and hardware-free runs.
//!
//! Records every message it is given and can be "unplugged" to simulate a
//! device disappearing mid-session.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{DeviceError, OutputDevice};

#[derive(Debug, Default)]
struct LoopbackState {
    outputs: Vec<String>,
    selected: Option<usize>,
    sent: Vec<Vec<u8>>,
    unplugged: bool,
    reject_realtime: bool,
}

/// An [`OutputDevice`] that stores sent bytes instead of emitting them.
///
/// Clones share state, so a test can keep one handle for inspection while the
/// transport owns another.
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackDevice {
    /// A device exposing the given output names.
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                outputs: outputs.into_iter().map(Into::into).collect(),
                ..LoopbackState::default()
            })),
        }
    }

    /// A device with a single output named `"Loopback"`.
    pub fn single() -> Self {
        Self::new(["Loopback"])
    }

    /// Every message sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    /// Simulates the device being removed: the open output closes, the
    /// output list empties and sends fail.
    pub fn unplug(&self) {
        let mut state = self.state();
        state.unplugged = true;
        state.selected = None;
    }

    /// Reverses [`unplug`](Self::unplug).
    pub fn plug_in(&self) {
        self.state().unplugged = false;
    }

    /// Makes single-byte realtime sends fail, as some drivers do for
    /// Active Sensing.
    pub fn reject_realtime(&self, reject: bool) {
        self.state().reject_realtime = reject;
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().expect("loopback state poisoned")
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::single()
    }
}

impl OutputDevice for LoopbackDevice {
    fn list_outputs(&self) -> Result<Vec<String>, DeviceError> {
        let state = self.state();
        if state.unplugged {
            return Ok(Vec::new());
        }
        Ok(state.outputs.clone())
    }

    fn select_output(&self, index: usize) -> Result<Option<usize>, DeviceError> {
        let mut state = self.state();
        state.selected = None;
        if state.unplugged || index >= state.outputs.len() {
            return Ok(None);
        }
        state.selected = Some(index);
        Ok(Some(index))
    }

    fn selected(&self) -> Option<usize> {
        self.state().selected
    }

    fn send(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.unplugged {
            return Err(DeviceError::Send("device unplugged".to_string()));
        }
        if state.selected.is_none() {
            return Err(DeviceError::NoOutputSelected);
        }
        if state.reject_realtime && bytes.len() == 1 && bytes[0] >= 0xF8 {
            return Err(DeviceError::Send(format!("realtime 0x{:02x} not supported", bytes[0])));
        }
        state.sent.push(bytes.to_vec());
        Ok(())
    }

    fn release(&self) {
        self.state().selected = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

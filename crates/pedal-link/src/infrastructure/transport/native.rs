//! In-process transport over an [`OutputDevice`].
//!
//! Connect enumerates the outputs and opens the configured one; the probe is
//! a single Active Sensing byte, retried as a zero-value CC on the reserved
//! probe control when the driver refuses realtime bytes.  MIDI clock runs
//! as a [`ClockSender`] on the same device and never outlives the link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pedal_link_core::midi::messages::ACTIVE_SENSING;
use pedal_link_core::MidiMessage;
use tracing::{debug, info};

use super::{MidiTransport, OutputSelector, TransportError};
use crate::infrastructure::clock_out::ClockSender;
use crate::infrastructure::device::{DeviceError, OutputDevice};

/// Transport that drives a MIDI output in this process.
pub struct NativeTransport {
    device: Arc<dyn OutputDevice>,
    output: OutputSelector,
    connected: bool,
    clock: Option<ClockSender>,
}

impl NativeTransport {
    pub fn new(device: Arc<dyn OutputDevice>, output: OutputSelector) -> Self {
        Self {
            device,
            output,
            connected: false,
            clock: None,
        }
    }

    /// Tempo of the running clock, if any.
    pub fn clock_bpm(&self) -> Option<f64> {
        self.clock.as_ref().map(ClockSender::bpm)
    }

    fn halt_clock(&mut self) {
        if let Some(clock) = self.clock.take() {
            clock.stop();
        }
    }
}

fn unavailable(error: DeviceError) -> TransportError {
    match error {
        DeviceError::Unavailable(reason) => TransportError::Unavailable(reason),
        other => TransportError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl MidiTransport for NativeTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.halt_clock();
        self.connected = false;

        let names = self.device.list_outputs().map_err(unavailable)?;
        if names.is_empty() {
            return Err(TransportError::NoDeviceFound);
        }
        let index = self.output.pick(&names);
        match self.device.select_output(index).map_err(unavailable)? {
            Some(selected) => {
                info!(index = selected, output = %names[selected], "native transport connected");
                self.connected = true;
                Ok(())
            }
            None => Err(TransportError::NoDeviceFound),
        }
    }

    async fn disconnect(&mut self) {
        if self.connected {
            debug!("native transport disconnecting");
        }
        self.halt_clock();
        self.device.release();
        self.connected = false;
    }

    async fn send_test(&mut self) -> Result<Duration, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let start = Instant::now();
        if let Err(e) = self.device.send(&[ACTIVE_SENSING]) {
            debug!(error = %e, "active sensing rejected; probing with CC");
            self.device
                .send(&MidiMessage::probe().to_bytes())
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        Ok(start.elapsed())
    }

    async fn send(&mut self, message: &MidiMessage) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.device
            .send(&message.to_bytes())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn start_clock(&mut self, bpm: f64) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.halt_clock();
        let clock = ClockSender::start(Arc::clone(&self.device), bpm)
            .map_err(|e| TransportError::Clock(e.to_string()))?;
        self.clock = Some(clock);
        Ok(())
    }

    async fn stop_clock(&mut self) {
        self.halt_clock();
    }

    fn is_connected(&self) -> bool {
        self.connected && self.device.selected().is_some()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Outbound MIDI clock.
//!
//! A [`ClockSender`] sends Start once, then Timing Clock at
//! `60 / (bpm * 24)` second spacing from a Tokio task, until stopped.
//! Stopping sends Stop on a best-effort basis.

use std::sync::Arc;

use pedal_link_core::midi::messages::{START, STOP, TIMING_CLOCK};
use pedal_link_core::midi::tick_interval;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::device::{DeviceError, OutputDevice};

/// Reasons a clock cannot start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    #[error("tempo must be a positive number of bpm, got {0}")]
    InvalidTempo(f64),

    #[error("no MIDI output selected")]
    NoOutputSelected,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A running clock on one output device.
///
/// Dropping the sender stops the ticks without sending Stop.
pub struct ClockSender {
    device: Arc<dyn OutputDevice>,
    bpm: f64,
    task: JoinHandle<()>,
}

impl ClockSender {
    /// Sends Start and begins ticking.  Must be called from within a Tokio
    /// runtime.
    pub fn start(device: Arc<dyn OutputDevice>, bpm: f64) -> Result<Self, ClockError> {
        let period = tick_interval(bpm).ok_or(ClockError::InvalidTempo(bpm))?;
        if device.selected().is_none() {
            return Err(ClockError::NoOutputSelected);
        }
        device.send(&[START])?;

        let ticker = Arc::clone(&device);
        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failing = false;
            loop {
                interval.tick().await;
                match ticker.send(&[TIMING_CLOCK]) {
                    Ok(()) => failing = false,
                    Err(e) if !failing => {
                        warn!("clock tick failed: {e}");
                        failing = true;
                    }
                    Err(_) => {}
                }
            }
        });

        info!(bpm, period_us = period.as_micros() as u64, "MIDI clock started");
        Ok(Self { device, bpm, task })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Stops ticking and sends Stop.
    pub fn stop(self) {
        self.task.abort();
        if let Err(e) = self.device.send(&[STOP]) {
            debug!("clock stop not delivered: {e}");
        }
        info!(bpm = self.bpm, "MIDI clock stopped");
    }
}

impl Drop for ClockSender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ClockSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSender")
            .field("bpm", &self.bpm)
            .field("running", &!self.task.is_finished())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::device::LoopbackDevice;
    use std::time::Duration;

    fn selected_loopback() -> LoopbackDevice {
        let device = LoopbackDevice::single();
        device.select_output(0).unwrap();
        device
    }

    fn ticks(device: &LoopbackDevice) -> usize {
        device.sent().iter().filter(|m| m.as_slice() == [TIMING_CLOCK]).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_spaced_by_tempo() {
        // Arrange: 125 bpm is exactly 20 ms per tick.
        let device = selected_loopback();

        // Act
        let clock = ClockSender::start(Arc::new(device.clone()), 125.0).unwrap();

        // Assert: ticks at 0, 20, 40, 60 ms.
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ticks(&device), 1);
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks(&device), 2);
        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks(&device), 4);

        clock.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_frame_the_ticks() {
        // Arrange
        let device = selected_loopback();
        let clock = ClockSender::start(Arc::new(device.clone()), 125.0).unwrap();
        time::sleep(Duration::from_millis(50)).await;

        // Act
        clock.stop();
        time::sleep(Duration::from_millis(100)).await;

        // Assert
        let sent = device.sent();
        assert_eq!(sent.first(), Some(&vec![START]));
        assert_eq!(sent.last(), Some(&vec![STOP]));
        assert_eq!(ticks(&device), 3);
        assert_eq!(sent.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_sender_stops_ticks_without_stop_message() {
        let device = selected_loopback();
        let clock = ClockSender::start(Arc::new(device.clone()), 125.0).unwrap();
        time::sleep(Duration::from_millis(1)).await;

        drop(clock);
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(device.sent(), vec![vec![START], vec![TIMING_CLOCK]]);
    }

    #[tokio::test]
    async fn test_invalid_tempo_is_rejected() {
        let device = selected_loopback();
        let result = ClockSender::start(Arc::new(device.clone()), 0.0);
        assert_eq!(result.err(), Some(ClockError::InvalidTempo(0.0)));
        assert!(device.sent().is_empty());
    }

    #[tokio::test]
    async fn test_clock_needs_an_open_output() {
        let device = LoopbackDevice::single();
        let result = ClockSender::start(Arc::new(device), 120.0);
        assert_eq!(result.err(), Some(ClockError::NoOutputSelected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplugged_device_keeps_clock_task_alive() {
        let device = selected_loopback();
        let clock = ClockSender::start(Arc::new(device.clone()), 125.0).unwrap();

        device.unplug();
        time::sleep(Duration::from_millis(50)).await;
        device.plug_in();
        device.select_output(0).unwrap();
        time::sleep(Duration::from_millis(20)).await;

        assert!(ticks(&device) >= 1);
        clock.stop();
    }
}

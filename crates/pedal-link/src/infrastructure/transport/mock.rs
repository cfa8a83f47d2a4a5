//! Scripted transport for testing the connection service.
//!
//! Results for `connect` and `send_test` are queued ahead of time; when a
//! queue runs dry the transport falls back to success (connect) or the
//! default latency (probe).  Call counts, sent messages and clock starts are
//! recorded.
//!
//! `MockTransport` is `Clone` and every clone shares the same script, so a
//! test keeps one handle and hands another to the service.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pedal_link_core::midi::tick_interval;
use pedal_link_core::MidiMessage;

use super::{MidiTransport, TransportError};

#[derive(Debug, Default)]
struct MockState {
    connect_results: VecDeque<Result<(), TransportError>>,
    fail_every_connect: Option<TransportError>,
    probe_results: VecDeque<Result<Duration, TransportError>>,
    default_latency: Duration,
    probe_delay: Duration,
    send_error: Option<TransportError>,
    clock_error: Option<TransportError>,
    connected: bool,
    clock: Option<f64>,
    clock_starts: Vec<f64>,
    connect_calls: usize,
    disconnect_calls: usize,
    probe_calls: usize,
    sent: Vec<MidiMessage>,
}

/// A [`MidiTransport`] whose behaviour is scripted by the test.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Connects successfully and probes with 5 ms latency unless scripted
    /// otherwise.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                default_latency: Duration::from_millis(5),
                ..MockState::default()
            })),
        }
    }

    /// Queues the result of the next unscripted `connect` call.
    pub fn push_connect(&self, result: Result<(), TransportError>) -> &Self {
        self.state().connect_results.push_back(result);
        self
    }

    /// Makes every `connect` fail with `error` until cleared with `None`.
    pub fn fail_connects(&self, error: Option<TransportError>) -> &Self {
        self.state().fail_every_connect = error;
        self
    }

    /// Queues the result of the next `send_test` call.
    pub fn push_probe(&self, result: Result<Duration, TransportError>) -> &Self {
        self.state().probe_results.push_back(result);
        self
    }

    /// Latency reported once the probe queue is empty.
    pub fn set_default_latency(&self, latency: Duration) -> &Self {
        self.state().default_latency = latency;
        self
    }

    /// Makes `send_test` wait this long before answering.
    pub fn set_probe_delay(&self, delay: Duration) -> &Self {
        self.state().probe_delay = delay;
        self
    }

    /// Makes every `send` fail with `error` until cleared with `None`.
    pub fn fail_sends(&self, error: Option<TransportError>) -> &Self {
        self.state().send_error = error;
        self
    }

    /// Makes every `start_clock` fail with `error` until cleared with `None`.
    pub fn fail_clock(&self, error: Option<TransportError>) -> &Self {
        self.state().clock_error = error;
        self
    }

    /// Simulates the link dropping without the transport being told.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected = false;
        state.clock = None;
    }

    pub fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state().disconnect_calls
    }

    pub fn probe_calls(&self) -> usize {
        self.state().probe_calls
    }

    /// Tempo of the running clock, if any.
    pub fn clock_bpm(&self) -> Option<f64> {
        self.state().clock
    }

    /// Tempos passed to successful `start_clock` calls, oldest first.
    pub fn clock_starts(&self) -> Vec<f64> {
        self.state().clock_starts.clone()
    }

    /// Messages accepted by `send`, oldest first.
    pub fn sent(&self) -> Vec<MidiMessage> {
        self.state().sent.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport state poisoned")
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MidiTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connect_calls += 1;
        let result = match &state.fail_every_connect {
            Some(error) => Err(error.clone()),
            None => state.connect_results.pop_front().unwrap_or(Ok(())),
        };
        state.connected = result.is_ok();
        result
    }

    async fn disconnect(&mut self) {
        let mut state = self.state();
        state.disconnect_calls += 1;
        state.connected = false;
        state.clock = None;
    }

    async fn send_test(&mut self) -> Result<Duration, TransportError> {
        let delay = {
            let mut state = self.state();
            state.probe_calls += 1;
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.probe_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        let default = state.default_latency;
        state.probe_results.pop_front().unwrap_or(Ok(default))
    }

    async fn send(&mut self, message: &MidiMessage) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = &state.send_error {
            return Err(error.clone());
        }
        state.sent.push(*message);
        Ok(())
    }

    async fn start_clock(&mut self, bpm: f64) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = &state.clock_error {
            return Err(error.clone());
        }
        if tick_interval(bpm).is_none() {
            return Err(TransportError::Clock(format!("invalid tempo {bpm}")));
        }
        state.clock = Some(bpm);
        state.clock_starts.push(bpm);
        Ok(())
    }

    async fn stop_clock(&mut self) {
        self.state().clock = None;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

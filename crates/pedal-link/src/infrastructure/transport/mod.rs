//! MIDI transports: the capability the connection service drives.
//!
//! A transport owns the link to the pedal and offers exactly four things:
//! connect, disconnect, a timed liveness probe, and a synchronous
//! "is the link up" check.  Real messages go through [`MidiTransport::send`],
//! and outbound MIDI clock is started and stopped with
//! [`MidiTransport::start_clock`] / [`MidiTransport::stop_clock`].
//!
//! # Implementations
//!
//! | Transport            | Link                                   | Probe                        |
//! |----------------------|----------------------------------------|------------------------------|
//! | [`NativeTransport`]  | in-process [`OutputDevice`]            | Active Sensing, CC fallback  |
//! | [`BridgeTransport`]  | JSON-lines IPC to a bridge host        | `send_midi_cc` CC 0 = 0      |
//! | [`MockTransport`]    | scripted, for tests                    | scripted latency             |
//!
//! Which one runs is decided once at startup: [`HostCapabilities::detect`]
//! looks at the environment, [`select_transport`] turns the configured
//! [`TransportMode`] plus those capabilities into a [`HostKind`], and the
//! binary builds the matching [`HostTransport`] variant.  The service never
//! branches on the environment itself.
//!
//! [`OutputDevice`]: crate::infrastructure::device::OutputDevice

pub mod bridge;
pub mod mock;
pub mod native;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use pedal_link_core::MidiMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bridge::BridgeTransport;
pub use mock::MockTransport;
pub use native::NativeTransport;

/// Environment variable naming the bridge host executable.
pub const BRIDGE_ENV: &str = "PEDAL_LINK_BRIDGE";

/// Failures a transport reports to the connection service.
///
/// None of these reach service callers directly; the service turns them
/// into a status transition plus an `error` event carrying the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No MIDI capability in this host (backend missing, bridge not running).
    #[error("MIDI unavailable: {0}")]
    Unavailable(String),

    /// The capability exists but there is no output to open.
    #[error("no MIDI outputs found")]
    NoDeviceFound,

    /// A probe or send was attempted without an established link.
    #[error("not connected")]
    NotConnected,

    /// A probe or real message failed mid-flight.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The clock could not be started on the open output.
    #[error("clock failed: {0}")]
    Clock(String),

    /// A transport call did not complete in time.
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// The capability interface the connection service consumes.
///
/// Callers guarantee `connect` is not invoked twice concurrently; the trait
/// does not require it to be idempotent.
#[async_trait]
pub trait MidiTransport: Send {
    /// Establishes the link.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Releases the link.  Always succeeds; a no-op when already down.
    async fn disconnect(&mut self);

    /// Sends a harmless probe and returns the time from just before the send
    /// to its acknowledgement.
    async fn send_test(&mut self) -> Result<Duration, TransportError>;

    /// Sends one application message.
    async fn send(&mut self, message: &MidiMessage) -> Result<(), TransportError>;

    /// Starts sending MIDI clock at `bpm`, replacing any clock already
    /// running.
    async fn start_clock(&mut self, bpm: f64) -> Result<(), TransportError>;

    /// Stops the clock.  A no-op when none is running.
    async fn stop_clock(&mut self);

    /// Whether the link is currently up.  No side effects.
    fn is_connected(&self) -> bool;
}

/// Which output to open when a transport connects.
///
/// A name match (case-insensitive substring) wins over the index; an index
/// past the end falls back to the first output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSelector {
    pub index: usize,
    pub name: Option<String>,
}

impl OutputSelector {
    /// Picks an index into `names`.  `names` must not be empty.
    pub fn pick(&self, names: &[String]) -> usize {
        if let Some(wanted) = &self.name {
            let wanted = wanted.to_lowercase();
            if let Some(pos) = names.iter().position(|n| n.to_lowercase().contains(&wanted)) {
                return pos;
            }
        }
        if self.index < names.len() {
            self.index
        } else {
            0
        }
    }
}

// ── Host selection ────────────────────────────────────────────────────────────

/// Transport preference from configuration or the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Bridge when a bridge host is advertised, otherwise native.
    #[default]
    Auto,
    Native,
    Bridge,
}

/// The concrete transport family chosen for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Native,
    Bridge,
}

/// What the host environment offers, probed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Bridge host executable advertised through [`BRIDGE_ENV`].
    pub bridge_host: Option<PathBuf>,
}

impl HostCapabilities {
    /// Reads the process environment.
    pub fn detect() -> Self {
        Self {
            bridge_host: std::env::var_os(BRIDGE_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Chooses the transport family.  Pure: same inputs, same answer.
pub fn select_transport(mode: TransportMode, caps: &HostCapabilities) -> HostKind {
    match mode {
        TransportMode::Native => HostKind::Native,
        TransportMode::Bridge => HostKind::Bridge,
        TransportMode::Auto if caps.bridge_host.is_some() => HostKind::Bridge,
        TransportMode::Auto => HostKind::Native,
    }
}

/// The transport variant built at startup and injected into the service.
pub enum HostTransport {
    Native(NativeTransport),
    Bridge(BridgeTransport),
}

impl HostTransport {
    pub fn kind(&self) -> HostKind {
        match self {
            HostTransport::Native(_) => HostKind::Native,
            HostTransport::Bridge(_) => HostKind::Bridge,
        }
    }
}

#[async_trait]
impl MidiTransport for HostTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            HostTransport::Native(t) => t.connect().await,
            HostTransport::Bridge(t) => t.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            HostTransport::Native(t) => t.disconnect().await,
            HostTransport::Bridge(t) => t.disconnect().await,
        }
    }

    async fn send_test(&mut self) -> Result<Duration, TransportError> {
        match self {
            HostTransport::Native(t) => t.send_test().await,
            HostTransport::Bridge(t) => t.send_test().await,
        }
    }

    async fn send(&mut self, message: &MidiMessage) -> Result<(), TransportError> {
        match self {
            HostTransport::Native(t) => t.send(message).await,
            HostTransport::Bridge(t) => t.send(message).await,
        }
    }

    async fn start_clock(&mut self, bpm: f64) -> Result<(), TransportError> {
        match self {
            HostTransport::Native(t) => t.start_clock(bpm).await,
            HostTransport::Bridge(t) => t.start_clock(bpm).await,
        }
    }

    async fn stop_clock(&mut self) {
        match self {
            HostTransport::Native(t) => t.stop_clock().await,
            HostTransport::Bridge(t) => t.stop_clock().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            HostTransport::Native(t) => t.is_connected(),
            HostTransport::Bridge(t) => t.is_connected(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_transport_auto_prefers_bridge_when_advertised() {
        // Arrange
        let with_bridge = HostCapabilities {
            bridge_host: Some(PathBuf::from("/opt/pedal-link/bridge")),
        };
        let without = HostCapabilities::default();

        // Act / Assert
        assert_eq!(select_transport(TransportMode::Auto, &with_bridge), HostKind::Bridge);
        assert_eq!(select_transport(TransportMode::Auto, &without), HostKind::Native);
    }

    #[test]
    fn test_select_transport_explicit_mode_overrides_capabilities() {
        let with_bridge = HostCapabilities {
            bridge_host: Some(PathBuf::from("bridge")),
        };
        assert_eq!(select_transport(TransportMode::Native, &with_bridge), HostKind::Native);
        assert_eq!(
            select_transport(TransportMode::Bridge, &HostCapabilities::default()),
            HostKind::Bridge
        );
    }

    #[test]
    fn test_output_selector_name_match_is_case_insensitive_substring() {
        let selector = OutputSelector {
            index: 0,
            name: Some("mkii".to_string()),
        };
        assert_eq!(selector.pick(&names(&["IAC Bus 1", "DL4 MkII USB"])), 1);
    }

    #[test]
    fn test_output_selector_falls_back_to_index_then_first() {
        let by_index = OutputSelector {
            index: 1,
            name: Some("absent".to_string()),
        };
        assert_eq!(by_index.pick(&names(&["a", "b", "c"])), 1);

        let out_of_range = OutputSelector {
            index: 7,
            name: None,
        };
        assert_eq!(out_of_range.pick(&names(&["a", "b"])), 0);
    }

    #[test]
    fn test_transport_mode_parses_lowercase_toml_values() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: TransportMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"bridge\"").unwrap();
        assert_eq!(parsed.mode, TransportMode::Bridge);
    }

    #[test]
    fn test_timeout_error_message_includes_operation_and_millis() {
        let err = TransportError::Timeout {
            operation: "send_midi_cc",
            after: Duration::from_millis(1000),
        };
        assert_eq!(err.to_string(), "send_midi_cc timed out after 1000ms");
    }
}

//! Connection data model: status, metrics, backoff, and the folded snapshot.
//!
//! # Connection lifecycle
//!
//! ```text
//!                 ┌──────────── scheduled reconnect ───────────┐
//!                 ▼                                            │
//! Disconnected ─► Connecting ─► Connected ⇄ Degraded ─► Error ─┘
//!       ▲                           │
//!       └── link lost / explicit ───┘
//!           disconnect()
//! ```
//!
//! There is no terminal state.  Only an explicit `disconnect()` by the owner
//! leaves the cycle without a scheduled reconnect.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current state of the MIDI output link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link, nothing in flight.
    #[default]
    Disconnected,
    /// `Transport::connect` is in progress.
    Connecting,
    /// Link up, last probe within the latency threshold.
    Connected,
    /// Link up, last probe slower than the degraded threshold.
    Degraded,
    /// Last connect or send failed; a reconnect is scheduled.
    Error,
}

impl ConnectionStatus {
    /// `true` for the two states in which the link is established and health
    /// checks run.
    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Degraded)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Degraded => "degraded",
            ConnectionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Health metrics accumulated across probes.
///
/// `dropped` only ever grows; it is zeroed by an explicit reconnect from
/// scratch, never by a transient backoff cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Round-trip time of the last successful probe, rounded to milliseconds.
    pub latency_ms: Option<u64>,
    /// Number of failed probes and sends.
    pub dropped: u64,
    /// Unix timestamp (ms) of the last successful probe.
    pub last_success_ts: Option<u64>,
}

impl ConnectionMetrics {
    /// Records a successful probe.
    pub fn record_success(&mut self, latency: Duration, now_ms: u64) {
        self.latency_ms = Some(round_millis(latency));
        self.last_success_ts = Some(now_ms);
    }

    /// Records a dropped probe or send.
    pub fn record_drop(&mut self) {
        self.dropped = self.dropped.saturating_add(1);
    }
}

/// A pending reconnect as shown to observers ("retrying in N s").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    /// Delay before the reconnect fires.
    pub delay_ms: u64,
    /// 1-based number of the upcoming reconnect attempt.
    pub attempt: u32,
}

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Creates a policy with the given base delay and cap.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the reconnect that follows `attempt` prior failures.
    ///
    /// Saturates instead of overflowing for very large attempt counts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).filter(|f| *f != 0);
        match factor.and_then(|f| self.base.checked_mul(f)) {
            Some(delay) => delay.min(self.max),
            None => self.max,
        }
    }

    /// The observable backoff state for a reconnect scheduled after
    /// `attempt` prior failures.
    pub fn state_for(&self, attempt: u32) -> BackoffState {
        BackoffState {
            delay_ms: round_millis(self.delay_for(attempt)),
            attempt: attempt.saturating_add(1),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(15_000),
        }
    }
}

/// One event on the service's observability channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Status(ConnectionStatus),
    Metrics(ConnectionMetrics),
    Error(String),
    /// `Some` when a reconnect is scheduled, `None` when it is cancelled or
    /// begins.
    Backoff(Option<BackoffState>),
}

/// The read-only projection that presentation layers render.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub metrics: ConnectionMetrics,
    pub last_error: Option<String>,
    pub backoff: Option<BackoffState>,
}

impl ConnectionSnapshot {
    /// Returns the snapshot with `event` folded in.
    ///
    /// An error event also forces the status to [`ConnectionStatus::Error`],
    /// so the snapshot is consistent even if a listener missed the preceding
    /// status event.  `last_error` is kept until the next error.
    pub fn fold(&self, event: &ConnectionEvent) -> ConnectionSnapshot {
        let mut next = self.clone();
        match event {
            ConnectionEvent::Status(status) => next.status = *status,
            ConnectionEvent::Metrics(metrics) => next.metrics = *metrics,
            ConnectionEvent::Error(message) => {
                next.status = ConnectionStatus::Error;
                next.last_error = Some(message.clone());
            }
            ConnectionEvent::Backoff(backoff) => next.backoff = *backoff,
        }
        next
    }
}

fn round_millis(d: Duration) -> u64 {
    (d.as_secs_f64() * 1000.0).round() as u64
}

// ── Tests ─────────────────────────────────────────────────────────────────────

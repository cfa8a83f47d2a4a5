//! Tempo detection from inbound MIDI clock.
//!
//! MIDI clock runs at 24 ticks per quarter note.  The follower collects one
//! window of 24 tick intervals and derives the tempo from their average:
//!
//! ```text
//! bpm = 60 / (average_tick_interval * 24)
//! ```
//!
//! Start and Continue restart the window; Stop freezes the last tempo and
//! clears the running flag.
//!
//! Sending clock uses the same relation the other way round:
//! [`tick_interval`] is the spacing between outbound ticks.

use std::time::{Duration, Instant};

use tracing::trace;

use super::messages::{CONTINUE, START, STOP, TIMING_CLOCK};

/// Clock ticks per quarter note.
pub const TICKS_PER_QUARTER: u32 = 24;

/// Spacing of clock ticks at `bpm`.  `None` unless `bpm` is finite and
/// positive.
pub fn tick_interval(bpm: f64) -> Option<Duration> {
    if !bpm.is_finite() || bpm <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(60.0 / (bpm * f64::from(TICKS_PER_QUARTER))))
}

/// Derives tempo and transport state from a stream of realtime bytes.
#[derive(Debug, Default, Clone)]
pub struct ClockFollower {
    last_tick: Option<Instant>,
    window_ticks: u32,
    window_elapsed: Duration,
    bpm: Option<f64>,
    running: bool,
}

impl ClockFollower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one inbound message received at `at`.  Messages other than
    /// clock, start, continue and stop are ignored.
    pub fn observe(&mut self, message: &[u8], at: Instant) {
        let Some(&status) = message.first() else {
            return;
        };
        match status {
            TIMING_CLOCK => self.tick(at),
            START | CONTINUE => {
                self.running = true;
                self.restart_window();
            }
            STOP => self.running = false,
            _ => {}
        }
    }

    fn tick(&mut self, at: Instant) {
        if let Some(last) = self.last_tick {
            self.window_elapsed += at.saturating_duration_since(last);
            self.window_ticks += 1;
            if self.window_ticks >= TICKS_PER_QUARTER {
                let quarter = self.window_elapsed.as_secs_f64();
                if quarter > 0.0 {
                    let bpm = 60.0 / quarter;
                    trace!(bpm, "clock window complete");
                    self.bpm = Some(bpm);
                    self.running = true;
                }
                self.window_ticks = 0;
                self.window_elapsed = Duration::ZERO;
            }
        }
        self.last_tick = Some(at);
    }

    fn restart_window(&mut self) {
        self.last_tick = None;
        self.window_ticks = 0;
        self.window_elapsed = Duration::ZERO;
    }

    /// `(running, bpm)`; `bpm` is `None` until one full window has been seen.
    pub fn status(&self) -> (bool, Option<f64>) {
        (self.running, self.bpm)
    }

    /// Forgets all state, as when clock follow is disabled.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_ticks(follower: &mut ClockFollower, start: Instant, interval: Duration, count: u32) -> Instant {
        let mut at = start;
        for _ in 0..count {
            follower.observe(&[TIMING_CLOCK], at);
            at += interval;
        }
        at
    }

    #[test]
    fn test_tick_interval_at_125_bpm_is_20ms() {
        assert_eq!(tick_interval(125.0), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_tick_interval_rejects_non_positive_tempo() {
        assert_eq!(tick_interval(0.0), None);
        assert_eq!(tick_interval(-90.0), None);
        assert_eq!(tick_interval(f64::NAN), None);
        assert_eq!(tick_interval(f64::INFINITY), None);
    }

    #[test]
    fn test_no_tempo_before_a_full_window() {
        let mut follower = ClockFollower::new();
        feed_ticks(&mut follower, Instant::now(), Duration::from_millis(20), 10);
        assert_eq!(follower.status(), (false, None));
    }

    #[test]
    fn test_120_bpm_from_evenly_spaced_ticks() {
        // Arrange: 120 bpm = 0.5 s per quarter = 20.833 ms per tick.
        let mut follower = ClockFollower::new();
        let interval = Duration::from_secs_f64(0.5 / 24.0);

        // Act: 25 ticks produce 24 intervals.
        feed_ticks(&mut follower, Instant::now(), interval, 25);

        // Assert
        let (running, bpm) = follower.status();
        assert!(running);
        let bpm = bpm.expect("tempo after one window");
        assert!((bpm - 120.0).abs() < 0.01, "got {bpm}");
    }

    #[test]
    fn test_stop_clears_running_but_keeps_tempo() {
        let mut follower = ClockFollower::new();
        let at = feed_ticks(&mut follower, Instant::now(), Duration::from_millis(25), 25);
        follower.observe(&[STOP], at);
        let (running, bpm) = follower.status();
        assert!(!running);
        assert!(bpm.is_some());
    }

    #[test]
    fn test_start_restarts_window() {
        // Arrange: half a window, then Start, then a full window at 100 bpm.
        let mut follower = ClockFollower::new();
        let at = feed_ticks(&mut follower, Instant::now(), Duration::from_millis(5), 12);
        follower.observe(&[START], at);
        assert!(follower.status().0);

        // Act
        let interval = Duration::from_secs_f64(0.6 / 24.0);
        feed_ticks(&mut follower, at + Duration::from_secs(1), interval, 25);

        // Assert: the fast ticks before Start did not leak into the tempo.
        let bpm = follower.status().1.unwrap();
        assert!((bpm - 100.0).abs() < 0.01, "got {bpm}");
    }

    #[test]
    fn test_non_clock_messages_are_ignored() {
        let mut follower = ClockFollower::new();
        follower.observe(&[0xB0, 0x01, 0x02], Instant::now());
        follower.observe(&[], Instant::now());
        assert_eq!(follower.status(), (false, None));
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut follower = ClockFollower::new();
        feed_ticks(&mut follower, Instant::now(), Duration::from_millis(20), 30);
        follower.reset();
        assert_eq!(follower.status(), (false, None));
    }
}

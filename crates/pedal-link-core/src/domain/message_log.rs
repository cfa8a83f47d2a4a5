//! Capacity-bounded MIDI message log with direction/type filters.
//!
//! The log is independent of the connection lifecycle.  Outbound senders,
//! the inbound decoder and the connection service all append to it; the UI
//! reads it through the [`ExternalStore`] contract.
//!
//! Entries are evicted FIFO once the capacity (default 1000) is exceeded: the
//! entry with the lowest id goes first, regardless of how often it was read.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::observe::{ExternalStore, Listeners, Subscription};

/// Default number of entries retained.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Which way a logged message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiDirection {
    Out,
    In,
    Error,
}

/// Coarse classification of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiMessageType {
    Pc,
    Cc,
    Sysex,
    Clock,
    Other,
}

/// One immutable log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiLogEntry {
    pub id: u64,
    /// Unix timestamp in milliseconds.
    pub ts: u64,
    pub direction: MidiDirection,
    pub kind: MidiMessageType,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// An entry before the log assigns its id.  `ts` defaults to "now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub ts: Option<u64>,
    pub direction: MidiDirection,
    pub kind: MidiMessageType,
    pub summary: String,
    pub detail: Option<String>,
}

impl NewLogEntry {
    pub fn new(direction: MidiDirection, kind: MidiMessageType, summary: impl Into<String>) -> Self {
        Self {
            ts: None,
            direction,
            kind,
            summary: summary.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn at(mut self, ts: u64) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// A key in the filter map: either a message type or a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKey {
    Kind(MidiMessageType),
    Direction(MidiDirection),
}

impl From<MidiMessageType> for FilterKey {
    fn from(kind: MidiMessageType) -> Self {
        FilterKey::Kind(kind)
    }
}

impl From<MidiDirection> for FilterKey {
    fn from(direction: MidiDirection) -> Self {
        FilterKey::Direction(direction)
    }
}

/// Visibility flags, all `true` by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilters {
    pub pc: bool,
    pub cc: bool,
    pub sysex: bool,
    pub clock: bool,
    pub other: bool,
    pub out: bool,
    #[serde(rename = "in")]
    pub inbound: bool,
    pub error: bool,
}

impl Default for LogFilters {
    fn default() -> Self {
        Self {
            pc: true,
            cc: true,
            sysex: true,
            clock: true,
            other: true,
            out: true,
            inbound: true,
            error: true,
        }
    }
}

impl LogFilters {
    fn slot(&mut self, key: FilterKey) -> &mut bool {
        match key {
            FilterKey::Kind(MidiMessageType::Pc) => &mut self.pc,
            FilterKey::Kind(MidiMessageType::Cc) => &mut self.cc,
            FilterKey::Kind(MidiMessageType::Sysex) => &mut self.sysex,
            FilterKey::Kind(MidiMessageType::Clock) => &mut self.clock,
            FilterKey::Kind(MidiMessageType::Other) => &mut self.other,
            FilterKey::Direction(MidiDirection::Out) => &mut self.out,
            FilterKey::Direction(MidiDirection::In) => &mut self.inbound,
            FilterKey::Direction(MidiDirection::Error) => &mut self.error,
        }
    }

    /// Current value of one flag.
    pub fn is_enabled(&self, key: impl Into<FilterKey>) -> bool {
        let mut copy = *self;
        *copy.slot(key.into())
    }

    /// Flips one flag.
    pub fn toggle(&mut self, key: impl Into<FilterKey>) {
        let slot = self.slot(key.into());
        *slot = !*slot;
    }

    /// An entry is visible iff both its type flag and its direction flag are set.
    pub fn allows(&self, entry: &MidiLogEntry) -> bool {
        self.is_enabled(entry.kind) && self.is_enabled(entry.direction)
    }
}

/// Immutable view of the log at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogSnapshot {
    pub entries: VecDeque<Arc<MidiLogEntry>>,
    pub filters: LogFilters,
}

impl LogSnapshot {
    /// Entries that pass the current filters, oldest first.
    pub fn visible(&self) -> impl Iterator<Item = &MidiLogEntry> + '_ {
        self.entries
            .iter()
            .map(|entry| entry.as_ref())
            .filter(|entry| self.filters.allows(entry))
    }
}

struct LogState {
    snapshot: Arc<LogSnapshot>,
    last_id: u64,
}

/// The shared message log.
///
/// All mutation goes through `&self`, so one `Arc<MessageLog>` can be handed
/// to the connection service, the inbound pump and the UI.
pub struct MessageLog {
    state: Mutex<LogState>,
    capacity: usize,
    listeners: Listeners<()>,
}

impl MessageLog {
    /// Creates a log that keeps the most recent [`DEFAULT_LOG_CAPACITY`] entries.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Creates a log that keeps the most recent `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                snapshot: Arc::new(LogSnapshot::default()),
                last_id: 0,
            }),
            capacity: capacity.max(1),
            listeners: Listeners::new(),
        }
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends an entry, assigning the next id and (if absent) the current
    /// timestamp, evicts the oldest entries beyond capacity and notifies
    /// subscribers.  Returns the assigned id.
    pub fn log(&self, entry: NewLogEntry) -> u64 {
        let id = self.mutate(|state| {
            state.last_id += 1;
            let id = state.last_id;
            let record = MidiLogEntry {
                id,
                ts: entry.ts.unwrap_or_else(super::now_unix_ms),
                direction: entry.direction,
                kind: entry.kind,
                summary: entry.summary,
                detail: entry.detail,
            };
            let mut next = (*state.snapshot).clone();
            next.entries.push_back(Arc::new(record));
            while next.entries.len() > self.capacity {
                next.entries.pop_front();
            }
            state.snapshot = Arc::new(next);
            id
        });
        self.listeners.emit(&());
        id
    }

    /// Flips one filter flag and notifies subscribers.
    pub fn toggle_filter(&self, key: impl Into<FilterKey>) {
        let key = key.into();
        self.mutate(|state| {
            let mut next = (*state.snapshot).clone();
            next.filters.toggle(key);
            state.snapshot = Arc::new(next);
        });
        self.listeners.emit(&());
    }

    /// Removes every entry, keeps the filters, and notifies subscribers.
    ///
    /// Ids keep counting from where they were.
    pub fn clear(&self) {
        self.mutate(|state| {
            let filters = state.snapshot.filters;
            state.snapshot = Arc::new(LogSnapshot {
                entries: VecDeque::new(),
                filters,
            });
        });
        self.listeners.emit(&());
    }

    /// Registers a change listener.
    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |_| listener())
    }

    /// Current snapshot; the same `Arc` until the next mutation.
    pub fn get_snapshot(&self) -> Arc<LogSnapshot> {
        Arc::clone(&self.lock().snapshot)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut LogState) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.get_snapshot();
        f.debug_struct("MessageLog")
            .field("entries", &snapshot.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ExternalStore for MessageLog {
    type Snapshot = LogSnapshot;

    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription {
        MessageLog::subscribe(self, listener)
    }

    fn get_snapshot(&self) -> Arc<LogSnapshot> {
        MessageLog::get_snapshot(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

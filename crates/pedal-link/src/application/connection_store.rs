//! Connection store: the read-only projection presentation layers render.
//!
//! The store subscribes to the service's four event channels once, folds
//! each event into an immutable [`ConnectionSnapshot`], and offers the
//! snapshot-plus-subscribe contract of [`ExternalStore`].  The snapshot `Arc`
//! is replaced only when its content changes, so `Arc::ptr_eq` is a valid
//! "did anything change" test for renderers.

use std::sync::{Arc, Mutex, MutexGuard};

use pedal_link_core::{ConnectionEvent, ConnectionSnapshot, ExternalStore, Listeners, Subscription};
use tracing::trace;

use super::connection_service::ConnectionEvents;

struct StoreState {
    snapshot: Mutex<Arc<ConnectionSnapshot>>,
    listeners: Listeners<()>,
}

impl StoreState {
    fn apply(&self, event: ConnectionEvent) {
        let changed = {
            let mut current = self.snapshot();
            let next = current.fold(&event);
            if next == **current {
                false
            } else {
                *current = Arc::new(next);
                true
            }
        };
        if changed {
            trace!(?event, "connection snapshot updated");
            self.listeners.emit(&());
        }
    }

    fn snapshot(&self) -> MutexGuard<'_, Arc<ConnectionSnapshot>> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Mirror of the connection service's state.
pub struct ConnectionStore {
    state: Arc<StoreState>,
    _feeds: [Subscription; 4],
}

impl ConnectionStore {
    /// Builds the store and attaches it to `events`.  Events emitted before
    /// this call are not replayed.
    pub fn new(events: &ConnectionEvents) -> Self {
        let state = Arc::new(StoreState {
            snapshot: Mutex::new(Arc::new(ConnectionSnapshot::default())),
            listeners: Listeners::new(),
        });

        let feed = |state: &Arc<StoreState>| Arc::clone(state);
        let (s1, s2, s3, s4) = (feed(&state), feed(&state), feed(&state), feed(&state));
        let feeds = [
            events.on_status(move |status| s1.apply(ConnectionEvent::Status(*status))),
            events.on_metrics(move |metrics| s2.apply(ConnectionEvent::Metrics(*metrics))),
            events.on_error(move |message| s3.apply(ConnectionEvent::Error(message.clone()))),
            events.on_backoff(move |backoff| s4.apply(ConnectionEvent::Backoff(*backoff))),
        ];

        Self {
            state,
            _feeds: feeds,
        }
    }

    /// Calls `listener` after every snapshot change.
    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.listeners.subscribe(move |_: &()| listener())
    }

    /// The current snapshot.  Identical `Arc` until the next change.
    pub fn get_snapshot(&self) -> Arc<ConnectionSnapshot> {
        Arc::clone(&self.state.snapshot())
    }
}

impl ExternalStore for ConnectionStore {
    type Snapshot = ConnectionSnapshot;

    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription {
        ConnectionStore::subscribe(self, listener)
    }

    fn get_snapshot(&self) -> Arc<ConnectionSnapshot> {
        ConnectionStore::get_snapshot(self)
    }
}

impl std::fmt::Debug for ConnectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStore")
            .field("snapshot", &self.get_snapshot())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

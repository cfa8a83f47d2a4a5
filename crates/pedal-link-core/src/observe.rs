//! Typed publish/subscribe primitives.
//!
//! [`Listeners`] is a collection of callbacks for a single event kind.  Every
//! call to [`Listeners::subscribe`] returns a [`Subscription`] token; dropping
//! the token (or calling [`Subscription::unsubscribe`]) removes exactly that
//! listener and leaves all others in place.
//!
//! # Re-entrancy
//!
//! [`Listeners::emit`] snapshots the current listener list before invoking any
//! callback, so a listener may subscribe or unsubscribe (itself or others)
//! from inside its own callback.  A listener added during an emit is not
//! called for that emit: subscribers observe events from their subscription
//! point forward, never a replay.
//!
//! # External-store contract
//!
//! The connection store and the message log both expose the same shape:
//!
//! ```text
//! subscribe(fn)  -> Subscription   // fn is called after every change
//! get_snapshot() -> Arc<T>         // identity changes only when content does
//! ```
//!
//! [`ExternalStore`] names that contract so presentation layers can be written
//! once against either store.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A fan-out list of listeners for events of type `T`.
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    /// Creates an empty listener list.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers `listener` and returns the token that removes it again.
    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(listener)));
        drop(registry);

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    // The removed callback is dropped after the guard so that
                    // tokens captured inside it can cancel without deadlock.
                    let removed = {
                        let mut guard = lock(&registry);
                        guard
                            .entries
                            .iter()
                            .position(|(entry_id, _)| *entry_id == id)
                            .map(|pos| guard.entries.remove(pos))
                    };
                    drop(removed);
                }
            })),
        }
    }

    /// Delivers `event` to every listener registered at the time of the call,
    /// in subscription order.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.registry)
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    /// Number of currently registered listeners.
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    /// Returns `true` when nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.registry.lock().map(|r| r.entries.len()).unwrap_or(0);
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}

/// Unsubscribe token returned by [`Listeners::subscribe`].
#[must_use = "dropping the Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Snapshot-plus-subscribe contract shared by the connection store and the
/// message log.
pub trait ExternalStore {
    /// The immutable snapshot type.
    type Snapshot;

    /// Registers a change listener.
    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription;

    /// Returns the current snapshot.  Two calls with no change in between
    /// return the same `Arc`.
    fn get_snapshot(&self) -> Arc<Self::Snapshot>;
}

// Listener callbacks run outside the lock, so a poisoned registry can only
// come from a panic inside `Vec` bookkeeping; the data is still consistent.
fn lock<T>(registry: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

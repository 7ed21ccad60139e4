//! Minimal reactive primitives over tokio watch channels
//!
//! The engine only needs two notification primitives from its substrate: a
//! readable/writable cell whose changes can be awaited, and a depot-wide
//! change bus that wakes the trigger loops after any snapshot or progress
//! update. Both are thin wrappers over `tokio::sync::watch`, which works from
//! synchronous worker threads on the sending side.

use tokio::sync::watch;

/// Observable value cell with get/set/subscribe
#[derive(Debug)]
pub struct Cell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Cell<T> {
    /// Create a cell holding the initial value
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify subscribers
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Subscribe to future changes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

/// Coalescing change-notification bus.
///
/// Senders bump a generation counter; receivers wake on any bump. Multiple
/// bumps between wake-ups coalesce into one, which is exactly the semantics
/// the trigger loops want.
#[derive(Debug)]
pub struct ChangeBus {
    tx: watch::Sender<u64>,
}

impl ChangeBus {
    /// Create an empty bus
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Signal that something observable changed
    pub fn bump(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Push-based observable values.
//!
//! Cross-component state in this subsystem is never polled: consumers
//! subscribe and react to changes. `ObservableValue` wraps a
//! `tokio::sync::watch` channel with set-if-changed semantics so that
//! writing an equal value produces no downstream notification.

use tokio::sync::watch;

/// A single observable value with change notification.
///
/// Cheap to read (`get` clones the current value), and `set` only wakes
/// subscribers when the value actually changed.
#[derive(Debug)]
pub struct ObservableValue<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> ObservableValue<T> {
    /// Create an observable holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Clone the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Read the current value without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replace the value. Returns `true` if it changed (and subscribers
    /// were notified).
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Mutate the value in place. The closure returns whether it changed
    /// the value; subscribers are only notified when it did.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Subscribe to changes. The receiver observes the current value
    /// immediately and every subsequent distinct value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + PartialEq + Default> Default for ObservableValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

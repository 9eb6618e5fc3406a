//! Single-resolution value that any number of tasks can wait on.

use std::sync::Arc;
use tokio::sync::watch;

/// A value that is resolved at most once and read any number of times.
///
/// Clones share the same slot. Waiting before or after resolution both
/// work; the first `resolve` wins and later ones are ignored.
#[derive(Debug)]
pub struct Promise<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Resolve the promise. Returns `false` if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    /// Wait until the promise is resolved and return a copy of the value.
    ///
    /// There is no timeout; wrap in `tokio::time::timeout` for a bounded wait.
    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so `changed` only fails if it is dropped.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

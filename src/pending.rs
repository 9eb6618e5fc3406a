//! Correlation table for in-flight RCON requests.

use crate::promise::Promise;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The response to a correlated RCON request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconResponse {
    pub request_id: i32,
    pub packet_type: i32,
    pub body: String,
}

/// Registry mapping request ids to the promise a caller waits on.
///
/// Ids are random, so collisions are possible over a long uptime. When two
/// entries share an id the one registered first is resolved and the other
/// keeps waiting.
#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<Vec<(i32, Promise<RconResponse>)>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`.
    pub fn register(&self, request_id: i32) -> Promise<RconResponse> {
        let promise = Promise::new();
        self.lock().push((request_id, promise.clone()));
        promise
    }

    /// Resolve and remove the first entry registered under `request_id`.
    ///
    /// Returns `false` when nothing was waiting for that id.
    pub fn resolve(&self, request_id: i32, response: RconResponse) -> bool {
        let promise = {
            let mut entries = self.lock();
            match entries.iter().position(|(id, _)| *id == request_id) {
                Some(index) => entries.remove(index).1,
                None => return false,
            }
        };
        promise.resolve(response);
        true
    }

    /// Drop an entry without resolving it.
    pub fn forget(&self, request_id: i32) {
        let mut entries = self.lock();
        if let Some(index) = entries.iter().position(|(id, _)| *id == request_id) {
            entries.remove(index);
        }
    }

    /// Abandon every entry. Their waiters are never resolved.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(i32, Promise<RconResponse>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

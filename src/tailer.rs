//! Server output tailing.
//!
//! One task reads the server's stdout for its whole lifetime. Each line is
//! first offered to the registered [`LogWaiters`], then handed to the
//! [`LogHook`]. Server output may contain non-UTF-8 bytes, so lines are read
//! as bytes and decoded lossily.

use crate::promise::Promise;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Waiter {
    id: u64,
    predicate: Predicate,
    promise: Promise<String>,
}

/// Handle returned by [`LogWaiters::register`].
#[derive(Debug, Clone)]
pub struct LogWaiter {
    id: u64,
    promise: Promise<String>,
}

impl LogWaiter {
    /// Wait for the first line matching the predicate.
    pub async fn wait(&self) -> String {
        self.promise.wait().await
    }

    pub fn promise(&self) -> &Promise<String> {
        &self.promise
    }

    pub fn is_resolved(&self) -> bool {
        self.promise.is_resolved()
    }
}

/// Set of one-shot waiters matched against server output lines.
#[derive(Clone, Default)]
pub struct LogWaiters {
    waiters: Arc<Mutex<Vec<Waiter>>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for LogWaiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWaiters")
            .field("pending", &self.len())
            .finish()
    }
}

impl LogWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next line satisfying `predicate`.
    ///
    /// The waiter is removed on its first match. Register before issuing the
    /// command whose output you expect, or the line may already be gone.
    pub fn register<F>(&self, predicate: F) -> LogWaiter
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let promise = Promise::new();
        self.lock().push(Waiter {
            id,
            predicate: Box::new(predicate),
            promise: promise.clone(),
        });
        LogWaiter { id, promise }
    }

    /// Wait for the next line containing `needle`.
    pub fn register_contains(&self, needle: impl Into<String>) -> LogWaiter {
        let needle = needle.into();
        self.register(move |line| line.contains(&needle))
    }

    /// Remove a waiter without resolving it.
    pub fn cancel(&self, waiter: &LogWaiter) {
        self.lock().retain(|w| w.id != waiter.id);
    }

    /// Resolve and remove every waiter matching `line`; returns how many matched.
    ///
    /// A predicate that panics counts as not matching.
    pub fn dispatch(&self, line: &str) -> usize {
        let matched: Vec<Waiter> = {
            let mut waiters = self.lock();
            let (matched, rest) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| matches_line(w, line));
            *waiters = rest;
            matched
        };
        for waiter in &matched {
            waiter.promise.resolve(line.to_string());
        }
        matched.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn matches_line(waiter: &Waiter, line: &str) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| (waiter.predicate)(line))).unwrap_or_else(|_| {
        error!(%line, "log waiter predicate panicked");
        false
    })
}

/// Receives every server output line after waiter dispatch.
///
/// A returned line is echoed to the local console.
#[async_trait]
pub trait LogHook: Send + Sync {
    async fn on_line(&self, line: &str) -> anyhow::Result<Option<String>>;
}

/// Hook that echoes every line unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHook;

#[async_trait]
impl LogHook for EchoHook {
    async fn on_line(&self, line: &str) -> anyhow::Result<Option<String>> {
        Ok(Some(line.to_string()))
    }
}

/// Spawn the tailer task over `stream`. It ends when the stream closes.
pub fn spawn_tailer(
    stream: impl AsyncRead + Unpin + Send + 'static,
    waiters: LogWaiters,
    hook: Arc<dyn LogHook>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    process_line(&line, &waiters, hook.as_ref()).await;
                }
                Err(e) => {
                    warn!(error = %e, "server output read failed");
                    break;
                }
            }
        }

        debug!("server output tailer exiting");
    })
}

/// Offer one line to the waiters and then the hook. Never panics.
pub async fn process_line(line: &str, waiters: &LogWaiters, hook: &dyn LogHook) {
    waiters.dispatch(line);

    match AssertUnwindSafe(hook.on_line(line)).catch_unwind().await {
        Ok(Ok(Some(echo))) if !echo.is_empty() => println!("{echo}"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, %line, "log hook failed"),
        Err(_) => error!(%line, "log hook panicked"),
    }
}

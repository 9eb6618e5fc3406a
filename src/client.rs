//! RCON session: authentication, correlated requests and automatic reconnect.

use crate::error::{Error, Result};
use crate::pending::{PendingTable, RconResponse};
use crate::promise::Promise;
use crate::protocol::{self, packet_type, Packet, AUTH_FAILED_ID, MAX_REQUEST_BODY};
use futures_util::future::BoxFuture;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before the receive loop retries after a transient read error.
const READ_RETRY_DELAY: Duration = Duration::from_millis(1000 / 15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Authenticating,
    Connected,
}

#[derive(Clone)]
struct Credentials {
    addr: String,
    port: u16,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
struct Inner {
    pending: PendingTable,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: Mutex<SessionState>,
    credentials: Mutex<Option<Credentials>>,
    auth_request: Mutex<Option<i32>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    /// Resolved on teardown so a pending login stops waiting.
    link_lost: Mutex<Option<Promise<()>>>,
    /// Set by `close`; blocks automatic reconnects until the next `connect`.
    closed: AtomicBool,
    reconnects: AtomicU64,
}

/// An RCON connection to the server.
///
/// Cheap to clone; clones share the connection. Credentials are kept after
/// a successful `connect` so the receive loop can reconnect on its own when
/// the link drops.
#[derive(Debug, Clone)]
pub struct RconSession {
    inner: Arc<Inner>,
}

impl RconSession {
    pub fn new() -> Self {
        Self::with_pending(PendingTable::new())
    }

    /// Create a session that correlates responses through `pending`.
    pub fn with_pending(pending: PendingTable) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending,
                writer: tokio::sync::Mutex::new(None),
                state: Mutex::new(SessionState::Disconnected),
                credentials: Mutex::new(None),
                auth_request: Mutex::new(None),
                receiver: Mutex::new(None),
                link_lost: Mutex::new(None),
                closed: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Number of automatic reconnects performed so far.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    /// Open a connection and authenticate.
    ///
    /// An existing connection is closed first. On a rejected password the
    /// session is left disconnected and `AuthenticationFailed` is returned.
    pub async fn connect(&self, addr: &str, port: u16, password: &str) -> Result<()> {
        self.inner.closed.store(false, Ordering::SeqCst);
        self.connect_with(Credentials {
            addr: addr.to_string(),
            port,
            password: password.to_string(),
        })
        .await
    }

    async fn connect_with(&self, credentials: Credentials) -> Result<()> {
        self.teardown().await;
        self.set_state(SessionState::Authenticating);

        let stream = match TcpStream::connect((credentials.addr.as_str(), credentials.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(e.into());
            }
        };
        let (reader, writer) = stream.into_split();
        *self.inner.writer.lock().await = Some(writer);
        *lock(&self.inner.credentials) = Some(credentials.clone());

        let link_lost = Promise::new();
        *lock(&self.inner.link_lost) = Some(link_lost.clone());
        let handle = tokio::spawn(receive_loop(self.clone(), reader, link_lost.clone()));
        *lock(&self.inner.receiver) = Some(handle);
        if self.is_closed() {
            self.teardown().await;
            return Err(Error::SessionNotConnected);
        }

        let (request_id, auth) = self.register();
        *lock(&self.inner.auth_request) = Some(request_id);
        if let Err(e) = self.write(request_id, packet_type::AUTH, &credentials.password).await {
            self.abandon_auth(request_id);
            self.teardown().await;
            return Err(e.into());
        }

        let response = tokio::select! {
            biased;
            response = auth.wait() => response,
            _ = link_lost.wait() => {
                self.abandon_auth(request_id);
                self.teardown().await;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed during authentication",
                )
                .into());
            }
        };

        if self.is_closed() {
            self.teardown().await;
            return Err(Error::SessionNotConnected);
        }

        if response.request_id == AUTH_FAILED_ID {
            warn!(addr = %credentials.addr, port = credentials.port, "RCON authentication rejected");
            self.teardown().await;
            return Err(Error::AuthenticationFailed);
        }

        info!(addr = %credentials.addr, port = credentials.port, "RCON connected");
        Ok(())
    }

    /// Send a packet and return a handle to its eventual response.
    ///
    /// Does not wait for the response. The returned promise is never
    /// resolved if the connection drops first.
    pub async fn send(&self, packet_type: i32, body: &str) -> Result<Promise<RconResponse>> {
        if !self.is_connected() {
            return Err(Error::SessionNotConnected);
        }
        if body.len() > MAX_REQUEST_BODY {
            warn!(
                len = body.len(),
                max = MAX_REQUEST_BODY,
                "RCON request body exceeds the host limit"
            );
        }

        let (request_id, promise) = self.register();
        if let Err(e) = self.write(request_id, packet_type, body).await {
            self.inner.pending.forget(request_id);
            return Err(e.into());
        }
        Ok(promise)
    }

    /// Send a command and return a handle to its response.
    pub async fn command(&self, command: &str) -> Result<Promise<RconResponse>> {
        self.send(packet_type::EXEC_COMMAND, command).await
    }

    /// Close the connection and abandon every pending request.
    ///
    /// Credentials are kept, but no automatic reconnect happens until the
    /// next `connect`. Calling `close` twice is harmless.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.teardown().await;
        let abandoned = self.inner.pending.clear();
        if abandoned > 0 {
            debug!(abandoned, "abandoned pending RCON requests");
        }
    }

    fn reconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(Error::SessionNotConnected);
            }
            let credentials = lock(&self.inner.credentials)
                .clone()
                .ok_or(Error::SessionNotConnected)?;
            self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
            info!(addr = %credentials.addr, port = credentials.port, "reconnecting RCON");
            self.connect_with(credentials).await
        })
    }

    fn register(&self) -> (i32, Promise<RconResponse>) {
        let request_id = rand::random_range(0..=i32::MAX);
        (request_id, self.inner.pending.register(request_id))
    }

    async fn write(&self, request_id: i32, packet_type: i32, body: &str) -> io::Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "RCON socket is closed"))?;
        protocol::write_packet(writer, &Packet::new(request_id, packet_type, body)).await
    }

    fn dispatch(&self, packet: Packet) {
        let mut key = packet.request_id;
        {
            let mut auth = lock(&self.inner.auth_request);
            if let Some(auth_id) = *auth {
                // A rejected login comes back as id -1 rather than the request id.
                if packet.packet_type == packet_type::AUTH_RESPONSE
                    && (packet.request_id == auth_id || packet.request_id == AUTH_FAILED_ID)
                {
                    key = auth_id;
                    *auth = None;
                    if packet.request_id == auth_id && !self.is_closed() {
                        self.set_state(SessionState::Connected);
                    }
                }
            }
        }

        let response = RconResponse {
            request_id: packet.request_id,
            packet_type: packet.packet_type,
            body: packet.body,
        };
        if !self.inner.pending.resolve(key, response) {
            debug!(request_id = key, "dropping RCON packet with no waiter");
        }
    }

    fn abandon_auth(&self, request_id: i32) {
        self.inner.pending.forget(request_id);
        let mut auth = lock(&self.inner.auth_request);
        if *auth == Some(request_id) {
            *auth = None;
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.inner.state) = state;
    }

    /// Take the receive loop's handle so a teardown does not abort it.
    fn detach_receiver(&self) {
        lock(&self.inner.receiver).take();
    }

    async fn teardown(&self) {
        self.set_state(SessionState::Disconnected);
        if let Some(handle) = lock(&self.inner.receiver).take() {
            handle.abort();
        }
        if let Some(link_lost) = lock(&self.inner.link_lost).take() {
            link_lost.resolve(());
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Default for RconSession {
    fn default() -> Self {
        Self::new()
    }
}

async fn receive_loop(session: RconSession, mut reader: OwnedReadHalf, link_lost: Promise<()>) {
    loop {
        match protocol::read_packet(&mut reader).await {
            Ok(packet) => session.dispatch(packet),
            Err(e) if is_connection_lost(&e) => {
                link_lost.resolve(());
                let was_connected = session.is_connected();
                session.detach_receiver();
                session.teardown().await;

                if was_connected {
                    warn!(error = %e, "RCON connection lost");
                    if let Err(e) = session.reconnect().await {
                        error!(error = %e, "RCON reconnect failed");
                    }
                } else {
                    debug!(error = %e, "RCON connection closed");
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "RCON read failed, retrying");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
}

fn is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! One TCP connection: receive loop, coalescing send queue, and a single
//! teardown path.
//!
//! A [`Connection`] is created unstarted, then [`Connection::start`] hands
//! it a socket and spawns its driver task. The driver owns the socket and
//! the [`ReceiveCursor`], runs the receive loop and the flush loop side by
//! side, and on exit runs the one and only teardown, which ends with
//! [`ConnectionHandler::on_disconnected`].
//!
//! State machine:
//!
//! ```text
//! Pending --start--> Connected --disconnect / error / EOF--> Disconnecting --teardown--> Disconnected
//!    \------------------------disconnect before start------------------------------------^
//! ```

use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, watch};

use crate::cursor::{CursorError, ReceiveCursor};
use crate::framing::FrameError;

/// Upper bound on buffers handed to one vectored write.
const MAX_IOVECS: usize = 64;

/// Unique identifier for a connection within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static CONNECTION_IDS: IdGenerator = IdGenerator::new();

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet started.
    Pending,
    /// Socket attached, receive and send paths running.
    Connected,
    /// Teardown has been claimed; no new sends are accepted.
    Disconnecting,
    /// Teardown finished and `on_disconnected` has returned.
    Disconnected,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`Connection::disconnect`] was called.
    Local,
    /// The peer closed its side of the stream.
    PeerClosed,
    /// A transport, protocol, or handler failure.
    Error(String),
}

/// Errors that terminate a connection or reject an operation on it.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Socket failure on send or receive.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or hostile framing.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    /// `on_recv` claimed more bytes than it was given.
    #[error("handler consumed {consumed} bytes but only {available} were readable")]
    ConsumedOutOfRange {
        /// Bytes the handler reported consumed.
        consumed: usize,
        /// Bytes that were readable.
        available: usize,
    },

    /// Receive cursor bounds were violated.
    #[error("receive buffer: {0}")]
    Cursor(#[from] CursorError),

    /// The application handler failed while processing input.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An application handler callback panicked.
    #[error("handler panicked")]
    HandlerPanicked,

    /// [`Connection::start`] was called on a connection that is not pending.
    #[error("connection already started or closed")]
    AlreadyStarted,
}

impl ConnectionError {
    /// Wrap an application error.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ConnectionError::Handler(err.into())
    }

    fn is_transport(&self) -> bool {
        matches!(self, ConnectionError::Io(_))
    }
}

/// Lifecycle callbacks for a [`Connection`].
///
/// Callbacks run on runtime worker threads and must not block. For a given
/// connection `on_connected` comes first, `on_disconnected` comes last and
/// exactly once, and nothing is called after it. A panic in any callback
/// terminates the connection with [`ConnectionError::HandlerPanicked`].
pub trait ConnectionHandler: Send + Sync + 'static {
    /// The socket is attached. Called once.
    fn on_connected(&self, _conn: &Arc<Connection>, _peer: SocketAddr) {}

    /// Bytes arrived. Return how many leading bytes of `data` were used;
    /// the remainder is handed back, with more data appended, next time.
    fn on_recv(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<usize, ConnectionError>;

    /// A flush of `bytes` bytes completed.
    fn on_send(&self, _conn: &Arc<Connection>, _bytes: usize) {}

    /// The connection is gone. Called exactly once.
    fn on_disconnected(&self, _conn: &Arc<Connection>, _peer: SocketAddr, _reason: &DisconnectReason) {
    }
}

/// Receive-side sizing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial receive buffer capacity. Default: 64 KiB.
    pub recv_buffer_size: usize,
    /// Free space guaranteed before each receive, at least one byte.
    /// Default: 4 KiB.
    pub min_recv_space: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 64 * 1024,
            min_recv_space: 4 * 1024,
        }
    }
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Bytes>,
    flushing: bool,
}

/// A TCP connection with thread-safe, non-blocking sends.
pub struct Connection {
    id: ConnectionId,
    handler: Arc<dyn ConnectionHandler>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    peer: OnceLock<SocketAddr>,
    outbound: Mutex<Outbound>,
    flush_wake: Notify,
    shutdown: Notify,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer", &self.peer.get())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create an unstarted connection driven by `handler`.
    pub fn new(handler: Arc<dyn ConnectionHandler>, config: ConnectionConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Pending);
        Arc::new(Self {
            id: CONNECTION_IDS.next_id(),
            handler,
            config,
            state,
            peer: OnceLock::new(),
            outbound: Mutex::new(Outbound::default()),
            flush_wake: Notify::new(),
            shutdown: Notify::new(),
        })
    }

    /// Process-unique identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, once started.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether sends are currently accepted.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of queued buffers not yet handed to the socket.
    pub fn pending_sends(&self) -> usize {
        self.outbound.lock().queue.len()
    }

    /// Wait until teardown has completed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    /// Attach `stream` and spawn the driver task on the current runtime.
    ///
    /// Fails with [`ConnectionError::AlreadyStarted`] unless the connection
    /// is pending.
    pub fn start(self: &Arc<Self>, stream: TcpStream) -> Result<(), ConnectionError> {
        let peer = stream.peer_addr()?;
        let started = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Pending {
                *s = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ConnectionError::AlreadyStarted);
        }
        let _ = self.peer.set(peer);

        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.drive(stream, peer).await });
        Ok(())
    }

    /// Queue `data` for sending. Never blocks.
    ///
    /// Returns `false` and drops the data if the connection is not
    /// connected.
    pub fn send(&self, data: Bytes) -> bool {
        let mut out = self.outbound.lock();
        if *self.state.borrow() != ConnectionState::Connected {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        out.queue.push_back(data);
        if !out.flushing {
            out.flushing = true;
            drop(out);
            self.flush_wake.notify_one();
        }
        true
    }

    /// Request teardown. Idempotent and safe from any thread or callback.
    ///
    /// Returns `true` for the call that initiated teardown. A pending
    /// connection goes straight to [`ConnectionState::Disconnected`]
    /// without callbacks.
    pub fn disconnect(&self) -> bool {
        let mut was_pending = false;
        let initiated = self.state.send_if_modified(|s| match *s {
            ConnectionState::Connected => {
                *s = ConnectionState::Disconnecting;
                true
            }
            ConnectionState::Pending => {
                *s = ConnectionState::Disconnected;
                was_pending = true;
                true
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => false,
        });
        if initiated && !was_pending {
            self.shutdown.notify_one();
        }
        initiated
    }

    fn claim_teardown(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Disconnecting;
                true
            } else {
                false
            }
        })
    }

    async fn drive(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!("Connection {:?} established with {peer}", self.id);
        let (reader, mut writer) = stream.into_split();
        let outcome = match self.guarded(|| self.handler.on_connected(&self, peer)) {
            Err(err) => self.failure(err),
            Ok(()) => tokio::select! {
                result = self.recv_loop(reader) => match result {
                    Ok(()) => DisconnectReason::PeerClosed,
                    Err(err) => self.failure(err),
                },
                err = self.flush_loop(&mut writer) => self.failure(err),
                () = self.shutdown.notified() => DisconnectReason::Local,
            },
        };

        // A local disconnect that raced with the failure still wins.
        let reason = if self.claim_teardown() {
            outcome
        } else {
            DisconnectReason::Local
        };

        let discarded = {
            let mut out = self.outbound.lock();
            out.flushing = false;
            std::mem::take(&mut out.queue).len()
        };
        if discarded > 0 {
            tracing::debug!(
                "Connection {:?} discarded {discarded} unsent buffers",
                self.id
            );
        }
        let _ = writer.shutdown().await;
        drop(writer);

        tracing::info!("Connection {:?} to {peer} closed: {reason:?}", self.id);
        let finished = self.guarded(|| self.handler.on_disconnected(&self, peer, &reason));
        if let Err(err) = finished {
            tracing::warn!("Connection {:?} on_disconnected: {err}", self.id);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn failure(&self, err: ConnectionError) -> DisconnectReason {
        if err.is_transport() {
            tracing::debug!("Connection {:?} transport failure: {err}", self.id);
        } else {
            tracing::warn!("Connection {:?} terminated: {err}", self.id);
        }
        DisconnectReason::Error(err.to_string())
    }

    /// Returns `Ok(())` when the peer closes the stream.
    async fn recv_loop(self: &Arc<Self>, mut reader: OwnedReadHalf) -> Result<(), ConnectionError> {
        let mut cursor = ReceiveCursor::new(self.config.recv_buffer_size);
        loop {
            cursor.compact(self.config.min_recv_space.max(1));
            let n = reader.read(cursor.write_view()).await?;
            if n == 0 {
                return Ok(());
            }
            cursor.on_write(n)?;
            tracing::trace!("Connection {:?} received {n} bytes", self.id);
            if !self.is_connected() {
                return Ok(());
            }

            let available = cursor.readable();
            let consumed = self.dispatch_recv(cursor.read_view())?;
            if consumed > available {
                return Err(ConnectionError::ConsumedOutOfRange {
                    consumed,
                    available,
                });
            }
            cursor.on_read(consumed)?;
        }
    }

    fn dispatch_recv(self: &Arc<Self>, data: &[u8]) -> Result<usize, ConnectionError> {
        self.guarded(|| self.handler.on_recv(self, data))?
    }

    /// Run a handler callback, mapping a panic to [`ConnectionError::HandlerPanicked`].
    fn guarded<T>(&self, callback: impl FnOnce() -> T) -> Result<T, ConnectionError> {
        catch_unwind(AssertUnwindSafe(callback)).map_err(|_| ConnectionError::HandlerPanicked)
    }

    /// Runs until a write fails.
    async fn flush_loop(self: &Arc<Self>, writer: &mut OwnedWriteHalf) -> ConnectionError {
        let mut batch = VecDeque::new();
        loop {
            self.flush_wake.notified().await;
            loop {
                {
                    let mut out = self.outbound.lock();
                    if out.queue.is_empty() {
                        out.flushing = false;
                        break;
                    }
                    std::mem::swap(&mut out.queue, &mut batch);
                }
                match write_batch(writer, &mut batch).await {
                    Ok(sent) => {
                        tracing::trace!("Connection {:?} flushed {sent} bytes", self.id);
                        if let Err(err) = self.guarded(|| self.handler.on_send(self, sent)) {
                            return err;
                        }
                    }
                    Err(err) => return err.into(),
                }
            }
        }
    }
}

/// Write every buffer in `batch`, in order, using vectored writes.
async fn write_batch(
    writer: &mut OwnedWriteHalf,
    batch: &mut VecDeque<Bytes>,
) -> std::io::Result<usize> {
    let mut total = 0;
    while !batch.is_empty() {
        let written = {
            let mut slices = [IoSlice::new(&[]); MAX_IOVECS];
            let mut count = 0;
            for (slot, buf) in slices.iter_mut().zip(batch.iter()) {
                *slot = IoSlice::new(buf);
                count += 1;
            }
            writer.write_vectored(&slices[..count]).await?
        };
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        total += written;
        advance(batch, written);
    }
    Ok(total)
}

fn advance(batch: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = batch.front_mut() else {
            break;
        };
        if front.len() <= n {
            n -= front.len();
            batch.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
}

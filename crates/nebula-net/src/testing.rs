//! Shared helpers for unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionHandler, DisconnectReason,
};

/// A callback observed by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(SocketAddr),
    Recv(usize),
    Send(usize),
    Disconnected(DisconnectReason),
}

/// Handler that records every callback and can be told to misbehave.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    received: Mutex<Vec<u8>>,
    chunk: AtomicUsize,
    disconnect_on_recv: AtomicBool,
    overconsume: AtomicBool,
    panic_on_connected: AtomicBool,
    panic_on_recv: AtomicBool,
    panic_on_send: AtomicBool,
    panic_on_disconnected: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Bytes reported consumed so far, in order.
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub fn connected_count(&self) -> usize {
        self.count(|e| matches!(e, Event::Connected(_)))
    }

    pub fn disconnected_count(&self) -> usize {
        self.count(|e| matches!(e, Event::Disconnected(_)))
    }

    pub fn sent_bytes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .map(|e| match e {
                Event::Send(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn consume_in_chunks_of(&self, chunk: usize) {
        self.chunk.store(chunk, Ordering::SeqCst);
    }

    pub fn disconnect_on_recv(&self) {
        self.disconnect_on_recv.store(true, Ordering::SeqCst);
    }

    pub fn overconsume(&self) {
        self.overconsume.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_connected(&self) {
        self.panic_on_connected.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_recv(&self) {
        self.panic_on_recv.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_send(&self) {
        self.panic_on_send.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_disconnected(&self) {
        self.panic_on_disconnected.store(true, Ordering::SeqCst);
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl ConnectionHandler for Recorder {
    fn on_connected(&self, _conn: &Arc<Connection>, peer: SocketAddr) {
        self.push(Event::Connected(peer));
        if self.panic_on_connected.load(Ordering::SeqCst) {
            panic!("recorder told to panic");
        }
    }

    fn on_recv(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<usize, ConnectionError> {
        self.push(Event::Recv(data.len()));
        if self.panic_on_recv.load(Ordering::SeqCst) {
            panic!("recorder told to panic");
        }
        if self.overconsume.load(Ordering::SeqCst) {
            return Ok(data.len() + 1);
        }
        let consumed = match self.chunk.load(Ordering::SeqCst) {
            0 => data.len(),
            chunk => data.len() / chunk * chunk,
        };
        self.received.lock().extend_from_slice(&data[..consumed]);
        if self.disconnect_on_recv.load(Ordering::SeqCst) {
            conn.disconnect();
        }
        Ok(consumed)
    }

    fn on_send(&self, _conn: &Arc<Connection>, bytes: usize) {
        self.push(Event::Send(bytes));
        if self.panic_on_send.load(Ordering::SeqCst) {
            panic!("recorder told to panic");
        }
    }

    fn on_disconnected(&self, _conn: &Arc<Connection>, _peer: SocketAddr, reason: &DisconnectReason) {
        self.push(Event::Disconnected(reason.clone()));
        if self.panic_on_disconnected.load(Ordering::SeqCst) {
            panic!("recorder told to panic");
        }
    }
}

/// A started server-side connection and the raw client socket talking to it.
pub async fn connected_pair() -> (Arc<Connection>, Arc<Recorder>, TcpStream) {
    let recorder = Recorder::new();
    let (conn, client) = start_pair(recorder.clone(), ConnectionConfig::default()).await;
    (conn, recorder, client)
}

/// Like [`connected_pair`], with a handler and config prepared up front.
pub async fn start_pair(
    recorder: Arc<Recorder>,
    config: ConnectionConfig,
) -> (Arc<Connection>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (stream, _) = accepted.unwrap();

    let conn = Connection::new(recorder, config);
    conn.start(stream).unwrap();
    (conn, client.unwrap())
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn eventually(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

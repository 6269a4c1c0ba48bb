//! TCP accept loop that turns every inbound socket into a started
//! [`Connection`].

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::connection::Connection;
use crate::platform::{SocketConfig, configure_stream, create_listener};

/// Pause after an accept failure that is not tied to a single peer
/// (descriptor or buffer exhaustion) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[cfg(unix)]
const EBADF: i32 = 9;

/// Produces a fresh, unstarted [`Connection`] for each accepted socket.
pub trait ConnectionFactory: Send + Sync {
    /// Build the connection for the next accepted socket.
    fn create(&self) -> Arc<Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> Arc<Connection> + Send + Sync,
{
    fn create(&self) -> Arc<Connection> {
        self()
    }
}

/// Errors that stop the acceptor.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// Binding or listening on the endpoint failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// The requested endpoint.
        addr: SocketAddr,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The listening socket itself is no longer usable.
    #[error("listening socket failed: {0}")]
    Fatal(#[source] std::io::Error),
}

/// Listens on one endpoint and starts a [`Connection`] per accepted socket.
///
/// There is no connection cap or rate limit here; enforce limits in the
/// connection handlers (see [`crate::ConnectionRegistry`]).
pub struct Acceptor {
    listener: TcpListener,
    socket_config: SocketConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Acceptor {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr, socket_config: SocketConfig) -> Result<Self, AcceptError> {
        let listener =
            create_listener(addr, &socket_config).map_err(|source| AcceptError::Bind { addr, source })?;
        Ok(Self::from_listener(listener, socket_config))
    }

    /// Use an already-bound listener.
    pub fn from_listener(listener: TcpListener, socket_config: SocketConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            listener,
            socket_config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Ask a running [`run`](Self::run) to return.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Accept until shut down.
    ///
    /// Per-peer accept failures are logged and skipped. Returns
    /// [`AcceptError::Fatal`] if the listening socket becomes invalid.
    pub async fn run<F: ConnectionFactory>(&self, factory: F) -> Result<(), AcceptError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tracing::info!("Accepting connections on {:?}", self.listener.local_addr());

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.admit(stream, peer, &factory),
                    Err(err) if is_listener_fatal(&err) => {
                        tracing::error!("Listener failed: {err}");
                        return Err(AcceptError::Fatal(err));
                    }
                    Err(err) if is_peer_error(&err) => {
                        tracing::debug!("Accept failed for one peer: {err}");
                    }
                    Err(err) => {
                        tracing::warn!("Accept failed: {err}, retrying in {ACCEPT_BACKOFF:?}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::info!("Acceptor shutting down");
        Ok(())
    }

    fn admit<F: ConnectionFactory>(&self, stream: TcpStream, peer: SocketAddr, factory: &F) {
        if let Err(err) = configure_stream(&stream, &self.socket_config) {
            tracing::debug!("Could not apply socket options for {peer}: {err}");
        }

        let conn = factory.create();
        tracing::info!("Accepted connection {:?} from {peer}", conn.id());
        if let Err(err) = conn.start(stream) {
            tracing::warn!("Could not start connection {:?}: {err}", conn.id());
        }
    }
}

/// Failures caused by one peer going away mid-handshake.
fn is_peer_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}

/// Failures meaning the listening socket itself is broken.
fn is_listener_fatal(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(EBADF) {
        return true;
    }
    matches!(
        err.kind(),
        ErrorKind::InvalidInput | ErrorKind::NotConnected | ErrorKind::Unsupported
    )
}

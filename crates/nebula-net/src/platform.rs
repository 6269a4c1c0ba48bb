//! TCP socket options for listeners and connections.
//!
//! Everything here is plain OS-level configuration applied through
//! [`socket2`]. The transport itself has no application-level timeouts;
//! TCP keepalive is the only liveness mechanism and it is off unless
//! enabled in [`SocketConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// OS keepalive probing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Unanswered probes before the OS drops the connection. Ignored on macOS.
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

/// Options applied to the listening socket and every accepted or
/// connected stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// TCP keepalive, if enabled. Default: disabled.
    pub keepalive: Option<KeepaliveConfig>,
    /// Set `SO_REUSEADDR` on the listener. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Listen backlog. Default: 128.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive: None,
            reuse_addr: !cfg!(target_os = "windows"),
            backlog: 128,
        }
    }
}

/// Apply per-stream options to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(ka) = &config.keepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(ka.idle)
            .with_interval(ka.interval);

        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(ka.retries);

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a non-blocking listener bound to `addr`.
///
/// IPv6 addresses are bound dual-stack so IPv4 clients are accepted too.
/// Must be called from within a tokio runtime.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    TcpListener::from_std(socket.into())
}

//! Outbound connections: the client side of the same transport.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::connection::{Connection, ConnectionError};
use crate::platform::{SocketConfig, configure_stream};

/// Connect to `addr` and start `conn` on the new stream.
///
/// Returns once the TCP handshake is done; `on_connected` follows on the
/// connection's own task. There is no connect timeout; wrap the call in
/// `tokio::time::timeout` if one is needed.
pub async fn connect(
    addr: SocketAddr,
    conn: &Arc<Connection>,
    socket_config: &SocketConfig,
) -> Result<(), ConnectionError> {
    let stream = TcpStream::connect(addr).await?;
    configure_stream(&stream, socket_config)?;
    tracing::debug!("Connection {:?} connected to {addr}", conn.id());
    conn.start(stream)
}

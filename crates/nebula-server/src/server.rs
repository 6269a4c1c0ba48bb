//! Wiring from [`Config`] to a listening [`Acceptor`] serving the lobby.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nebula_config::{Config, ConfigError, SocketOptions, TransportConfig};
use nebula_net::{
    AcceptError, Acceptor, ConnectionConfig, FrameConfig, KeepaliveConfig, SocketConfig,
    set_send_chunk_size,
};

use crate::lobby::Lobby;

/// Errors raised while starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Listening failed.
    #[error(transparent)]
    Accept(#[from] AcceptError),
}

/// A bound lobby server.
pub struct Server {
    acceptor: Acceptor,
    lobby: Arc<Lobby>,
    conn_config: ConnectionConfig,
}

impl Server {
    /// Bind the configured endpoint. Must be called inside a Tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.server.socket_addr()?;
        set_send_chunk_size(config.transport.send_chunk_size);

        let acceptor = Acceptor::bind(addr, socket_config(&config.socket))?;
        let lobby = Lobby::new(
            config.server.max_connections,
            frame_config(&config.transport),
        );
        Ok(Self {
            acceptor,
            lobby,
            conn_config: connection_config(&config.transport),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Shared lobby state.
    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.lobby
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), AcceptError> {
        self.acceptor
            .run(self.lobby.factory(self.conn_config.clone()))
            .await
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.acceptor.shutdown();
        let closed = self.lobby.disconnect_all();
        tracing::info!("Closed {closed} sessions");
    }
}

/// Socket options from the `socket` config section.
pub fn socket_config(opts: &SocketOptions) -> SocketConfig {
    SocketConfig {
        tcp_nodelay: opts.nodelay,
        keepalive: opts.keepalive.then(|| KeepaliveConfig {
            idle: Duration::from_secs(opts.keepalive_idle_secs),
            interval: Duration::from_secs(opts.keepalive_interval_secs),
            retries: opts.keepalive_retries,
        }),
        backlog: opts.backlog,
        ..SocketConfig::default()
    }
}

/// Receive sizing from the `transport` config section.
pub fn connection_config(transport: &TransportConfig) -> ConnectionConfig {
    ConnectionConfig {
        recv_buffer_size: transport.recv_buffer_size,
        min_recv_space: transport.min_recv_space,
    }
}

/// Default framing with the configured frame ceiling.
pub fn frame_config(transport: &TransportConfig) -> FrameConfig {
    FrameConfig {
        max_frame: transport.max_frame,
        ..FrameConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_config_mapping() {
        let mut opts = SocketOptions::default();
        assert_eq!(socket_config(&opts).keepalive, None);

        opts.keepalive = true;
        opts.keepalive_idle_secs = 30;
        opts.nodelay = false;
        let mapped = socket_config(&opts);
        assert!(!mapped.tcp_nodelay);
        assert_eq!(
            mapped.keepalive.map(|k| k.idle),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_transport_mapping() {
        let transport = TransportConfig {
            max_frame: 1024,
            recv_buffer_size: 8192,
            ..TransportConfig::default()
        };
        assert_eq!(frame_config(&transport).max_frame, 1024);
        assert_eq!(frame_config(&transport).min_frame, FrameConfig::default().min_frame);
        assert_eq!(connection_config(&transport).recv_buffer_size, 8192);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_endpoint() {
        let mut config = Config::default();
        config.server.bind_address = "nowhere".to_string();
        assert!(matches!(
            Server::bind(&config),
            Err(ServerError::Config(ConfigError::InvalidEndpoint(_)))
        ));
    }
}

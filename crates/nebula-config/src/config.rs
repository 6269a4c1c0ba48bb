//! Configuration structs with sensible defaults and RON persistence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listening endpoint and admission limits.
    pub server: ServerConfig,
    /// Receive buffer, send chunk and frame size settings.
    pub transport: TransportConfig,
    /// OS-level socket options.
    pub socket: SocketOptions,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Listening endpoint and admission limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, without the port.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Sessions admitted at once. The server enforces this when a session
    /// registers; later connections are accepted and then closed.
    pub max_connections: usize,
}

/// Per-connection buffer sizing and framing limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Initial receive buffer capacity in bytes.
    pub recv_buffer_size: usize,
    /// Free space guaranteed before each receive; 0 is treated as 1.
    pub min_recv_space: usize,
    /// Size of each chunk the send allocator carves packets from.
    pub send_chunk_size: usize,
    /// Largest accepted frame, header included.
    pub max_frame: usize,
}

/// Socket options applied to the listener and accepted streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Enable TCP keepalive probing.
    pub keepalive: bool,
    /// Idle seconds before the first keepalive probe.
    pub keepalive_idle_secs: u64,
    /// Seconds between keepalive probes.
    pub keepalive_interval_secs: u64,
    /// Unanswered probes before the OS drops the connection.
    pub keepalive_retries: u32,
    /// Listen backlog.
    pub backlog: i32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter (e.g., "debug", "info,nebula_net=trace").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            max_connections: 1024,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 64 * 1024,
            min_recv_space: 4 * 1024,
            send_chunk_size: 64 * 1024,
            max_frame: 64 * 1024,
        }
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: false,
            keepalive_idle_secs: 60,
            keepalive_interval_secs: 10,
            keepalive_retries: 3,
            backlog: 128,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// `bind_address:port` as one string, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.bind_address.contains(':') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }

    /// Parse [`endpoint`](Self::endpoint) into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let endpoint = self.endpoint();
        endpoint
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(endpoint))
    }
}

/// Platform config directory for the server, e.g. `~/.config/nebula-server`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("nebula-server"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Re-read the file. Returns `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}

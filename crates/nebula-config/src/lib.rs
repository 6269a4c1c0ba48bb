//! Configuration for the Nebula server.
//!
//! Settings persist to disk as a RON file, every field has a default so
//! partial files load, and the command line can override the common knobs.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, Config, DebugConfig, ServerConfig, SocketOptions, TransportConfig,
    default_config_dir,
};
pub use error::ConfigError;

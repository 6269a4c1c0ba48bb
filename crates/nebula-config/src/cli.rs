//! Command-line argument parsing for the Nebula server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Nebula server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-server", about = "Nebula lobby server")]
pub struct CliArgs {
    /// Address to bind (without port).
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum simultaneous connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Largest accepted frame in bytes.
    #[arg(long)]
    pub max_frame: Option<usize>,

    /// Log level (error, warn, info, debug, trace) or a full filter string.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.bind {
            self.server.bind_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(max) = args.max_frame {
            self.transport.max_frame = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

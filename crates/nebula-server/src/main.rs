//! Nebula lobby server entry point.
//!
//! Run with: `cargo run -p nebula-server -- --port 7777`

use clap::Parser;
use nebula_config::{CliArgs, Config, default_config_dir};
use nebula_server::Server;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .ok_or("could not resolve a config directory; pass --config")?;

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    nebula_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let server = Server::bind(&config)?;
    info!(
        "Nebula server listening on {} (max {} connections)",
        server.local_addr()?,
        config.server.max_connections
    );

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!("Server stopped: {err}");
                return Err(err.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.shutdown();
        }
    }

    Ok(())
}

mod config;
mod logging;
mod server;
mod websocket;

use anyhow::Result;
use clap::Parser;
use relay_sfu::{MemoryEngine, SfuManager};
use std::sync::Arc;
use tracing::info;

use crate::config::{resolve_config_path, Config};
use crate::server::RelayServer;

/// SFU signaling relay
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "RELAY_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = match resolve_config_path(cli.config) {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => Config::load(None)?,
    };

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Relay server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Initialize SFU manager with the in-process engine
    let manager = SfuManager::new(config.sfu.clone());
    manager.attach_engine(Arc::new(MemoryEngine::new(
        config.sfu.rtc_min_port,
        config.sfu.rtc_max_port,
    )));

    // 5. Serve until shutdown
    RelayServer::new(config, manager).start().await
}

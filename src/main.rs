//! callcore - signaling relay entry point

mod args;

use args::Args;
use callcore::config::Config;
use callcore::web::{run_relay_server, RelayState};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal;
use tokio::task;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let (mut config, load_error) = match args.load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("CALLCORE_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("callcore v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("Failed to load config: {}, using defaults", e),
        None => info!("Loaded configuration from {:?}", args.config),
    }

    config.validate()?;

    let state = RelayState::new(config);
    let mut http_handle = task::spawn(async move {
        if let Err(e) = run_relay_server(state).await {
            error!("Relay server error: {}", e);
        }
    });

    // Wait for shutdown signal
    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
            http_handle.abort();
        }
        result = &mut http_handle => {
            if let Err(e) = result {
                error!("Relay task failed: {}", e);
            }
        }
    }

    info!("callcore stopped");
    Ok(())
}

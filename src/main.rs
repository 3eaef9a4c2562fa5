//! sshfs-volume daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sshfs_volume::config::Config;
use sshfs_volume::env::flag_enabled;
use sshfs_volume::mounter::SshfsMounter;
use sshfs_volume::plugin::server;
use sshfs_volume::plugin::PluginApi;
use sshfs_volume::registry::{RegistryConfig, VolumeRegistry};

/// Print usage information
fn print_usage() {
    eprintln!("Usage: sshfs-volume [config.yaml]");
    eprintln!();
    eprintln!("sshfs-volume - Docker volume plugin for sshfs mounts");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Optional configuration file (defaults apply without it)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  DEBUG=1        Enable debug logging");
    eprintln!("  RUST_LOG       Full tracing filter, overrides DEBUG and the config");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    let config = match args.len() {
        1 => Config::default(),
        2 if args[1] == "-h" || args[1] == "--help" => {
            print_usage();
            return Ok(());
        }
        2 => {
            let config_path = PathBuf::from(&args[1]);
            match Config::from_file(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            }
        }
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if flag_enabled("DEBUG") {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(&config.logging.level)
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("sshfs-volume starting");

    // A snapshot we cannot read leaves the mount state unknown; refuse to start
    let mounter = Arc::new(SshfsMounter::new(config.mounter.clone()));
    let registry = match VolumeRegistry::open(RegistryConfig::from(&config), mounter) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("Failed to create the driver {}", e);
            std::process::exit(1);
        }
    };
    info!("{} volume(s) registered", registry.list().len());

    // Set up signal handling for graceful shutdown
    let shutdown = Arc::new(Notify::new());
    let s = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        s.notify_one();
    })?;

    let api = Arc::new(PluginApi::new(registry));
    server::serve(&config.socket, api, shutdown).await?;

    info!("Shutting down");
    Ok(())
}

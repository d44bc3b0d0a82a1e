//! MeshCore Bridge Node - serial to MQTT relay service
//!
//! Loads a YAML configuration, connects the local MeshCore radio and the
//! MQTT broker, and relays traffic until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshcore_bridge::{BridgeConfig, BridgeHandle, MeshBridge};

#[derive(Parser)]
#[command(name = "meshcore-bridge-node")]
#[command(about = "Relay MeshCore packets between a serial radio and an MQTT broker")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the verbosity flag
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.list_ports {
        let ports = meshcore_bridge::list_ports().context("Failed to enumerate serial ports")?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    let config = match BridgeConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting MeshCore bridge v{}: mesh '{}', serial {}, broker {}:{}",
        meshcore_bridge::VERSION,
        config.mesh.id,
        config.serial.port.display(),
        config.mqtt.broker,
        config.mqtt.port
    );

    let (bridge, handle) = MeshBridge::from_config(config);
    tokio::spawn(shutdown_on_signal(handle));

    let stats = bridge.run().await?;
    info!(
        "Bridge stopped: {} frames to bus, {} messages to mesh, {} loops suppressed, {} dropped",
        stats.mesh_to_bus,
        stats.bus_to_mesh,
        stats.loop_suppressed,
        stats.bus_unavailable + stats.serial_unavailable + stats.oversized_messages + stats.write_errors
    );

    Ok(())
}

/// Request shutdown on Ctrl-C or SIGTERM
async fn shutdown_on_signal(handle: BridgeHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }

    handle.shutdown();
}

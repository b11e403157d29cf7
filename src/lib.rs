pub mod ampinvt;      // wire protocol: frame codec and gateway transport
pub mod channels;     // inter-component communication channels
pub mod command;      // write intents and the symbolic command tables
pub mod config;       // configuration management
pub mod coordinator;  // bus arbitrator: polling, commands, health, watchdog
pub mod device;       // per-device health state machine
pub mod error;        // typed transport and frame errors
pub mod mqtt;         // MQTT client and messaging
pub mod options;      // command line options parsing
pub mod prelude;      // common imports and types
pub mod register_map; // declarative telemetry field map
pub mod scheduler;    // periodic time-sync scheduling

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use std::sync::Arc;

/// Wires up every component and runs until shutdown or the coordinator's
/// fatal watchdog fires. The coordinator runs on the calling task; MQTT and
/// the scheduler get their own.
pub async fn app(config: Config) -> Result<()> {
    info!("ampinvt-bridge {} starting", CARGO_PKG_VERSION);

    let config = Arc::new(ConfigWrapper::from_config(config));
    let (channels, command_rx) = Channels::new();

    // ctrl-c -> shutdown broadcast
    let shutdown_tx = channels.shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        let _ = shutdown_tx.send(());
    });

    let register_map = match config.register_file() {
        Some(file) => Arc::new(RegisterMap::from_file(&file)?),
        None => Arc::new(RegisterMap::builtin()),
    };

    info!("Initializing components...");

    let mqtt = Mqtt::new((*config).clone(), channels.clone());
    let mqtt_stop = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt.start().await {
            error!("MQTT task failed: {}", e);
        }
    });

    let scheduler = Scheduler::new((*config).clone(), channels.clone());
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.start().await {
            error!("Scheduler task failed: {}", e);
        }
    });

    let mut coordinator =
        Coordinator::new((*config).clone(), channels.clone(), command_rx, register_map);
    let result = coordinator.start().await;

    // coordinator is done (shutdown or fatal); final availability messages
    // are already queued, so the mqtt sender drains them before stopping
    info!("Stopping components...");
    let _ = channels.shutdown.send(());
    let _ = mqtt_stop.stop().await;

    if let Err(e) = scheduler_handle.await {
        error!("Error waiting for scheduler task: {}", e);
    }
    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for MQTT task: {}", e);
    }

    info!("Shutdown complete");
    result
}

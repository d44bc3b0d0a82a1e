//! MeshBridge - relay service between the local mesh and the message bus
//!
//! Runs two independent flows over the serial and bus links:
//!
//! - mesh → bus: every valid frame from the device is published on
//!   `{root}/{localMeshId}`
//! - bus → mesh: every message from another mesh is written to the device
//!   as one frame; messages tagged with the local mesh id are dropped so
//!   our own publishes never loop back onto the radio
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          MeshBridge                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────┐  frames   ┌────────────┐  publish           │
//! │  │ FrameReader │──────────►│ mesh → bus │────────┐           │
//! │  └─────────────┘           └────────────┘        ▼           │
//! │                                            ┌───────────┐     │
//! │  ┌─────────────┐  write    ┌────────────┐  │  BusLink  │     │
//! │  │ SerialLink  │◄──────────│ bus → mesh │◄─│ supervisor│     │
//! │  └─────────────┘           └────────────┘  └───────────┘     │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcore_bridge::{BridgeConfig, MeshBridge};
//!
//! let config = BridgeConfig::load("config.yaml")?;
//! let (bridge, handle) = MeshBridge::from_config(config);
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! });
//!
//! let stats = bridge.run().await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::ConnectionState;
use crate::bus::{BusConnector, BusLink, BusStats, BusSupervisor, MeshMessage};
use crate::codec::Frame;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::serial::{DeviceOpener, FrameReader, SerialLink, SerialStats};

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames forwarded from the local mesh to the bus
    pub mesh_to_bus: u64,
    /// Messages forwarded from the bus to the local mesh
    pub bus_to_mesh: u64,
    /// Bus messages dropped because they carried the local mesh id
    pub loop_suppressed: u64,
    /// Bus messages too large for a single frame
    pub oversized_messages: u64,
    /// Local frames dropped because the bus was unavailable
    pub bus_unavailable: u64,
    /// Bus messages dropped because the device was unavailable
    pub serial_unavailable: u64,
    /// Bus messages lost to device write errors
    pub write_errors: u64,
    /// Serial link counters
    pub serial: SerialStats,
    /// Bus link counters
    pub bus: BusStats,
}

#[derive(Debug, Default)]
struct RelayCounters {
    mesh_to_bus: AtomicU64,
    bus_to_mesh: AtomicU64,
    loop_suppressed: AtomicU64,
    oversized_messages: AtomicU64,
    bus_unavailable: AtomicU64,
    serial_unavailable: AtomicU64,
    write_errors: AtomicU64,
}

/// Handle for observing and stopping a running bridge
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    cancel: CancellationToken,
    counters: Arc<RelayCounters>,
    serial: SerialLink,
    bus: BusLink,
}

impl BridgeHandle {
    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Bridge shutdown requested");
        }
        self.cancel.cancel();
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get bridge statistics
    pub fn stats(&self) -> BridgeStats {
        let c = &self.counters;
        BridgeStats {
            mesh_to_bus: c.mesh_to_bus.load(Ordering::Relaxed),
            bus_to_mesh: c.bus_to_mesh.load(Ordering::Relaxed),
            loop_suppressed: c.loop_suppressed.load(Ordering::Relaxed),
            oversized_messages: c.oversized_messages.load(Ordering::Relaxed),
            bus_unavailable: c.bus_unavailable.load(Ordering::Relaxed),
            serial_unavailable: c.serial_unavailable.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
            serial: self.serial.stats(),
            bus: self.bus.stats(),
        }
    }

    /// Current serial link state
    pub fn serial_state(&self) -> ConnectionState {
        self.serial.state()
    }

    /// Current bus link state
    pub fn bus_state(&self) -> ConnectionState {
        self.bus.state()
    }

    /// Observe serial link state changes
    pub fn watch_serial(&self) -> watch::Receiver<ConnectionState> {
        self.serial.watch_state()
    }

    /// Observe bus link state changes
    pub fn watch_bus(&self) -> watch::Receiver<ConnectionState> {
        self.bus.watch_state()
    }
}

/// Relay service between a MeshCore device and the message bus
pub struct MeshBridge {
    config: BridgeConfig,
    serial: SerialLink,
    frames: FrameReader,
    bus: BusLink,
    supervisor: BusSupervisor,
    inbound_rx: mpsc::Receiver<MeshMessage>,
    handle: BridgeHandle,
}

impl MeshBridge {
    /// Create a new bridge over the given device and broker
    pub fn new(
        config: BridgeConfig,
        opener: Arc<dyn DeviceOpener>,
        connector: Arc<dyn BusConnector>,
    ) -> (Self, BridgeHandle) {
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size.max(1));

        let (serial, frames) =
            SerialLink::new(opener, &config.reconnect.serial, cancel.child_token());
        let (bus, supervisor) =
            BusLink::new(&config, connector, inbound_tx, cancel.child_token());

        let handle = BridgeHandle {
            cancel,
            counters: Arc::new(RelayCounters::default()),
            serial: serial.clone(),
            bus: bus.clone(),
        };

        let bridge = Self {
            config,
            serial,
            frames,
            bus,
            supervisor,
            inbound_rx,
            handle: handle.clone(),
        };

        (bridge, handle)
    }

    /// Create a bridge over the configured serial port and MQTT broker
    #[cfg(all(feature = "serial", feature = "mqtt"))]
    pub fn from_config(config: BridgeConfig) -> (Self, BridgeHandle) {
        let opener = Arc::new(crate::serial::TtyOpener::from_config(&config.serial));
        let connector = Arc::new(crate::bus::MqttConnector::from_config(&config));
        Self::new(config, opener, connector)
    }

    /// Get a handle to this bridge
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Run both relay flows until shutdown is requested
    ///
    /// Link failures never end the bridge; they are retried by each link.
    /// Returns the final statistics.
    pub async fn run(self) -> Result<BridgeStats> {
        self.config.validate()?;

        let MeshBridge {
            config,
            serial,
            frames,
            bus,
            supervisor,
            inbound_rx,
            handle,
        } = self;

        info!(
            mesh_id = %config.mesh.id,
            publish = %config.publish_topic(),
            subscribe = %config.subscribe_filter(),
            "Starting MeshCore bridge"
        );

        let bus_task = tokio::spawn(supervisor.run());
        let mesh_to_bus = tokio::spawn(relay_mesh_to_bus(
            frames,
            bus,
            config.mesh.id.clone(),
            handle.counters.clone(),
        ));
        let bus_to_mesh = tokio::spawn(relay_bus_to_mesh(
            inbound_rx,
            serial.clone(),
            config.mesh.id.clone(),
            handle.counters.clone(),
            handle.cancel.clone(),
        ));

        handle.cancel.cancelled().await;
        info!("Stopping MeshCore bridge");

        for (name, task) in [
            ("mesh->bus", mesh_to_bus),
            ("bus->mesh", bus_to_mesh),
            ("bus", bus_task),
        ] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Bridge task failed");
            }
        }
        serial.close().await;

        let stats = handle.stats();
        info!(
            mesh_to_bus = stats.mesh_to_bus,
            bus_to_mesh = stats.bus_to_mesh,
            loop_suppressed = stats.loop_suppressed,
            "MeshCore bridge stopped"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for MeshBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshBridge")
            .field("mesh_id", &self.config.mesh.id)
            .field("serial", &self.serial)
            .field("bus", &self.bus)
            .finish()
    }
}

async fn relay_mesh_to_bus(
    mut frames: FrameReader,
    bus: BusLink,
    mesh_id: String,
    counters: Arc<RelayCounters>,
) {
    while let Some(frame) = frames.next_frame().await {
        trace!(size = frame.payload().len(), "Relaying frame to bus");
        if bus.publish(&mesh_id, frame.payload()).await {
            counters.mesh_to_bus.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.bus_unavailable.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("Mesh to bus relay stopped");
}

async fn relay_bus_to_mesh(
    mut inbound: mpsc::Receiver<MeshMessage>,
    serial: SerialLink,
    local_mesh_id: String,
    counters: Arc<RelayCounters>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        forward_to_mesh(&serial, &local_mesh_id, message, &counters).await;
    }
    debug!("Bus to mesh relay stopped");
}

async fn forward_to_mesh(
    serial: &SerialLink,
    local_mesh_id: &str,
    message: MeshMessage,
    counters: &RelayCounters,
) {
    if message.mesh_id == local_mesh_id {
        counters.loop_suppressed.fetch_add(1, Ordering::Relaxed);
        trace!("Dropping bus message from local mesh");
        return;
    }

    let size = message.payload.len();
    match serial.write(&Frame::new(message.payload)).await {
        Ok(()) => {
            counters.bus_to_mesh.fetch_add(1, Ordering::Relaxed);
            debug!(from = %message.mesh_id, size, "Forwarded bus message to mesh");
        }
        Err(BridgeError::LinkUnavailable { .. }) => {
            counters.serial_unavailable.fetch_add(1, Ordering::Relaxed);
            debug!(from = %message.mesh_id, "Serial link unavailable, dropping bus message");
        }
        Err(e @ BridgeError::PayloadTooLarge { .. }) => {
            counters.oversized_messages.fetch_add(1, Ordering::Relaxed);
            warn!(from = %message.mesh_id, error = %e, "Dropping oversized bus message");
        }
        Err(e) => {
            counters.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(from = %message.mesh_id, error = %e, "Failed to write bus message to mesh");
        }
    }
}

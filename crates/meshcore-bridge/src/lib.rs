//! MeshCore serial ↔ MQTT bridge
//!
//! This crate relays MeshCore packets between a radio attached over a
//! serial port and a publish/subscribe message bus, so that separate
//! meshes can exchange traffic through a shared broker.
//!
//! # Architecture
//!
//! The bridge operates in three layers:
//!
//! 1. **Framing** - [`codec`] turns the serial byte stream into validated
//!    frames and back
//! 2. **Links** - [`SerialLink`] and [`BusLink`] each own one connection
//!    and reconnect on their own with exponential backoff
//! 3. **Relay** - [`MeshBridge`] forwards frames to the bus and bus
//!    messages from other meshes to the radio
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: meshcore-bridge = { version = "0.1", features = ["full"] }
//!
//! use meshcore_bridge::{BridgeConfig, MeshBridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::load("config.yaml")?;
//!     let (bridge, handle) = MeshBridge::from_config(config);
//!
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.shutdown();
//!     });
//!
//!     let stats = bridge.run().await?;
//!     println!("Forwarded {} frames to the bus", stats.mesh_to_bus);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - tty device access through tokio-serial
//! - `mqtt` - MQTT broker access through rumqttc
//! - `full` - Enable both
//!
//! # Topics
//!
//! Each bridge publishes its local traffic on `{root}/{meshId}` and
//! subscribes to `{root}/+`. Bodies are the raw packet bytes, base64
//! encoded. Messages carrying the bridge's own mesh id are never written
//! back to the radio.
//!
//! # Frame Format
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 2 | Magic `0xC0 0x3E` |
//! | 2 | Payload length, little-endian |
//! | n | Payload, at most 255 bytes |
//! | 2 | Fletcher-16 over length and payload, little-endian |

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod serial;

// Testing utilities
pub mod test_utils;

pub use backoff::{Backoff, ConnectionState, Reconnector};
pub use bridge::{BridgeHandle, BridgeStats, MeshBridge};
pub use bus::{
    decode_body, encode_body, parse_mesh_topic, BusConnector, BusDelivery, BusInbound, BusLink,
    BusPublisher, BusSession, BusStats, BusSupervisor, MeshMessage,
};
pub use codec::{
    encode, fletcher16, try_decode, CorruptReason, DecodeOutcome, DecoderStats, Frame,
    FrameDecoder,
};
pub use config::{
    BridgeConfig, BridgeConfigBuilder, MeshConfig, MqttConfig, ReconnectConfig,
    ReconnectSettings, SerialConfig,
};
pub use error::{BridgeError, Result};
pub use serial::{BoxedDevice, DeviceIo, DeviceOpener, FrameReader, SerialLink, SerialStats};

#[cfg(feature = "mqtt")]
pub use bus::MqttConnector;
#[cfg(feature = "serial")]
pub use serial::{list_ports, TtyOpener};

pub use test_utils::{MockBroker, MockSerialDevice};

// Protocol constants re-exports
pub use codec::{FRAME_MAGIC, MAX_FRAME_SIZE, MAX_PAYLOAD};
pub use config::{DEFAULT_BAUD_RATE, DEFAULT_MQTT_PORT, DEFAULT_ROOT_TOPIC};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

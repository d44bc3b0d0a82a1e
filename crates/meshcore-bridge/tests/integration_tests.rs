//! Integration tests for the MeshCore serial ↔ MQTT bridge
//!
//! These tests run complete bridges over in-memory devices and brokers:
//! - Traffic in both directions, byte-exact on the wire
//! - Loop suppression for the bridge's own publishes
//! - Recovery after device and broker failures
//! - Two bridges exchanging traffic through one broker
//! - Bounded shutdown

use bytes::Bytes;
use meshcore_bridge::test_utils::{wait_for_state, wait_until, DEFAULT_WAIT};
use meshcore_bridge::{
    encode, BridgeConfig, BridgeConfigBuilder, BridgeError, BridgeHandle, BridgeStats,
    ConnectionState, MeshBridge, MockBroker, MockSerialDevice, ReconnectConfig, MAX_PAYLOAD,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// Test Harness
// ============================================================================

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig::new(Duration::from_millis(5), Duration::from_millis(40))
}

fn config_for(mesh_id: &str) -> BridgeConfig {
    BridgeConfigBuilder::new()
        .mesh_id(mesh_id)
        .broker("broker.local", 1883)
        .serial_port("/dev/ttyUSB0")
        .serial_reconnect(fast_reconnect())
        .bus_reconnect(fast_reconnect())
        .build()
}

struct Harness {
    device: MockSerialDevice,
    broker: MockBroker,
    handle: BridgeHandle,
    task: JoinHandle<meshcore_bridge::Result<BridgeStats>>,
}

impl Harness {
    async fn start(mesh_id: &str) -> Self {
        Self::start_with(mesh_id, MockSerialDevice::new(), MockBroker::new()).await
    }

    async fn start_with(mesh_id: &str, device: MockSerialDevice, broker: MockBroker) -> Self {
        let harness = Self::spawn(mesh_id, device, broker);
        harness.wait_ready().await;
        harness
    }

    fn spawn(mesh_id: &str, device: MockSerialDevice, broker: MockBroker) -> Self {
        let (bridge, handle) = MeshBridge::new(
            config_for(mesh_id),
            Arc::new(device.clone()),
            Arc::new(broker.clone()),
        );
        let task = tokio::spawn(bridge.run());
        Self {
            device,
            broker,
            handle,
            task,
        }
    }

    async fn wait_ready(&self) {
        assert!(wait_for_state(self.handle.watch_serial(), ConnectionState::Connected).await);
        assert!(wait_for_state(self.handle.watch_bus(), ConnectionState::Connected).await);
    }

    async fn stop(self) -> BridgeStats {
        self.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("bridge did not stop in time")
            .expect("bridge task panicked")
            .expect("bridge returned an error")
    }
}

// ============================================================================
// Relay Tests
// ============================================================================

#[tokio::test]
async fn test_bus_message_written_as_frame() {
    let harness = Harness::start("west").await;

    assert!(harness.broker.deliver("meshcore/east", "AQI="));
    let frames = harness.device.wait_for_frames(1, DEFAULT_WAIT).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(
        harness.device.written(),
        vec![0xC0, 0x3E, 0x02, 0x00, 0x01, 0x02, 0x05, 0x0C]
    );

    let stats = harness.stop().await;
    assert_eq!(stats.bus_to_mesh, 1);
    assert_eq!(stats.serial.frames_written, 1);
}

#[tokio::test]
async fn test_serial_frame_published_as_base64() {
    let harness = Harness::start("cabin").await;

    harness.device.inject(&[0xC0, 0x3E, 0x01, 0x00, 0xAA, 0xAB, 0xAD]).await.unwrap();
    let published = harness.broker.wait_for_published(1, DEFAULT_WAIT).await;
    assert_eq!(
        published,
        vec![("meshcore/cabin".to_string(), Bytes::from_static(b"qg=="))]
    );

    let stats = harness.stop().await;
    assert_eq!(stats.mesh_to_bus, 1);
    assert_eq!(stats.bus.published, 1);
}

#[tokio::test]
async fn test_own_mesh_id_not_written_to_serial() {
    let harness = Harness::start("cabin").await;

    harness.broker.deliver("meshcore/cabin", "qg==");
    harness.broker.deliver("meshcore/east", "AQI=");
    harness.device.wait_for_frames(1, DEFAULT_WAIT).await;

    let frames = harness.device.written_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload().as_ref(), &[1u8, 2][..]);

    let stats = harness.stop().await;
    assert_eq!(stats.loop_suppressed, 1);
    assert_eq!(stats.bus_to_mesh, 1);
}

#[tokio::test]
async fn test_noise_and_corrupt_frames_skipped() {
    let harness = Harness::start("cabin").await;

    let mut stream = vec![0x00, 0xC0, 0xFF, 0x3E, 0x12];
    let mut corrupt = encode(b"broken").unwrap();
    corrupt[6] ^= 0x01;
    stream.extend(corrupt);
    stream.extend(encode(b"intact").unwrap());
    harness.device.inject(&stream).await.unwrap();

    let published = harness.broker.wait_for_published(1, DEFAULT_WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1, Bytes::from(meshcore_bridge::encode_body(b"intact")));

    let stats = harness.stop().await;
    assert_eq!(stats.mesh_to_bus, 1);
    assert_eq!(stats.serial.corrupt_frames, 1);
}

#[tokio::test]
async fn test_malformed_bus_messages_dropped() {
    let harness = Harness::start("cabin").await;

    harness.broker.deliver("meshcore/east", "!!not base64!!");
    harness.broker.deliver("meshcore/east/extra", "AQI=");
    harness.broker.deliver("meshcore/east", "AQI=");
    harness.device.wait_for_frames(1, DEFAULT_WAIT).await;

    assert_eq!(harness.device.written_frames().len(), 1);
    let stats = harness.stop().await;
    assert_eq!(stats.bus.malformed, 2);
    assert_eq!(stats.bus_to_mesh, 1);
}

#[tokio::test]
async fn test_oversized_bus_message_dropped() {
    let harness = Harness::start("cabin").await;

    let too_big = vec![0x55u8; MAX_PAYLOAD + 1];
    harness
        .broker
        .deliver("meshcore/east", meshcore_bridge::encode_body(&too_big));
    let max = vec![0x66u8; MAX_PAYLOAD];
    harness
        .broker
        .deliver("meshcore/east", meshcore_bridge::encode_body(&max));

    let frames = harness.device.wait_for_frames(1, DEFAULT_WAIT).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload().len(), MAX_PAYLOAD);

    let stats = harness.stop().await;
    assert_eq!(stats.oversized_messages, 1);
}

#[tokio::test]
async fn test_concurrent_bus_traffic_frames_intact() {
    let device = MockSerialDevice::with_capacity(16);
    let harness = Harness::start_with("cabin", device, MockBroker::new()).await;

    for i in 0..32u8 {
        let payload = vec![i; 20 + i as usize];
        let mesh = format!("meshcore/mesh{}", i % 4);
        harness
            .broker
            .deliver(&mesh, meshcore_bridge::encode_body(&payload));
    }

    let frames = harness
        .device
        .wait_for_frames(32, Duration::from_secs(10))
        .await;
    assert_eq!(frames.len(), 32);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.payload().as_ref(), vec![i as u8; 20 + i].as_slice());
    }

    harness.stop().await;
}

// ============================================================================
// Recovery Tests
// ============================================================================

#[tokio::test]
async fn test_device_reconnect_resumes_traffic() {
    let harness = Harness::start("cabin").await;

    harness.device.inject_frame(b"one").await.unwrap();
    harness.broker.wait_for_published(1, DEFAULT_WAIT).await;

    harness.device.disconnect().await;
    assert!(wait_until(DEFAULT_WAIT, || harness.device.open_count() >= 2).await);
    assert!(wait_for_state(harness.handle.watch_serial(), ConnectionState::Connected).await);

    harness.device.inject_frame(b"two").await.unwrap();
    let published = harness.broker.wait_for_published(2, DEFAULT_WAIT).await;
    assert_eq!(published.len(), 2);

    harness.broker.deliver("meshcore/east", "AQI=");
    let frames = harness.device.wait_for_frames(1, DEFAULT_WAIT).await;
    assert_eq!(frames[0].payload().as_ref(), &[1u8, 2][..]);

    let stats = harness.stop().await;
    assert_eq!(stats.serial.connects, 2);
    assert_eq!(stats.mesh_to_bus, 2);
}

#[tokio::test]
async fn test_partial_frame_discarded_on_reconnect() {
    let harness = Harness::start("cabin").await;

    let frame = encode(b"split").unwrap();
    harness.device.inject(&frame[..4]).await.unwrap();
    harness.device.disconnect().await;
    assert!(wait_until(DEFAULT_WAIT, || harness.device.open_count() >= 2).await);
    assert!(wait_for_state(harness.handle.watch_serial(), ConnectionState::Connected).await);

    // The tail alone must not complete the stale header
    harness.device.inject(&frame[4..]).await.unwrap();
    harness.device.inject_frame(b"fresh").await.unwrap();

    let published = harness.broker.wait_for_published(1, DEFAULT_WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1, Bytes::from(meshcore_bridge::encode_body(b"fresh")));

    harness.stop().await;
}

#[tokio::test]
async fn test_serial_outage_drops_bus_traffic() {
    let harness = Harness::start("cabin").await;

    harness.device.set_offline(true);
    harness.device.disconnect().await;
    assert!(
        wait_until(DEFAULT_WAIT, || harness.handle.serial_state() != ConnectionState::Connected)
            .await
    );

    harness.broker.deliver("meshcore/east", "AQI=");
    assert!(wait_until(DEFAULT_WAIT, || harness.handle.stats().serial_unavailable == 1).await);
    assert_eq!(harness.handle.bus_state(), ConnectionState::Connected);

    harness.device.set_offline(false);
    assert!(wait_for_state(harness.handle.watch_serial(), ConnectionState::Connected).await);
    harness.broker.deliver("meshcore/east", "AQI=");
    let frames = harness.device.wait_for_frames(1, DEFAULT_WAIT).await;
    assert_eq!(frames.len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_broker_reconnect_resumes_traffic() {
    let harness = Harness::start("cabin").await;

    harness.broker.drop_session();
    assert!(wait_until(DEFAULT_WAIT, || harness.broker.connect_count() >= 2).await);
    assert!(wait_for_state(harness.handle.watch_bus(), ConnectionState::Connected).await);
    assert_eq!(harness.broker.subscriptions(), vec!["meshcore/+", "meshcore/+"]);

    harness.device.inject_frame(b"after").await.unwrap();
    let published = harness.broker.wait_for_published(1, DEFAULT_WAIT).await;
    assert_eq!(published[0].0, "meshcore/cabin");

    let stats = harness.stop().await;
    assert_eq!(stats.bus.connects, 2);
}

#[tokio::test]
async fn test_broker_outage_drops_mesh_traffic() {
    let broker = MockBroker::new();
    broker.set_offline(true);
    let harness = Harness::spawn("cabin", MockSerialDevice::new(), broker);
    assert!(wait_for_state(harness.handle.watch_serial(), ConnectionState::Connected).await);

    harness.device.inject_frame(b"lost").await.unwrap();
    assert!(wait_until(DEFAULT_WAIT, || harness.handle.stats().bus_unavailable == 1).await);
    assert!(harness.broker.published().is_empty());

    harness.broker.set_offline(false);
    harness.wait_ready().await;
    harness.device.inject_frame(b"kept").await.unwrap();
    let published = harness.broker.wait_for_published(1, DEFAULT_WAIT).await;
    assert_eq!(published.len(), 1);

    harness.stop().await;
}

// ============================================================================
// Multi-Bridge Tests
// ============================================================================

#[tokio::test]
async fn test_two_bridges_exchange_through_broker() {
    let broker = MockBroker::new();
    broker.set_echo(true);

    let east = Harness::start_with("east", MockSerialDevice::new(), broker.clone()).await;
    let west = Harness::start_with("west", MockSerialDevice::new(), broker.clone()).await;
    assert_eq!(broker.session_count(), 2);

    east.device.inject_frame(b"from east").await.unwrap();
    let frames = west.device.wait_for_frames(1, DEFAULT_WAIT).await;
    assert_eq!(frames[0].payload().as_ref(), b"from east");

    west.device.inject_frame(b"from west").await.unwrap();
    let frames = east.device.wait_for_frames(1, DEFAULT_WAIT).await;
    assert_eq!(frames[0].payload().as_ref(), b"from west");

    // Each bridge also heard its own publish and kept it off its radio
    assert!(wait_until(DEFAULT_WAIT, || east.handle.stats().loop_suppressed == 1).await);
    assert!(wait_until(DEFAULT_WAIT, || west.handle.stats().loop_suppressed == 1).await);
    assert_eq!(east.device.written_frames().len(), 1);
    assert_eq!(west.device.written_frames().len(), 1);

    let west_stats = west.stop().await;
    let east_stats = east.stop().await;
    assert_eq!(west_stats.mesh_to_bus, 1);
    assert_eq!(west_stats.bus_to_mesh, 1);
    assert_eq!(east_stats.mesh_to_bus, 1);
    assert_eq!(east_stats.bus_to_mesh, 1);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_is_bounded_during_backoff() {
    let device = MockSerialDevice::new();
    device.set_offline(true);
    let broker = MockBroker::new();
    broker.set_offline(true);

    let mut config = config_for("cabin");
    let slow = ReconnectConfig::new(Duration::from_secs(30), Duration::from_secs(120));
    config.reconnect.serial = slow;
    config.reconnect.bus = slow;

    let (bridge, handle) = MeshBridge::new(config, Arc::new(device), Arc::new(broker));
    let task = tokio::spawn(bridge.run());
    assert!(wait_for_state(handle.watch_serial(), ConnectionState::BackingOff).await);

    handle.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("shutdown waited for the backoff")
        .unwrap()
        .unwrap();
    assert_eq!(stats.mesh_to_bus, 0);
    assert_eq!(handle.serial_state(), ConnectionState::Disconnected);
    assert_eq!(handle.bus_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_invalid_config_fails_run() {
    let mut config = config_for("bad/id");
    config.mqtt.broker = String::new();

    let (bridge, _handle) = MeshBridge::new(
        config,
        Arc::new(MockSerialDevice::new()),
        Arc::new(MockBroker::new()),
    );
    match bridge.run().await {
        Err(BridgeError::InvalidConfig(reason)) => {
            assert!(reason.contains("mesh.id"));
            assert!(reason.contains("mqtt.broker"));
        }
        other => panic!("expected InvalidConfig, got {:?}", other),
    }
}

#[tokio::test]
async fn test_yaml_config_drives_bridge() {
    let yaml = r#"
mesh:
  id: lakeside
mqtt:
  broker: broker.local
  root_topic: radios
serial:
  port: /dev/ttyACM0
reconnect:
  serial:
    initial_delay: 5ms
    max_delay: 40ms
  bus:
    initial_delay: 5ms
    max_delay: 40ms
"#;
    let config = BridgeConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.publish_topic(), "radios/lakeside");
    assert_eq!(config.client_id(), "meshcore-bridge-lakeside");

    let device = MockSerialDevice::new();
    let broker = MockBroker::new();
    let (bridge, handle) =
        MeshBridge::new(config, Arc::new(device.clone()), Arc::new(broker.clone()));
    let task = tokio::spawn(bridge.run());
    assert!(wait_for_state(handle.watch_bus(), ConnectionState::Connected).await);
    assert!(wait_for_state(handle.watch_serial(), ConnectionState::Connected).await);
    assert_eq!(broker.subscriptions(), vec!["radios/+"]);

    device.inject_frame(b"\x01").await.unwrap();
    let published = broker.wait_for_published(1, DEFAULT_WAIT).await;
    assert_eq!(published[0].0, "radios/lakeside");

    handle.shutdown();
    task.await.unwrap().unwrap();
}

//! In-memory devices and brokers for testing without hardware
//!
//! [`MockSerialDevice`] stands in for the tty behind a [`SerialLink`]: each
//! open creates a fresh in-memory duplex pipe, bytes written by the bridge
//! are collected, and tests inject bytes as if the radio had sent them.
//! [`MockBroker`] does the same for the message bus.
//!
//! [`SerialLink`]: crate::serial::SerialLink
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcore_bridge::test_utils::{MockBroker, MockSerialDevice};
//!
//! let device = MockSerialDevice::new();
//! let broker = MockBroker::new();
//! let (bridge, handle) = MeshBridge::new(config, Arc::new(device.clone()), Arc::new(broker.clone()));
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backoff::ConnectionState;
use crate::bus::{BusConnector, BusDelivery, BusInbound, BusPublisher, BusSession};
use crate::codec::{Frame, FrameDecoder};
use crate::error::{BridgeError, Result};
use crate::serial::{BoxedDevice, DeviceOpener};

/// Default pipe capacity for mock devices
const DEFAULT_PIPE_CAPACITY: usize = 1024;

/// How long the wait helpers poll before giving up
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Wait for a link to reach `state`
pub async fn wait_for_state(
    mut rx: watch::Receiver<ConnectionState>,
    state: ConnectionState,
) -> bool {
    tokio::time::timeout(DEFAULT_WAIT, rx.wait_for(|current| *current == state))
        .await
        .map_or(false, |result| result.is_ok())
}

/// Simulated serial device
#[derive(Clone)]
pub struct MockSerialDevice {
    inner: Arc<DeviceState>,
}

struct DeviceState {
    capacity: usize,
    offline: AtomicBool,
    refuse: AtomicU32,
    attempts: AtomicU32,
    opens: AtomicU32,
    connected: AtomicBool,
    written: Mutex<Vec<u8>>,
    radio: tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MockSerialDevice {
    /// Create a device that accepts opens
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Create a device whose pipe buffers at most `capacity` bytes
    ///
    /// Small capacities force writes to be split across many polls.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(DeviceState {
                capacity,
                offline: AtomicBool::new(false),
                refuse: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
                opens: AtomicU32::new(0),
                connected: AtomicBool::new(false),
                written: Mutex::new(Vec::new()),
                radio: tokio::sync::Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Refuse every open while set
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse the next `n` opens
    pub fn refuse_opens(&self, n: u32) {
        self.inner.refuse.store(n, Ordering::SeqCst);
    }

    /// Open attempts, including refused ones
    pub fn open_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Successful opens
    pub fn open_count(&self) -> u32 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Wait until the device has been opened
    pub async fn wait_connected(&self) -> bool {
        wait_until(DEFAULT_WAIT, || self.is_connected()).await
    }

    /// Send bytes to the bridge as if the radio produced them
    pub async fn inject(&self, bytes: &[u8]) -> Result<()> {
        let mut radio = self.inner.radio.lock().await;
        let Some(writer) = radio.as_mut() else {
            return Err(BridgeError::Disconnected);
        };
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send one encoded frame to the bridge
    pub async fn inject_frame(&self, payload: &[u8]) -> Result<()> {
        self.inject(&crate::codec::encode(payload)?).await
    }

    /// Drop the current connection; the bridge sees end of stream
    pub async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.radio.lock().await.take();
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        debug!("Mock serial device disconnected");
    }

    /// All bytes the bridge has written, across connections
    pub fn written(&self) -> Vec<u8> {
        self.inner.written.lock().clone()
    }

    /// Forget collected bytes
    pub fn clear_written(&self) {
        self.inner.written.lock().clear();
    }

    /// Decode the bytes written so far into frames
    pub fn written_frames(&self) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        decoder.push(&self.written());
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    /// Wait until at least `count` frames were written, returning them all
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> Vec<Frame> {
        wait_until(timeout, || self.written_frames().len() >= count).await;
        self.written_frames()
    }
}

impl Default for MockSerialDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockSerialDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialDevice")
            .field("connected", &self.is_connected())
            .field("opens", &self.open_count())
            .field("written", &self.inner.written.lock().len())
            .finish()
    }
}

#[async_trait]
impl DeviceOpener for MockSerialDevice {
    async fn open(&self) -> Result<BoxedDevice> {
        let state = &self.inner;
        state.attempts.fetch_add(1, Ordering::SeqCst);

        if state.offline.load(Ordering::SeqCst) {
            return Err(BridgeError::PortNotFound(self.name()));
        }
        let refused = state
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BridgeError::PortOpenFailed {
                port: self.name(),
                reason: "simulated open failure".to_string(),
            });
        }

        let (bridge_side, radio_side) = tokio::io::duplex(state.capacity);
        let (mut radio_rx, radio_tx) = tokio::io::split(radio_side);

        let collector = self.inner.clone();
        let pump = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match radio_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => collector.written.lock().extend_from_slice(&buf[..n]),
                }
            }
        });

        *state.radio.lock().await = Some(radio_tx);
        if let Some(previous) = state.pump.lock().replace(pump) {
            previous.abort();
        }
        state.opens.fetch_add(1, Ordering::SeqCst);
        state.connected.store(true, Ordering::SeqCst);

        Ok(Box::new(bridge_side))
    }

    fn name(&self) -> String {
        "mock-serial".to_string()
    }
}

/// Simulated message broker
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerState>,
}

struct BrokerState {
    offline: AtomicBool,
    refuse: AtomicU32,
    attempts: AtomicU32,
    connects: AtomicU32,
    echo: AtomicBool,
    next_session: AtomicU64,
    live_inbound: AtomicUsize,
    sessions: Mutex<Vec<(u64, mpsc::UnboundedSender<BusDelivery>)>>,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Bytes)>>,
}

impl BrokerState {
    fn is_open(&self, session: u64) -> bool {
        self.sessions.lock().iter().any(|(id, _)| *id == session)
    }

    /// Fan a delivery out to every open session
    fn deliver(&self, delivery: BusDelivery) -> bool {
        let mut delivered = false;
        for (_, tx) in self.sessions.lock().iter() {
            delivered |= tx.send(delivery.clone()).is_ok();
        }
        delivered
    }
}

impl MockBroker {
    /// Create a broker that accepts connections
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerState {
                offline: AtomicBool::new(false),
                refuse: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                echo: AtomicBool::new(false),
                next_session: AtomicU64::new(0),
                live_inbound: AtomicUsize::new(0),
                sessions: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Refuse every connect while set
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse the next `n` connects
    pub fn refuse_connects(&self, n: u32) {
        self.inner.refuse.store(n, Ordering::SeqCst);
    }

    /// Deliver published messages back to the subscriber, as a real broker would
    pub fn set_echo(&self, echo: bool) {
        self.inner.echo.store(echo, Ordering::SeqCst);
    }

    /// Connect attempts, including refused ones
    pub fn connect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Successful connects
    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Deliver a message to every connected subscriber
    ///
    /// Returns `false` if no session is connected.
    pub fn deliver(&self, topic: &str, body: impl Into<Bytes>) -> bool {
        self.inner.deliver(BusDelivery {
            topic: topic.to_string(),
            body: body.into(),
        })
    }

    /// End every open session as if the broker restarted
    pub fn drop_session(&self) {
        self.inner.sessions.lock().clear();
        debug!("Mock broker dropped all sessions");
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Inbound halves handed out and not yet dropped by their client
    pub fn live_inbound(&self) -> usize {
        self.inner.live_inbound.load(Ordering::SeqCst)
    }

    /// Every subscribe request received, across sessions
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().clone()
    }

    /// Every message published, across sessions
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner.published.lock().clone()
    }

    /// Wait until at least `count` messages were published, returning them all
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<(String, Bytes)> {
        wait_until(timeout, || self.inner.published.lock().len() >= count).await;
        self.published()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBroker")
            .field("connects", &self.connect_count())
            .field("published", &self.inner.published.lock().len())
            .finish()
    }
}

#[async_trait]
impl BusConnector for MockBroker {
    async fn connect(&self) -> Result<BusSession> {
        let state = &self.inner;
        state.attempts.fetch_add(1, Ordering::SeqCst);

        if state.offline.load(Ordering::SeqCst) {
            return Err(BridgeError::BrokerConnectFailed {
                broker: self.name(),
                reason: "broker offline".to_string(),
            });
        }
        let refused = state
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BridgeError::BrokerConnectFailed {
                broker: self.name(),
                reason: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = state.next_session.fetch_add(1, Ordering::SeqCst);
        state.sessions.lock().push((session, tx));
        state.connects.fetch_add(1, Ordering::SeqCst);
        state.live_inbound.fetch_add(1, Ordering::SeqCst);

        Ok(BusSession {
            publisher: Arc::new(MockPublisher {
                state: self.inner.clone(),
                session,
            }),
            inbound: Box::new(MockInbound {
                rx,
                state: self.inner.clone(),
            }),
        })
    }

    fn name(&self) -> String {
        "mock-broker".to_string()
    }
}

struct MockPublisher {
    state: Arc<BrokerState>,
    session: u64,
}

#[async_trait]
impl BusPublisher for MockPublisher {
    async fn subscribe(&self, filter: &str) -> Result<()> {
        if !self.state.is_open(self.session) {
            return Err(BridgeError::SubscribeFailed {
                filter: filter.to_string(),
                reason: "session closed".to_string(),
            });
        }
        self.state.subscriptions.lock().push(filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        if !self.state.is_open(self.session) {
            return Err(BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: "session closed".to_string(),
            });
        }
        self.state
            .published
            .lock()
            .push((topic.to_string(), body.clone()));
        if self.state.echo.load(Ordering::SeqCst) {
            self.state.deliver(BusDelivery {
                topic: topic.to_string(),
                body,
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session;
        self.state.sessions.lock().retain(|(id, _)| *id != session);
        Ok(())
    }
}

struct MockInbound {
    rx: mpsc::UnboundedReceiver<BusDelivery>,
    state: Arc<BrokerState>,
}

impl Drop for MockInbound {
    fn drop(&mut self) {
        self.state.live_inbound.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusInbound for MockInbound {
    async fn recv(&mut self) -> Result<BusDelivery> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BridgeError::BrokerDisconnected("session closed".to_string()))
    }
}

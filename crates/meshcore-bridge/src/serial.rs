//! Serial link to the local MeshCore device
//!
//! [`SerialLink::new`] returns two halves sharing one device:
//!
//! - [`FrameReader`] owns the read side and the reconnect supervisor. It
//!   turns the raw byte stream into validated [`Frame`]s and reopens the
//!   device whenever it fails. It only stops yielding on shutdown.
//! - [`SerialLink`] is a cheap, clonable write handle. Writes are
//!   serialized by an async mutex held across the whole frame, so two
//!   frames never interleave on the wire.
//!
//! The device itself is reached through [`DeviceOpener`], which lets tests
//! substitute an in-memory device for the real tty.

use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{ConnectionState, Reconnector};
use crate::codec::{Frame, FrameDecoder, MAX_FRAME_SIZE};
use crate::config::ReconnectConfig;
use crate::error::{BridgeError, Result};

#[cfg(feature = "serial")]
use crate::config::SerialConfig;
#[cfg(feature = "serial")]
use std::path::PathBuf;
#[cfg(feature = "serial")]
use std::time::Duration;

/// Buffer size for reading from the device
const READ_BUFFER_SIZE: usize = 512;

/// Byte stream to a serial device
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> DeviceIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An open device connection
pub type BoxedDevice = Box<dyn DeviceIo>;

/// Opens connections to the serial device
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    /// Open the device
    async fn open(&self) -> Result<BoxedDevice>;

    /// Device name for logging
    fn name(&self) -> String;
}

/// Counters for the serial link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialStats {
    /// Successful device opens
    pub connects: u64,
    /// Frames decoded from the device
    pub frames_read: u64,
    /// Frames written to the device
    pub frames_written: u64,
    /// Writes refused because no device was connected
    pub writes_unavailable: u64,
    /// Writes that failed at the device
    pub write_errors: u64,
    /// Corrupt frame candidates discarded
    pub corrupt_frames: u64,
    /// Bytes discarded while resynchronizing
    pub discarded_bytes: u64,
}

#[derive(Debug, Default)]
struct SerialCounters {
    connects: AtomicU64,
    frames_read: AtomicU64,
    frames_written: AtomicU64,
    writes_unavailable: AtomicU64,
    write_errors: AtomicU64,
    corrupt_frames: AtomicU64,
    discarded_bytes: AtomicU64,
}

impl SerialCounters {
    fn snapshot(&self) -> SerialStats {
        SerialStats {
            connects: self.connects.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            writes_unavailable: self.writes_unavailable.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Write side of the current device connection
struct Session {
    writer: WriteHalf<BoxedDevice>,
    /// Cancelled when a write fails so the reader reconnects
    stop: CancellationToken,
}

/// Read side of the current device connection
struct ActiveDevice {
    reader: ReadHalf<BoxedDevice>,
    stop: CancellationToken,
}

enum ReadEvent {
    Shutdown,
    Stopped,
    Read(std::io::Result<usize>),
}

/// Write handle for the serial device
#[derive(Clone)]
pub struct SerialLink {
    name: Arc<str>,
    session: Arc<Mutex<Option<Session>>>,
    state: watch::Receiver<ConnectionState>,
    counters: Arc<SerialCounters>,
}

impl SerialLink {
    /// Create the link; the device is opened once the reader is polled
    pub fn new(
        opener: Arc<dyn DeviceOpener>,
        reconnect: &ReconnectConfig,
        cancel: CancellationToken,
    ) -> (SerialLink, FrameReader) {
        let name: Arc<str> = opener.name().into();
        let session = Arc::new(Mutex::new(None));
        let counters = Arc::new(SerialCounters::default());
        let reconnector = Reconnector::new("serial", reconnect);

        let link = SerialLink {
            name: name.clone(),
            session: session.clone(),
            state: reconnector.subscribe(),
            counters: counters.clone(),
        };

        let reader = FrameReader {
            name,
            opener,
            reconnector,
            decoder: FrameDecoder::new(),
            active: None,
            session,
            counters,
            cancel,
            scratch: vec![0u8; READ_BUFFER_SIZE],
        };

        (link, reader)
    }

    /// Encode and write one frame as a single uninterrupted unit
    ///
    /// Fails with `PayloadTooLarge` before touching the device, and with
    /// `LinkUnavailable` when no device is connected.
    pub async fn write(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;

        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            self.counters.writes_unavailable.fetch_add(1, Ordering::Relaxed);
            debug!(device = %self.name, "Serial device not connected, dropping frame");
            return Err(BridgeError::LinkUnavailable { link: "serial" });
        };

        let result = match session.writer.write_all(&bytes).await {
            Ok(()) => session.writer.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
                trace!(
                    size = bytes.len(),
                    payload_size = frame.payload().len(),
                    "Wrote frame"
                );
                Ok(())
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(device = %self.name, error = %e, "Serial write error");
                session.stop.cancel();
                *guard = None;
                Err(BridgeError::WriteError(e.to_string()))
            }
        }
    }

    /// Write a raw payload as one frame
    pub async fn write_payload(&self, payload: impl Into<bytes::Bytes>) -> Result<()> {
        self.write(&Frame::new(payload)).await
    }

    /// Close the device once any in-flight write has finished
    pub async fn close(&self) {
        close_session(&self.session).await;
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link counters
    pub fn stats(&self) -> SerialStats {
        self.counters.snapshot()
    }
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("device", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

async fn close_session(session: &Mutex<Option<Session>>) {
    let taken = session.lock().await.take();
    if let Some(mut session) = taken {
        session.stop.cancel();
        if let Err(e) = session.writer.shutdown().await {
            debug!(error = %e, "Error shutting down serial writer");
        }
    }
}

/// Reads validated frames from the device, reconnecting as needed
pub struct FrameReader {
    name: Arc<str>,
    opener: Arc<dyn DeviceOpener>,
    reconnector: Reconnector,
    decoder: FrameDecoder,
    active: Option<ActiveDevice>,
    session: Arc<Mutex<Option<Session>>>,
    counters: Arc<SerialCounters>,
    cancel: CancellationToken,
    scratch: Vec<u8>,
}

impl FrameReader {
    /// Wait for the next valid frame
    ///
    /// Device errors are handled internally by reconnecting; `None` means
    /// the link was shut down.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                self.record_decoder_stats();
                self.counters.frames_read.fetch_add(1, Ordering::Relaxed);
                debug!(size = frame.payload().len(), "Received frame from serial");
                return Some(frame);
            }
            self.record_decoder_stats();

            if self.cancel.is_cancelled() {
                self.shutdown().await;
                return None;
            }

            if self.active.is_none() {
                if !self.connect().await {
                    self.shutdown().await;
                    return None;
                }
                continue;
            }
            let Some(active) = self.active.as_mut() else {
                continue;
            };

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => ReadEvent::Shutdown,
                _ = active.stop.cancelled() => ReadEvent::Stopped,
                result = active.reader.read(&mut self.scratch) => ReadEvent::Read(result),
            };

            let lost = match event {
                ReadEvent::Shutdown => {
                    self.shutdown().await;
                    return None;
                }
                ReadEvent::Stopped => {
                    BridgeError::WriteError("session ended by a failed write".to_string())
                }
                ReadEvent::Read(Ok(0)) => BridgeError::Disconnected,
                ReadEvent::Read(Ok(n)) => {
                    trace!(bytes = n, "Read from serial port");
                    self.decoder.push(&self.scratch[..n]);
                    continue;
                }
                ReadEvent::Read(Err(e)) => match read_failure(e) {
                    Some(err) => err,
                    None => continue,
                },
            };

            if !self.connection_lost(&lost).await {
                self.shutdown().await;
                return None;
            }
        }
    }

    /// View the reader as a stream that ends only on shutdown
    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_frame().await.map(|frame| (frame, reader))
        })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.reconnector.state()
    }

    /// Open the device and install its write half before reporting `Connected`
    async fn connect(&mut self) -> bool {
        let opener = self.opener.clone();
        let session = self.session.clone();
        let cancel = self.cancel.clone();
        let active = self
            .reconnector
            .establish(&self.cancel, || {
                let opener = opener.clone();
                let session = session.clone();
                let stop = cancel.child_token();
                async move {
                    let device = opener.open().await?;
                    let (reader, writer) = tokio::io::split(device);
                    *session.lock().await = Some(Session {
                        writer,
                        stop: stop.clone(),
                    });
                    Ok::<_, BridgeError>(ActiveDevice { reader, stop })
                }
            })
            .await;
        let Some(active) = active else {
            return false;
        };

        self.decoder.reset();
        self.active = Some(active);
        self.counters.connects.fetch_add(1, Ordering::Relaxed);

        info!(device = %self.name, "Serial device connected");
        true
    }

    /// Tear down the current connection and wait out the backoff
    ///
    /// Returns `false` if shutdown was requested during the wait.
    async fn connection_lost(&mut self, reason: &BridgeError) -> bool {
        warn!(
            device = %self.name,
            error = %reason,
            code = reason.error_code(),
            failures = self.reconnector.failures() + 1,
            "Serial connection lost, will reconnect"
        );
        self.active = None;
        close_session(&self.session).await;
        self.decoder.reset();
        self.reconnector.mark_disconnected();
        self.reconnector.back_off(&self.cancel).await
    }

    async fn shutdown(&mut self) {
        self.active = None;
        close_session(&self.session).await;
        self.decoder.reset();
        self.reconnector.mark_disconnected();
        debug!(device = %self.name, "Serial reader stopped");
    }

    fn record_decoder_stats(&self) {
        let stats = self.decoder.stats();
        self.counters
            .corrupt_frames
            .store(stats.corrupt, Ordering::Relaxed);
        self.counters
            .discarded_bytes
            .store(stats.discarded_bytes, Ordering::Relaxed);
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("device", &self.name)
            .field("state", &self.reconnector.state())
            .field("buffer_len", &self.decoder.buffered())
            .field("max_frame", &MAX_FRAME_SIZE)
            .finish()
    }
}

/// Map a device read error to the error that ends the session
///
/// Timeouts and interrupted reads are part of normal polling and return
/// `None`.
fn read_failure(err: std::io::Error) -> Option<BridgeError> {
    match err.kind() {
        std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::WouldBlock
        | std::io::ErrorKind::Interrupted => None,
        _ => Some(BridgeError::ReadError(err.to_string())),
    }
}

/// Opens a real serial port with tokio-serial
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct TtyOpener {
    port_path: PathBuf,
    baud_rate: u32,
    timeout: Duration,
}

#[cfg(feature = "serial")]
impl TtyOpener {
    /// Create an opener for the given port
    pub fn new(port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            port_path: port.into(),
            baud_rate,
            timeout: Duration::from_millis(crate::config::DEFAULT_TIMEOUT_MS),
        }
    }

    /// Build from serial configuration
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate).with_timeout(config.timeout)
    }

    /// Set the driver timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl DeviceOpener for TtyOpener {
    async fn open(&self) -> Result<BoxedDevice> {
        use tokio_serial::SerialPortBuilderExt;

        #[cfg(unix)]
        if !self.port_path.exists() {
            return Err(BridgeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| BridgeError::PortOpenFailed {
                port: self.port_path.display().to_string(),
                reason: e.to_string(),
            })?;

        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opened serial port");
        Ok(Box::new(stream))
    }

    fn name(&self) -> String {
        format!("serial:{}", self.port_path.display())
    }
}

/// Describe the serial ports present on this machine
#[cfg(feature = "serial")]
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "{} (USB {:04x}:{:04x}{})",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.product.map(|p| format!(" {}", p)).unwrap_or_default()
            ),
            _ => port.port_name,
        })
        .collect())
}

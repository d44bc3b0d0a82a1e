//! Error types for bridge operations
//!
//! Covers the serial link, the frame codec, the message bus and
//! configuration loading. Most variants are recoverable: the links retry on
//! their own and the bridge only drops the offending message.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Serial Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Device closed the connection
    #[error("Serial port disconnected")]
    Disconnected,

    /// A link was asked to carry traffic while it had no live connection
    #[error("{link} link unavailable")]
    LinkUnavailable {
        /// Which link ("serial" or "bus")
        link: &'static str,
    },

    // ===== Frame Errors =====
    /// Payload does not fit in a single frame
    #[error("Payload too large: {size} bytes exceeds frame maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Bus Errors =====
    /// Broker connection failed
    #[error("Failed to connect to broker {broker}: {reason}")]
    BrokerConnectFailed {
        /// Broker address
        broker: String,
        /// Failure reason
        reason: String,
    },

    /// Broker session ended
    #[error("Broker connection lost: {0}")]
    BrokerDisconnected(String),

    /// Publish rejected by the bus client
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Subscribe rejected by the bus client
    #[error("Subscribe to {filter} failed: {reason}")]
    SubscribeFailed {
        /// Topic filter
        filter: String,
        /// Failure reason
        reason: String,
    },

    /// Inbound message body is not valid base64
    #[error("Invalid base64 body on {topic}: {reason}")]
    InvalidBase64 {
        /// Topic the message arrived on
        topic: String,
        /// Decoder message
        reason: String,
    },

    /// Inbound message arrived on a topic outside `{root}/{meshId}`
    #[error("Unexpected topic: {0}")]
    InvalidTopic(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// Configuration file could not be read or parsed
    #[error("Failed to load configuration from {path}: {reason}")]
    ConfigLoad {
        /// File path
        path: String,
        /// Failure reason
        reason: String,
    },

    // ===== General Errors =====
    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is recoverable by reconnecting
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::Disconnected
                | BridgeError::LinkUnavailable { .. }
                | BridgeError::BrokerConnectFailed { .. }
                | BridgeError::BrokerDisconnected(_)
                | BridgeError::PublishFailed { .. }
                | BridgeError::SubscribeFailed { .. }
                | BridgeError::Io(_)
        )
    }

    /// Check if this is a protocol error (bad data from a peer)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            BridgeError::PayloadTooLarge { .. }
                | BridgeError::InvalidBase64 { .. }
                | BridgeError::InvalidTopic(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::LinkUnavailable { .. } => "LINK_UNAVAILABLE",
            BridgeError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            BridgeError::BrokerConnectFailed { .. } => "BROKER_CONNECT_FAILED",
            BridgeError::BrokerDisconnected(_) => "BROKER_DISCONNECTED",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::SubscribeFailed { .. } => "SUBSCRIBE_FAILED",
            BridgeError::InvalidBase64 { .. } => "INVALID_BASE64",
            BridgeError::InvalidTopic(_) => "INVALID_TOPIC",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::MissingConfig(_) => "MISSING_CONFIG",
            BridgeError::ConfigLoad { .. } => "CONFIG_LOAD",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for BridgeError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind {
            tokio_serial::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

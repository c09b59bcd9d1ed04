//! Error types for bluedroid-core.
//!
//! Every failure here is local to one peripheral, channel, log file or
//! subscriber. The engine turns them into status events rather than
//! stopping the service:
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`Error::ConnectionFailed`] | driver connect | session ends `Failed`, no retry |
//! | [`Error::Read`] | driver reads | status event, poller keeps running |
//! | [`Error::Write`] | sample log | status event, record dropped |
//! | [`Error::LogClosed`] | sample log after close | record dropped |
//! | [`DeliveryError`] | subscriber endpoint | endpoint pruned |
//! | [`Error::Bluetooth`] | btleplug | surfaced through the above |

use std::path::PathBuf;

use thiserror::Error;

use bluedroid_types::ChannelKind;

/// Errors that can occur while acquiring and persisting samples.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Peripheral is not known to the driver (never discovered, or already gone).
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    /// Operation attempted while not connected.
    #[error("Not connected to peripheral")]
    NotConnected,

    /// Connection attempt failed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The peripheral that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// A one-shot read failed.
    #[error("Read of {channel} failed: {reason}")]
    Read {
        channel: ReadTarget,
        reason: String,
    },

    /// Writing a record or command failed.
    #[error("Write failed for {target}: {reason}")]
    Write { target: String, reason: String },

    /// The sample log for this channel is closed or was never opened.
    #[error("Sample log for {0} is closed")]
    LogClosed(ChannelKind),

    /// A sample log file could not be opened.
    #[error("Failed to open sample log {path}: {source}")]
    LogOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The peripheral does not expose the requested characteristic.
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// The driver has no way to perform this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Failed to decode data received from the peripheral.
    #[error("Invalid data: {0}")]
    InvalidData(String),

}

/// What a failed read was trying to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    Channel(ChannelKind),
    DeviceInfo,
}

impl std::fmt::Display for ReadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(kind) => write!(f, "{}", kind),
            Self::DeviceInfo => write!(f, "device info"),
        }
    }
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Device rejected the connection.
    Rejected,
    /// Service discovery failed after the link came up.
    ServiceDiscovery(String),
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "connection rejected by device"),
            Self::ServiceDiscovery(msg) => write!(f, "service discovery failed: {}", msg),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a read failure for a sampled channel.
    pub fn read(channel: ChannelKind, reason: impl Into<String>) -> Self {
        Self::Read {
            channel: ReadTarget::Channel(channel),
            reason: reason.into(),
        }
    }

    /// Create a read failure for the device information block.
    pub fn read_device_info(reason: impl Into<String>) -> Self {
        Self::Read {
            channel: ReadTarget::DeviceInfo,
            reason: reason.into(),
        }
    }

    /// Create a write failure.
    pub fn write(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Write {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }
}

impl From<bluedroid_types::ParseError> for Error {
    fn from(err: bluedroid_types::ParseError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// Failure to hand an event to a subscriber endpoint.
///
/// Any delivery failure means the client is gone; the registry prunes it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// The receiving side was dropped.
    #[error("Subscriber disconnected")]
    Disconnected,

    /// The endpoint reported its own failure.
    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Result type alias using bluedroid-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

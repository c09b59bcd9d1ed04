//! The peripheral driver boundary.
//!
//! Discovery, connection and per-channel reads are consumed through
//! [`PeripheralDriver`] so the engine runs unchanged against real hardware
//! ([`crate::BtleDriver`]) or a scripted stand-in ([`crate::MockDriver`]).
//!
//! Asynchronous notifications arrive on `mpsc` receivers instead of
//! listener callbacks: one stream per scan and one stream per connection.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use bluedroid_types::{Acceleration, ChannelKind, DeviceInfo, LedColor, PeripheralHandle, Sample};

use crate::error::{Error, Result};

/// Buffer size for driver event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events produced by a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peripheral was seen. May repeat for the same peripheral.
    Found(PeripheralHandle),
    /// The scan finished. Always the last event on the stream.
    Complete,
}

/// Events produced by one peripheral connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The link is up and services are resolved.
    Connected,
    /// The connection attempt failed. Terminal.
    ConnectionFailed(String),
    /// The link went down. Terminal.
    Disconnected,
    /// A non-fatal error reported by the peripheral.
    Error(String),
}

/// Access to BLE sensor peripherals.
///
/// Implementations must be safe to call concurrently from many tasks; the
/// engine never holds one of its own locks across these calls.
#[async_trait]
pub trait PeripheralDriver: Send + Sync {
    /// Start a scan.
    ///
    /// The returned stream yields [`DiscoveryEvent::Found`] for each sighting
    /// and ends with [`DiscoveryEvent::Complete`]. Cancelling `cancel` ends
    /// the scan early.
    async fn discover(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<DiscoveryEvent>>;

    /// Begin connecting to a peripheral.
    ///
    /// The outcome is reported on the returned stream, followed by any later
    /// errors and the final disconnect.
    async fn connect(&self, peripheral: &PeripheralHandle)
    -> Result<mpsc::Receiver<ConnectionEvent>>;

    /// Request a disconnect. Completion is reported as
    /// [`ConnectionEvent::Disconnected`] on the connection stream.
    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()>;

    async fn read_acceleration(&self, peripheral: &PeripheralHandle) -> Result<Acceleration>;

    /// Signal strength of the live connection, in dBm.
    async fn read_rssi(&self, peripheral: &PeripheralHandle) -> Result<i16>;

    /// Battery level, in percent.
    async fn read_battery(&self, peripheral: &PeripheralHandle) -> Result<u8>;

    async fn read_device_info(&self, peripheral: &PeripheralHandle) -> Result<DeviceInfo>;

    /// Set the peripheral's indicator LED.
    async fn set_indicator(&self, peripheral: &PeripheralHandle, color: LedColor) -> Result<()>;

    /// Read one channel and timestamp the result on completion.
    async fn read_sample(&self, peripheral: &PeripheralHandle, channel: ChannelKind) -> Result<Sample> {
        match channel {
            ChannelKind::Accelerometer => {
                let accel = self.read_acceleration(peripheral).await?;
                Ok(Sample::acceleration(Sample::now_ms(), accel))
            }
            ChannelKind::Rssi => {
                let rssi = self.read_rssi(peripheral).await?;
                Ok(Sample::rssi(Sample::now_ms(), rssi))
            }
            ChannelKind::Battery => {
                let level = self.read_battery(peripheral).await?;
                Ok(Sample::battery(Sample::now_ms(), level))
            }
            _ => Err(Error::Unsupported("sampling this channel")),
        }
    }
}

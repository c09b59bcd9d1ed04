//! Core types for sensor samples and peripherals.

use core::fmt;
use std::time::Duration;

use bytes::Buf;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Highest sampling rate accepted for any channel, in Hz.
///
/// Above this the truncated period would be zero milliseconds.
pub const MAX_SAMPLING_RATE_HZ: u32 = 1000;

/// Sensor channel sampled on a connected peripheral.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new channels
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum ChannelKind {
    /// Three-axis accelerometer.
    Accelerometer,
    /// Received signal strength of the connection.
    Rssi,
    /// Battery level in percent.
    Battery,
}

impl ChannelKind {
    /// Every channel, in log-file order.
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Accelerometer,
        ChannelKind::Rssi,
        ChannelKind::Battery,
    ];

    /// Short lowercase name, used in log output and file names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Accelerometer => "accelerometer",
            ChannelKind::Rssi => "rssi",
            ChannelKind::Battery => "battery",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert a sampling rate to a polling period.
///
/// The period is `1000 / rate_hz` milliseconds with integer truncation, so
/// 60 Hz polls every 16 ms. Returns `None` for rates outside
/// `1..=MAX_SAMPLING_RATE_HZ`.
///
/// ```
/// use std::time::Duration;
/// use bluedroid_types::sampling_period;
///
/// assert_eq!(sampling_period(60), Some(Duration::from_millis(16)));
/// assert_eq!(sampling_period(1), Some(Duration::from_secs(1)));
/// assert_eq!(sampling_period(0), None);
/// ```
#[must_use]
pub fn sampling_period(rate_hz: u32) -> Option<Duration> {
    if rate_hz == 0 || rate_hz > MAX_SAMPLING_RATE_HZ {
        return None;
    }
    Some(Duration::from_millis(u64::from(1000 / rate_hz)))
}

/// One accelerometer reading, in g.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Acceleration {
    /// Number of bytes in a raw accelerometer payload.
    pub const RAW_LEN: usize = 6;

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Decode three little-endian `i16` axes, multiplying each by `scale`.
    ///
    /// Extra trailing bytes are ignored.
    ///
    /// ```
    /// use bluedroid_types::Acceleration;
    ///
    /// let raw = [0x00, 0x01, 0x00, 0xFF, 0x80, 0x00];
    /// let accel = Acceleration::from_le_bytes(&raw, 1.0 / 256.0).unwrap();
    /// assert_eq!(accel, Acceleration::new(1.0, -1.0, 0.5));
    /// ```
    pub fn from_le_bytes(data: &[u8], scale: f64) -> ParseResult<Self> {
        if data.len() < Self::RAW_LEN {
            return Err(ParseError::InsufficientBytes {
                expected: Self::RAW_LEN,
                actual: data.len(),
            });
        }
        let mut buf = data;
        let x = f64::from(buf.get_i16_le()) * scale;
        let y = f64::from(buf.get_i16_le()) * scale;
        let z = f64::from(buf.get_i16_le()) * scale;
        Ok(Self { x, y, z })
    }
}

/// Value carried by a [`Sample`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum SamplePayload {
    /// Three-axis reading.
    Acceleration(Acceleration),
    /// Single integer reading (RSSI in dBm, battery in percent).
    Value(i64),
}

/// A single timestamped reading from one channel. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub channel: ChannelKind,
    pub payload: SamplePayload,
}

impl Sample {
    pub fn acceleration(timestamp_ms: i64, accel: Acceleration) -> Self {
        Self {
            timestamp_ms,
            channel: ChannelKind::Accelerometer,
            payload: SamplePayload::Acceleration(accel),
        }
    }

    pub fn rssi(timestamp_ms: i64, rssi: i16) -> Self {
        Self {
            timestamp_ms,
            channel: ChannelKind::Rssi,
            payload: SamplePayload::Value(i64::from(rssi)),
        }
    }

    pub fn battery(timestamp_ms: i64, percent: u8) -> Self {
        Self {
            timestamp_ms,
            channel: ChannelKind::Battery,
            payload: SamplePayload::Value(i64::from(percent)),
        }
    }

    /// Current wall-clock time in epoch milliseconds.
    pub fn now_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    /// Serialize as one log record, without the trailing newline.
    ///
    /// ```
    /// use bluedroid_types::{Acceleration, Sample};
    ///
    /// let sample = Sample::acceleration(1000, Acceleration::new(1.0, 2.0, 3.0));
    /// assert_eq!(sample.to_record(), "1000, 1.000000, 2.000000, 3.000000");
    /// assert_eq!(Sample::rssi(1000, -61).to_record(), "1000, -61");
    /// ```
    #[must_use]
    pub fn to_record(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            SamplePayload::Acceleration(a) => write!(
                f,
                "{}, {:.6}, {:.6}, {:.6}",
                self.timestamp_ms, a.x, a.y, a.z
            ),
            SamplePayload::Value(v) => write!(f, "{}, {}", self.timestamp_ms, v),
        }
    }
}

/// Identity of a discovered peripheral.
///
/// `id` is unique per physical device for the lifetime of a scan; `address`
/// is the human-readable form shown in status messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralHandle {
    pub id: String,
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength seen at discovery time.
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            name: None,
            rssi: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// The advertised name, falling back to the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Device Information service contents of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Model number.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Firmware version.
    pub firmware: String,
    /// Hardware revision.
    pub hardware: String,
    /// Software revision.
    pub software: String,
    /// Manufacturer name.
    pub manufacturer: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hardware {}, firmware {}, software {}",
            self.hardware, self.firmware, self.software
        )?;
        if !self.model.is_empty() {
            write!(f, ", model {}", self.model)?;
        }
        Ok(())
    }
}

/// RGB color for a peripheral's indicator LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LedColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl LedColor {
    /// LED off.
    pub const OFF: LedColor = LedColor::new(0, 0, 0);
    /// Shown while a peripheral is connected and sampling.
    pub const CONNECTED: LedColor = LedColor::new(0, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Wire encoding written to the LED characteristic.
    pub fn to_bytes(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub fn is_off(&self) -> bool {
        *self == Self::OFF
    }
}

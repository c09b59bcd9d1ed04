//! Events delivered to subscribed clients.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::Acceleration;

/// A message published to every registered subscriber.
///
/// Serialized with an adjacent `type`/`data` tag so clients in other
/// processes can decode it, e.g. `{"type":"battery_level","data":87}`.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", content = "data", rename_all = "snake_case")
)]
#[non_exhaustive]
pub enum Event {
    /// Human-readable progress or error text.
    Status(String),
    /// A new accelerometer sample.
    AccelerometerReading(Acceleration),
    /// Battery level of a connected peripheral, in percent.
    BatteryLevel(u8),
    /// A peripheral connected and its pollers started.
    SensorStarted,
    /// The service stopped; no further readings follow.
    SensorStopped,
}

impl Event {
    /// Convenience constructor for [`Event::Status`].
    pub fn status(text: impl Into<String>) -> Self {
        Event::Status(text.into())
    }

    /// The status text, if this is a status event.
    pub fn as_status(&self) -> Option<&str> {
        match self {
            Event::Status(text) => Some(text),
            _ => None,
        }
    }
}

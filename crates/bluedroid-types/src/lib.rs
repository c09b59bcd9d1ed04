//! Platform-agnostic types for the BlueDroid sensor service.
//!
//! This crate holds the data shared between the acquisition core
//! (bluedroid-core) and anything that consumes its output.
//!
//! # Features
//!
//! - Sample and channel types, including the on-disk record format
//! - Events published to subscribers
//! - Peripheral identity and device information structures
//! - UUID constants for standard BLE characteristics
//!
//! # Example
//!
//! ```
//! use bluedroid_types::{Acceleration, ChannelKind, Sample};
//!
//! let sample = Sample::acceleration(1_700_000_000_000, Acceleration::new(0.0, 0.0, 1.0));
//! assert_eq!(sample.channel, ChannelKind::Accelerometer);
//! ```

pub mod error;
pub mod event;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use event::Event;
pub use types::{
    Acceleration, ChannelKind, DeviceInfo, LedColor, MAX_SAMPLING_RATE_HZ, PeripheralHandle,
    Sample, SamplePayload, sampling_period,
};
pub use uuid as uuids;

//! Acquisition engine for BLE sensor peripherals.
//!
//! This crate discovers nearby peripherals, connects to each one, samples
//! its channels (acceleration, RSSI, battery) at fixed rates, appends every
//! sample to a per-channel log file, and fans the readings out to any number
//! of subscribers as [`Event`]s.
//!
//! # Components
//!
//! - [`PeripheralDriver`]: the hardware boundary, implemented by
//!   [`BtleDriver`] over `btleplug` and by [`MockDriver`] for tests
//! - [`DiscoveryCoordinator`]: runs a scan and opens a session per peripheral
//! - [`DeviceSession`]: one peripheral's connection state machine
//! - [`PollingScheduler`]: one non-overlapping periodic reader per channel
//! - [`SampleLog`]: append-only per-channel record files
//! - [`SubscriberRegistry`]: event fan-out with dead-client pruning
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bluedroid_core::{
//!     BtleDriver, BtleOptions, DiscoveryCoordinator, SampleLog, SamplingPlan, SessionContext,
//!     SubscriberRegistry,
//! };
//! use bluedroid_types::ChannelKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = Arc::new(BtleDriver::new(BtleOptions::default()).await?);
//!     let registry = Arc::new(SubscriberRegistry::new());
//!     let logs = SampleLog::open("/tmp/bluedroid", &[(ChannelKind::Rssi, "rssi.csv".into())])?;
//!
//!     let (_, mut events) = registry.subscribe();
//!     let coordinator = DiscoveryCoordinator::new(SessionContext {
//!         driver,
//!         registry,
//!         logs: Arc::new(logs),
//!         plan: SamplingPlan::new().channel(ChannelKind::Rssi, Duration::from_millis(1000)),
//!         indicator: false,
//!     });
//!     coordinator.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod mock;
pub mod registry;
pub mod sample_log;
pub mod scheduler;
pub mod session;

pub use ble::{BtleDriver, BtleOptions, get_adapter};
pub use discovery::DiscoveryCoordinator;
pub use driver::{ConnectionEvent, DiscoveryEvent, EVENT_CHANNEL_CAPACITY, PeripheralDriver};
pub use error::{ConnectionFailureReason, DeliveryError, Error, ReadTarget, Result};
pub use mock::{MockDriver, MockDriverBuilder};
pub use registry::{ChannelEndpoint, Endpoint, SubscriberId, SubscriberRegistry};
pub use sample_log::SampleLog;
pub use scheduler::{PollingScheduler, PollingStatsSnapshot, PollingTask, TaskId};
pub use session::{DeviceSession, SamplingPlan, SessionContext, SessionState};

// Re-export from bluedroid-types
pub use bluedroid_types::uuids;
pub use bluedroid_types::{
    Acceleration, ChannelKind, DeviceInfo, Event, LedColor, PeripheralHandle, Sample,
};

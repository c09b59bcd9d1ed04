//! Background sensor acquisition and distribution service.
//!
//! This crate wires the `bluedroid-core` engine into a long-running service:
//! - Loads and validates a TOML configuration
//! - Opens one append-only log per enabled channel
//! - Discovers and connects to every peripheral in range
//! - Samples each channel at its configured rate
//! - Publishes readings and status messages to subscribers
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/bluedroid/service.toml`:
//!
//! ```toml
//! [sampling]
//! accelerometer_hz = 60
//! rssi_hz = 60
//! battery_hz = 1
//!
//! [channels]
//! accelerometer = true
//! rssi = true
//! battery = false
//!
//! [storage]
//! directory = "~/Downloads/bluedroid"
//! accelerometer_file = "accelerometer.csv"
//!
//! [peripheral]
//! indicator = true
//!
//! [ble]
//! scan_duration = 10
//! accelerometer_characteristic = "a495ff21-c5b1-4b44-b512-1370f02d74de"
//! accelerometer_scale = 0.00391
//! ```

pub mod config;
pub mod console;
pub mod controller;

pub use config::{Config, ConfigError, ValidationError, default_config_path};
pub use console::ConsoleEndpoint;
pub use controller::{STOPPED_STATUS, SensorService, ServiceError, ServiceState};

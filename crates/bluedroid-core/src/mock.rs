//! Mock peripheral driver for testing.
//!
//! This module provides a scripted [`PeripheralDriver`] that can be used for
//! unit and integration testing without requiring actual BLE hardware.
//!
//! # Features
//!
//! - **Scripted discovery**: Peripherals added with [`MockDriver::add_peripheral`]
//!   are reported by every scan, in order
//! - **Failure injection**: Fail reads permanently or for the next `n` calls,
//!   refuse connections, or refuse to start a scan
//! - **Latency simulation**: Delay reads and connections to model slow links
//! - **Induced events**: Drop a link or raise a peripheral error at any time
//! - **Observation**: Read counts, in-flight high-water mark, indicator writes

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bluedroid_types::{Acceleration, ChannelKind, DeviceInfo, LedColor, PeripheralHandle};

use crate::driver::{ConnectionEvent, DiscoveryEvent, EVENT_CHANNEL_CAPACITY, PeripheralDriver};
use crate::error::{ConnectionFailureReason, Error, Result};

/// A scripted peripheral driver.
///
/// All peripherals share the same readings; tests that need distinct values
/// per device use separate drivers.
///
/// # Example
///
/// ```
/// use bluedroid_core::{MockDriver, PeripheralDriver};
/// use bluedroid_types::PeripheralHandle;
///
/// #[tokio::main]
/// async fn main() {
///     let driver = MockDriver::builder().acceleration(1.0, 2.0, 3.0).build();
///     let handle = driver.add_mock_peripheral();
///
///     let mut events = driver.connect(&handle).await.unwrap();
///     assert!(events.recv().await.is_some());
///
///     let accel = driver.read_acceleration(&handle).await.unwrap();
///     assert_eq!(accel.x, 1.0);
/// }
/// ```
pub struct MockDriver {
    peripherals: Mutex<Vec<PeripheralHandle>>,
    connected: Mutex<HashSet<String>>,
    links: Mutex<HashMap<String, mpsc::Sender<ConnectionEvent>>>,
    acceleration: RwLock<Acceleration>,
    device_info: RwLock<DeviceInfo>,
    battery: AtomicU8,
    rssi: AtomicI16,
    read_count: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    should_fail: AtomicBool,
    fail_message: RwLock<String>,
    /// Number of reads still to fail before succeeding again.
    remaining_failures: AtomicU32,
    refuse_connections: AtomicBool,
    refuse_discovery: AtomicBool,
    /// Simulated read latency in milliseconds (0 = no delay).
    read_latency_ms: AtomicU64,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    indicator_writes: Mutex<Vec<(String, LedColor)>>,
    disconnect_requests: AtomicU32,
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("peripherals", &self.peripheral_count())
            .field("read_count", &self.read_count())
            .field("should_fail", &self.should_fail.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a mock driver with default readings and no peripherals.
    pub fn new() -> Self {
        MockDriverBuilder::new().build()
    }

    /// Create a builder for configuring a mock driver.
    pub fn builder() -> MockDriverBuilder {
        MockDriverBuilder::new()
    }

    fn default_info() -> DeviceInfo {
        DeviceInfo {
            name: "Mock Bean".to_string(),
            model: "Bean".to_string(),
            serial: "MOCK-0001".to_string(),
            firmware: "201511".to_string(),
            hardware: "E".to_string(),
            software: "1.0".to_string(),
            manufacturer: "Mock".to_string(),
        }
    }

    // --- Scripting ---

    /// Add a peripheral that every subsequent scan reports.
    pub fn add_peripheral(&self, handle: PeripheralHandle) {
        lock(&self.peripherals).push(handle);
    }

    /// Add a peripheral with a random address and return its handle.
    pub fn add_mock_peripheral(&self) -> PeripheralHandle {
        let address = random_address();
        let handle = PeripheralHandle::new(address.clone(), address)
            .with_name("Mock Bean")
            .with_rssi(-55);
        self.add_peripheral(handle.clone());
        handle
    }

    /// Number of scripted peripherals, duplicates included.
    pub fn peripheral_count(&self) -> usize {
        lock(&self.peripherals).len()
    }

    /// Drop the link to a connected peripheral as if it went out of range.
    ///
    /// Returns `false` if the peripheral had no live link.
    pub async fn trigger_disconnect(&self, peripheral: &PeripheralHandle) -> bool {
        lock(&self.connected).remove(&peripheral.id);
        let link = lock(&self.links).remove(&peripheral.id);
        match link {
            Some(tx) => tx.send(ConnectionEvent::Disconnected).await.is_ok(),
            None => false,
        }
    }

    /// Report a non-fatal peripheral error on the connection stream.
    pub async fn trigger_error(&self, peripheral: &PeripheralHandle, message: &str) -> bool {
        let link = lock(&self.links).get(&peripheral.id).cloned();
        match link {
            Some(tx) => tx
                .send(ConnectionEvent::Error(message.to_string()))
                .await
                .is_ok(),
            None => false,
        }
    }

    // --- Test control methods ---

    /// Set the acceleration returned by every read.
    pub async fn set_acceleration(&self, x: f64, y: f64, z: f64) {
        *self.acceleration.write().await = Acceleration::new(x, y, z);
    }

    /// Set battery level.
    pub fn set_battery(&self, level: u8) {
        self.battery.store(level, Ordering::Relaxed);
    }

    /// Set RSSI (signal strength).
    pub fn set_rssi(&self, rssi: i16) {
        self.rssi.store(rssi, Ordering::Relaxed);
    }

    /// Set the device information returned after connecting.
    pub async fn set_device_info(&self, info: DeviceInfo) {
        *self.device_info.write().await = info;
    }

    /// Make every read fail until reset.
    pub async fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::Relaxed);
        if let Some(msg) = message {
            *self.fail_message.write().await = msg.to_string();
        }
    }

    /// Fail the next `count` reads, then succeed.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Report `ConnectionFailed` for every connection attempt.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::Relaxed);
    }

    /// Fail to start scans, as when Bluetooth is disabled.
    pub fn set_refuse_discovery(&self, refuse: bool) {
        self.refuse_discovery.store(refuse, Ordering::Relaxed);
    }

    /// Set simulated read latency.
    ///
    /// Each read operation will be delayed by this duration.
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated connect latency.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    // --- Observation ---

    /// Get the number of channel reads started.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Reset read count and the in-flight high-water mark.
    pub fn reset_read_count(&self) {
        self.read_count.store(0, Ordering::Relaxed);
        self.max_in_flight.store(0, Ordering::Relaxed);
    }

    /// Highest number of reads that were ever pending at the same time.
    pub fn max_concurrent_reads(&self) -> u32 {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    /// Every indicator color written, in order.
    pub fn indicator_writes(&self) -> Vec<(String, LedColor)> {
        lock(&self.indicator_writes).clone()
    }

    /// Number of `disconnect` calls received.
    pub fn disconnect_requests(&self) -> u32 {
        self.disconnect_requests.load(Ordering::Relaxed)
    }

    /// Whether the peripheral currently has a live link.
    pub fn is_connected(&self, peripheral: &PeripheralHandle) -> bool {
        lock(&self.connected).contains(&peripheral.id)
    }

    fn check_connected(&self, peripheral: &PeripheralHandle) -> Result<()> {
        if self.is_connected(peripheral) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    async fn begin_read(&self, channel: Option<ChannelKind>) -> Result<InFlight<'_>> {
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let latency = self.read_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failing = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
            || self.should_fail.load(Ordering::Relaxed);
        if failing {
            let message = self.fail_message.read().await.clone();
            return Err(match channel {
                Some(channel) => Error::read(channel, message),
                None => Error::read_device_info(message),
            });
        }
        Ok(guard)
    }
}

/// Decrements the in-flight counter when a read finishes, however it ends.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn random_address() -> String {
    let bytes: [u8; 6] = rand::random();
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl PeripheralDriver for MockDriver {
    async fn discover(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        if self.refuse_discovery.load(Ordering::Relaxed) {
            return Err(Error::NoAdapter);
        }

        let peripherals = lock(&self.peripherals).clone();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for handle in peripherals {
                if cancel.is_cancelled() || tx.send(DiscoveryEvent::Found(handle)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(DiscoveryEvent::Complete).await;
        });
        Ok(rx)
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<mpsc::Receiver<ConnectionEvent>> {
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if self.refuse_connections.load(Ordering::Relaxed) {
            let reason = ConnectionFailureReason::Rejected.to_string();
            let _ = tx.try_send(ConnectionEvent::ConnectionFailed(reason));
            return Ok(rx);
        }

        debug!("Mock connected to {}", peripheral.address);
        lock(&self.connected).insert(peripheral.id.clone());
        let _ = tx.try_send(ConnectionEvent::Connected);
        lock(&self.links).insert(peripheral.id.clone(), tx);
        Ok(rx)
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        self.disconnect_requests.fetch_add(1, Ordering::Relaxed);
        lock(&self.connected).remove(&peripheral.id);
        let link = lock(&self.links).remove(&peripheral.id);
        if let Some(tx) = link {
            let _ = tx.send(ConnectionEvent::Disconnected).await;
        }
        Ok(())
    }

    async fn read_acceleration(&self, peripheral: &PeripheralHandle) -> Result<Acceleration> {
        self.check_connected(peripheral)?;
        let _guard = self.begin_read(Some(ChannelKind::Accelerometer)).await?;
        Ok(*self.acceleration.read().await)
    }

    async fn read_rssi(&self, peripheral: &PeripheralHandle) -> Result<i16> {
        self.check_connected(peripheral)?;
        let _guard = self.begin_read(Some(ChannelKind::Rssi)).await?;
        Ok(self.rssi.load(Ordering::Relaxed))
    }

    async fn read_battery(&self, peripheral: &PeripheralHandle) -> Result<u8> {
        self.check_connected(peripheral)?;
        let _guard = self.begin_read(Some(ChannelKind::Battery)).await?;
        Ok(self.battery.load(Ordering::Relaxed))
    }

    async fn read_device_info(&self, peripheral: &PeripheralHandle) -> Result<DeviceInfo> {
        self.check_connected(peripheral)?;
        let _guard = self.begin_read(None).await?;
        Ok(self.device_info.read().await.clone())
    }

    async fn set_indicator(&self, peripheral: &PeripheralHandle, color: LedColor) -> Result<()> {
        self.check_connected(peripheral)?;
        lock(&self.indicator_writes).push((peripheral.id.clone(), color));
        Ok(())
    }
}

/// Builder for creating mock drivers with custom settings.
#[derive(Debug, Clone)]
pub struct MockDriverBuilder {
    acceleration: Acceleration,
    battery: u8,
    rssi: i16,
    read_latency: Duration,
    connect_latency: Duration,
    peripherals: Vec<PeripheralHandle>,
}

impl Default for MockDriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriverBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            acceleration: Acceleration::new(0.0, 0.0, 1.0),
            battery: 85,
            rssi: -50,
            read_latency: Duration::ZERO,
            connect_latency: Duration::ZERO,
            peripherals: Vec::new(),
        }
    }

    /// Set the acceleration returned by reads.
    #[must_use]
    pub fn acceleration(mut self, x: f64, y: f64, z: f64) -> Self {
        self.acceleration = Acceleration::new(x, y, z);
        self
    }

    /// Set the battery level.
    #[must_use]
    pub fn battery(mut self, battery: u8) -> Self {
        self.battery = battery;
        self
    }

    /// Set the RSSI.
    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Set simulated read latency.
    #[must_use]
    pub fn read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    /// Set simulated connect latency.
    #[must_use]
    pub fn connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Script a peripheral for discovery.
    #[must_use]
    pub fn peripheral(mut self, handle: PeripheralHandle) -> Self {
        self.peripherals.push(handle);
        self
    }

    /// Build the mock driver.
    #[must_use]
    pub fn build(self) -> MockDriver {
        MockDriver {
            peripherals: Mutex::new(self.peripherals),
            connected: Mutex::new(HashSet::new()),
            links: Mutex::new(HashMap::new()),
            acceleration: RwLock::new(self.acceleration),
            device_info: RwLock::new(MockDriver::default_info()),
            battery: AtomicU8::new(self.battery),
            rssi: AtomicI16::new(self.rssi),
            read_count: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            fail_message: RwLock::new("Mock failure".to_string()),
            remaining_failures: AtomicU32::new(0),
            refuse_connections: AtomicBool::new(false),
            refuse_discovery: AtomicBool::new(false),
            read_latency_ms: AtomicU64::new(self.read_latency.as_millis() as u64),
            connect_latency_ms: AtomicU64::new(self.connect_latency.as_millis() as u64),
            indicator_writes: Mutex::new(Vec::new()),
            disconnect_requests: AtomicU32::new(0),
        }
    }
}

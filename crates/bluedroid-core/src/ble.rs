//! BLE peripheral driver backed by `btleplug`.
//!
//! Scans are driven by the adapter's event stream. Each connection gets a
//! background task that connects, resolves services and then watches the
//! adapter for the peripheral's disconnect.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bluedroid_types::uuids::{
    BATTERY_LEVEL, DEVICE_NAME, FIRMWARE_REVISION, HARDWARE_REVISION, MANUFACTURER_NAME,
    MODEL_NUMBER, SERIAL_NUMBER, SOFTWARE_REVISION,
};
use bluedroid_types::{Acceleration, DeviceInfo, LedColor, PeripheralHandle};

use crate::driver::{ConnectionEvent, DiscoveryEvent, EVENT_CHANNEL_CAPACITY, PeripheralDriver};
use crate::error::{ConnectionFailureReason, Error, Result};

/// Options for [`BtleDriver`].
#[derive(Debug, Clone, PartialEq)]
pub struct BtleOptions {
    /// How long a scan runs before reporting completion.
    pub scan_duration: Duration,
    /// Only report peripherals whose advertised name starts with this.
    pub name_prefix: Option<String>,
    /// Vendor characteristic holding x/y/z as three little-endian `i16`.
    pub accelerometer_characteristic: Option<Uuid>,
    /// Multiplier from raw accelerometer units to g.
    pub accelerometer_scale: f64,
    /// Vendor characteristic accepting `[r, g, b]`.
    pub indicator_characteristic: Option<Uuid>,
}

impl Default for BtleOptions {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            name_prefix: None,
            accelerometer_characteristic: None,
            accelerometer_scale: 1.0,
            indicator_characteristic: None,
        }
    }
}

impl BtleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn accelerometer(mut self, characteristic: Uuid, scale: f64) -> Self {
        self.accelerometer_characteristic = Some(characteristic);
        self.accelerometer_scale = scale;
        self
    }

    #[must_use]
    pub fn indicator(mut self, characteristic: Uuid) -> Self {
        self.indicator_characteristic = Some(characteristic);
        self
    }

    fn accepts(&self, name: Option<&str>) -> bool {
        match &self.name_prefix {
            Some(prefix) => name.is_some_and(|n| n.starts_with(prefix.as_str())),
            None => true,
        }
    }
}

struct Link {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    events: mpsc::Sender<ConnectionEvent>,
    watcher: JoinHandle<()>,
}

type Links = Arc<RwLock<HashMap<String, Link>>>;
type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs; elsewhere they wrap the address.
fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Stable identifier for a peripheral: its address, or the platform ID where
/// addresses are hidden (macOS reports all zeros).
fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == "00:00:00:00:00:00" {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

fn read_string(data: Vec<u8>) -> String {
    String::from_utf8(data)
        .unwrap_or_default()
        .trim_end_matches('\0')
        .to_string()
}

/// A real BLE central.
pub struct BtleDriver {
    adapter: Adapter,
    options: BtleOptions,
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    links: Links,
}

impl std::fmt::Debug for BtleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleDriver")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BtleDriver {
    /// Create a driver on the first available adapter.
    pub async fn new(options: BtleOptions) -> Result<Self> {
        let adapter = get_adapter().await?;
        Ok(Self::with_adapter(adapter, options))
    }

    pub fn with_adapter(adapter: Adapter, options: BtleOptions) -> Self {
        Self {
            adapter,
            options,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &BtleOptions {
        &self.options
    }

    /// Number of peripherals with a live link.
    pub async fn connected_count(&self) -> usize {
        self.links.read().await.len()
    }

    async fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.links
            .read()
            .await
            .get(&handle.id)
            .map(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    async fn characteristic(
        &self,
        handle: &PeripheralHandle,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let links = self.links.read().await;
        let link = links.get(&handle.id).ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound(uuid.to_string()))?;
        Ok((link.peripheral.clone(), characteristic))
    }

    async fn read_characteristic(&self, handle: &PeripheralHandle, uuid: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(handle, uuid).await?;
        Ok(peripheral.read(&characteristic).await?)
    }
}

async fn describe(peripheral: &Peripheral, options: &BtleOptions) -> Option<PeripheralHandle> {
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            debug!("Error reading peripheral properties: {}", e);
            return None;
        }
    };
    if !options.accepts(properties.local_name.as_deref()) {
        return None;
    }

    let address = properties.address.to_string();
    let id = create_identifier(&address, &peripheral.id());
    let mut handle = PeripheralHandle::new(id, address);
    if let Some(name) = properties.local_name {
        handle = handle.with_name(name);
    }
    if let Some(rssi) = properties.rssi {
        handle = handle.with_rssi(rssi);
    }
    Some(handle)
}

/// Connect and resolve services, caching characteristics by UUID.
async fn establish(peripheral: &Peripheral, id: &str) -> Result<HashMap<Uuid, Characteristic>> {
    peripheral.connect().await.map_err(|e| {
        Error::connection_failed(
            Some(id.to_string()),
            ConnectionFailureReason::BleError(e.to_string()),
        )
    })?;

    // BlueZ reports the link before the remote GATT cache is populated
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    peripheral.discover_services().await.map_err(|e| {
        Error::connection_failed(
            Some(id.to_string()),
            ConnectionFailureReason::ServiceDiscovery(e.to_string()),
        )
    })?;

    let mut characteristics = HashMap::new();
    for service in peripheral.services() {
        debug!("  Service: {}", service.uuid);
        for characteristic in service.characteristics {
            characteristics.insert(characteristic.uuid, characteristic);
        }
    }
    debug!("Cached {} characteristics", characteristics.len());
    Ok(characteristics)
}

/// Whoever removes a link from `links` owns reporting its disconnect.
async fn watch_disconnect(
    mut events: CentralEvents,
    peripheral_id: PeripheralId,
    id: String,
    links: Links,
) {
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event
            && disconnected == peripheral_id
        {
            let link = links.write().await.remove(&id);
            if let Some(link) = link {
                info!("{} disconnected", id);
                let _ = link.events.send(ConnectionEvent::Disconnected).await;
            }
            return;
        }
    }
}

#[async_trait]
impl PeripheralDriver for BtleDriver {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn discover(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let mut central_events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!(
            "Starting BLE scan for {} seconds...",
            self.options.scan_duration.as_secs()
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let options = self.options.clone();

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(options.scan_duration);
            tokio::pin!(deadline);

            let completed = loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break false,
                    _ = &mut deadline => break true,
                    event = central_events.next() => event,
                };
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue,
                    None => break true,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(e) => {
                        debug!("Peripheral {:?} vanished: {}", id, e);
                        continue;
                    }
                };
                let Some(handle) = describe(&peripheral, &options).await else {
                    continue;
                };
                peripherals
                    .write()
                    .await
                    .insert(handle.id.clone(), peripheral);
                if tx.send(DiscoveryEvent::Found(handle)).await.is_err() {
                    break false;
                }
            };

            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            if completed {
                let _ = tx.send(DiscoveryEvent::Complete).await;
            }
        });
        Ok(rx)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(address = %peripheral.address))]
    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<mpsc::Receiver<ConnectionEvent>> {
        let device = self
            .peripherals
            .read()
            .await
            .get(&peripheral.id)
            .cloned()
            .ok_or_else(|| Error::UnknownPeripheral(peripheral.id.clone()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Subscribed before connecting so a drop during setup is still seen
        let central_events = self.adapter.events().await?;
        let links = Arc::clone(&self.links);
        let id = peripheral.id.clone();

        tokio::spawn(async move {
            info!("Connecting to {}...", id);
            let characteristics = match establish(&device, &id).await {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    warn!("{}", e);
                    let _ = tx.send(ConnectionEvent::ConnectionFailed(e.to_string())).await;
                    return;
                }
            };

            {
                // The watcher cannot remove the link before it is inserted
                let mut guard = links.write().await;
                let watcher = tokio::spawn(watch_disconnect(
                    central_events,
                    device.id(),
                    id.clone(),
                    Arc::clone(&links),
                ));
                guard.insert(
                    id,
                    Link {
                        peripheral: device,
                        characteristics,
                        events: tx.clone(),
                        watcher,
                    },
                );
            }
            let _ = tx.send(ConnectionEvent::Connected).await;
        });
        Ok(rx)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(address = %peripheral.address))]
    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<()> {
        let link = self.links.write().await.remove(&peripheral.id);
        let Some(link) = link else {
            return Ok(());
        };
        link.watcher.abort();

        let result = link.peripheral.disconnect().await;
        let _ = link.events.send(ConnectionEvent::Disconnected).await;
        Ok(result?)
    }

    async fn read_acceleration(&self, peripheral: &PeripheralHandle) -> Result<Acceleration> {
        let uuid = self
            .options
            .accelerometer_characteristic
            .ok_or(Error::Unsupported("acceleration without a configured characteristic"))?;
        let data = self.read_characteristic(peripheral, uuid).await?;
        Ok(Acceleration::from_le_bytes(
            &data,
            self.options.accelerometer_scale,
        )?)
    }

    async fn read_rssi(&self, peripheral: &PeripheralHandle) -> Result<i16> {
        let device = self.peripheral(peripheral).await?;
        let properties = device.properties().await?;
        properties
            .and_then(|p| p.rssi)
            .ok_or_else(|| Error::InvalidData("RSSI not available".to_string()))
    }

    async fn read_battery(&self, peripheral: &PeripheralHandle) -> Result<u8> {
        let data = self.read_characteristic(peripheral, BATTERY_LEVEL).await?;
        data.first()
            .copied()
            .ok_or_else(|| Error::InvalidData("Empty battery data".to_string()))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(address = %peripheral.address))]
    async fn read_device_info(&self, peripheral: &PeripheralHandle) -> Result<DeviceInfo> {
        let (name, model, serial, firmware, hardware, software, manufacturer) = tokio::join!(
            self.read_characteristic(peripheral, DEVICE_NAME),
            self.read_characteristic(peripheral, MODEL_NUMBER),
            self.read_characteristic(peripheral, SERIAL_NUMBER),
            self.read_characteristic(peripheral, FIRMWARE_REVISION),
            self.read_characteristic(peripheral, HARDWARE_REVISION),
            self.read_characteristic(peripheral, SOFTWARE_REVISION),
            self.read_characteristic(peripheral, MANUFACTURER_NAME),
        );

        let name = name
            .map(read_string)
            .unwrap_or_else(|_| peripheral.display_name().to_string());
        Ok(DeviceInfo {
            name,
            model: model.map(read_string).unwrap_or_default(),
            serial: serial.map(read_string).unwrap_or_default(),
            firmware: firmware.map(read_string).unwrap_or_default(),
            hardware: hardware.map(read_string).unwrap_or_default(),
            software: software.map(read_string).unwrap_or_default(),
            manufacturer: manufacturer.map(read_string).unwrap_or_default(),
        })
    }

    async fn set_indicator(&self, peripheral: &PeripheralHandle, color: LedColor) -> Result<()> {
        let uuid = self
            .options
            .indicator_characteristic
            .ok_or(Error::Unsupported("indicator without a configured characteristic"))?;
        let (device, characteristic) = self.characteristic(peripheral, uuid).await?;
        device
            .write(&characteristic, &color.to_bytes(), WriteType::WithResponse)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = BtleOptions::default();
        assert_eq!(options.scan_duration, Duration::from_secs(10));
        assert!(options.accelerometer_characteristic.is_none());
        assert_eq!(options.accelerometer_scale, 1.0);
    }

    #[test]
    fn test_options_builder() {
        let accel = Uuid::from_u128(0xa495ff21_c5b1_4b44_b512_1370f02d74de);
        let options = BtleOptions::new()
            .scan_duration(Duration::from_secs(3))
            .name_prefix("Bean")
            .accelerometer(accel, 0.00391)
            .indicator(Uuid::nil());
        assert_eq!(options.accelerometer_characteristic, Some(accel));
        assert_eq!(options.accelerometer_scale, 0.00391);
        assert_eq!(options.indicator_characteristic, Some(Uuid::nil()));
    }

    #[test]
    fn test_name_prefix_filter() {
        let options = BtleOptions::new().name_prefix("Bean");
        assert!(options.accepts(Some("Bean+ 42")));
        assert!(!options.accepts(Some("Thermo 1234")));
        assert!(!options.accepts(None));
        assert!(BtleOptions::default().accepts(None));
    }

    #[test]
    fn test_read_string_trims_nul() {
        assert_eq!(read_string(b"201511\0\0".to_vec()), "201511");
        assert_eq!(read_string(vec![0xff, 0xfe]), "");
    }
}

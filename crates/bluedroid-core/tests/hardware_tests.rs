//! Hardware integration tests for bluedroid-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```
//! cargo test --package bluedroid-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the peripheral via environment variables:
//! - `BLUEDROID_NAME_PREFIX`: only consider peripherals whose name starts with this
//! - `BLUEDROID_ACCEL_UUID`: vendor accelerometer characteristic
//! - `BLUEDROID_ACCEL_SCALE`: raw-to-g multiplier (default 1.0)

use std::env;
use std::time::Duration;

use bluedroid_core::{
    BtleDriver, BtleOptions, ConnectionEvent, DiscoveryEvent, PeripheralDriver, PeripheralHandle,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn options() -> BtleOptions {
    let mut options = BtleOptions::new().scan_duration(Duration::from_secs(10));
    if let Ok(prefix) = env::var("BLUEDROID_NAME_PREFIX") {
        options = options.name_prefix(prefix);
    }
    if let Some(uuid) = env::var("BLUEDROID_ACCEL_UUID")
        .ok()
        .and_then(|s| Uuid::parse_str(&s).ok())
    {
        let scale = env::var("BLUEDROID_ACCEL_SCALE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1.0);
        options = options.accelerometer(uuid, scale);
    }
    options
}

async fn first_peripheral(driver: &BtleDriver) -> Option<PeripheralHandle> {
    let mut events = driver.discover(CancellationToken::new()).await.ok()?;
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Found(peripheral) => return Some(peripheral),
            DiscoveryEvent::Complete => return None,
        }
    }
    None
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_reports_completion() {
    let driver = BtleDriver::new(options()).await.expect("No Bluetooth adapter");
    let mut events = driver.discover(CancellationToken::new()).await.unwrap();

    let mut found = 0;
    let completed = timeout(BLE_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::Found(p) => {
                    found += 1;
                    println!("  {} ({})", p.display_name(), p.address);
                }
                DiscoveryEvent::Complete => return true,
            }
        }
        false
    })
    .await
    .expect("Scan timed out");

    assert!(completed);
    println!("Found {} sightings", found);
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_and_read() {
    let driver = BtleDriver::new(options()).await.expect("No Bluetooth adapter");
    let Some(peripheral) = first_peripheral(&driver).await else {
        println!("Skipping: no peripheral in range");
        return;
    };
    println!("Connecting to {}", peripheral.address);

    let mut events = driver.connect(&peripheral).await.unwrap();
    let outcome = timeout(BLE_TIMEOUT, events.recv())
        .await
        .expect("Connection timed out");
    match outcome {
        Some(ConnectionEvent::Connected) => {}
        other => panic!("Connection failed: {:?}", other),
    }

    let rssi = timeout(Duration::from_secs(10), driver.read_rssi(&peripheral)).await;
    println!("RSSI: {:?}", rssi);

    let info = timeout(Duration::from_secs(10), driver.read_device_info(&peripheral))
        .await
        .expect("Device info timed out")
        .unwrap();
    println!("Device info: {}", info);

    if driver.options().accelerometer_characteristic.is_some() {
        let accel = timeout(Duration::from_secs(10), driver.read_acceleration(&peripheral))
            .await
            .expect("Acceleration read timed out")
            .unwrap();
        println!("Acceleration: {:?}", accel);
    }

    driver.disconnect(&peripheral).await.unwrap();
    let last = timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("Disconnect timed out");
    assert_eq!(last, Some(ConnectionEvent::Disconnected));
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_link_loss_is_reported() {
    let driver = BtleDriver::new(options()).await.expect("No Bluetooth adapter");
    let Some(peripheral) = first_peripheral(&driver).await else {
        println!("Skipping: no peripheral in range");
        return;
    };

    let mut events = driver.connect(&peripheral).await.unwrap();
    match timeout(BLE_TIMEOUT, events.recv()).await {
        Ok(Some(ConnectionEvent::Connected)) => {}
        Ok(Some(ConnectionEvent::Disconnected)) => {
            println!("Link dropped during setup and was reported");
            return;
        }
        other => panic!("Connection failed: {:?}", other),
    }
    assert_eq!(driver.connected_count().await, 1);

    println!("Power off {} within 60 seconds", peripheral.address);
    let last = timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("Link loss was not reported");
    assert_eq!(last, Some(ConnectionEvent::Disconnected));
    assert_eq!(driver.connected_count().await, 0);
}

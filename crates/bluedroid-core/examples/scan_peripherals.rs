//! Example: Scanning for BLE Peripherals
//!
//! Runs one scan through the `btleplug` driver and prints every peripheral
//! it reports, without connecting.
//!
//! Run with: `cargo run --example scan_peripherals`

use std::time::Duration;

use bluedroid_core::{BtleDriver, BtleOptions, DiscoveryEvent, PeripheralDriver, PeripheralHandle};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("Scanning for peripherals...");
    println!();

    let options = BtleOptions::new().scan_duration(Duration::from_secs(10));
    let driver = BtleDriver::new(options).await?;
    let mut events = driver.discover(CancellationToken::new()).await?;

    let mut found: Vec<PeripheralHandle> = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Found(peripheral) => {
                if found.iter().any(|p| p.id == peripheral.id) {
                    continue;
                }
                let rssi = peripheral
                    .rssi
                    .map(|r| format!("{} dBm", r))
                    .unwrap_or_else(|| "N/A".to_string());
                println!("  {}", peripheral.display_name());
                println!("    Address: {}", peripheral.address);
                println!("    RSSI: {}", rssi);
                println!();
                found.push(peripheral);
            }
            DiscoveryEvent::Complete => break,
        }
    }

    if found.is_empty() {
        println!("No peripherals found.");
        println!();
        println!("Make sure:");
        println!("  - The peripheral is powered on");
        println!("  - Bluetooth is enabled on this computer");
    } else {
        println!("Found {} peripheral(s).", found.len());
    }

    Ok(())
}

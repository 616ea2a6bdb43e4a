//! This example prints the signal strength of a device, at most once per second.

use futures::StreamExt;
use gattlink::{AdapterConfig, BtleplugPlatform, Device, Error};
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());

    let platform = BtleplugPlatform::new(AdapterConfig::default()).await?;
    let device = Device::new(platform, address, "");

    let mut rssi = device
        .rssi_stream(Some(Duration::from_secs(1)))
        .await?
        .take(10);

    while let Some(value) = rssi.next().await {
        println!("RSSI: {} dBm", value);
    }

    Ok(())
}

//! This example prints the connection status of a device while connecting to it.

use futures::StreamExt;
use gattlink::{AdapterConfig, BtleplugPlatform, ConnectionConfig, Device, Error};
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());

    let platform = BtleplugPlatform::new(AdapterConfig::default()).await?;
    let device = Device::new(platform, address, "");

    // Read status changes in a separate task
    let mut statuses = device.status_stream();
    let join_handle = tokio::spawn(async move {
        while let Some(status) = statuses.next().await {
            println!("Status: {:?}", status);
        }
    });

    device.connect(ConnectionConfig::default()).await?;
    println!("Connected to {}", device.name());

    sleep(Duration::from_millis(2000)).await;

    device.disconnect().await?;

    sleep(Duration::from_millis(500)).await;
    join_handle.abort();

    Ok(())
}

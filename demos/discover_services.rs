//! This example connects to a device and lists the services it exposes.

use futures::StreamExt;
use gattlink::{AdapterConfig, BtleplugPlatform, ConnectionConfig, Device, Error};
use tokio::time::{timeout, Duration};

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "AA:BB:CC:DD:EE:FF".to_string());

    let platform = BtleplugPlatform::new(AdapterConfig::default()).await?;
    let device = Device::new(platform, address, "");

    device.connect(ConnectionConfig::default()).await?;

    let mut services = device.service_discovery_stream();

    // Services arrive right after connecting, stop when none came for a while
    while let Ok(Some(service)) = timeout(Duration::from_secs(2), services.next()).await {
        let service = service?;
        println!("Service {} (primary: {})", service.uuid(), service.is_primary());

        for characteristic in service.characteristics() {
            println!("  Characteristic {}", characteristic.uuid());
        }
    }

    device.disconnect().await
}

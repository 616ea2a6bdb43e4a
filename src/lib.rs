//! Stream-based access to a single BLE peripheral.
//!
//! A [`Device`] turns connecting, pairing, service discovery, name and signal
//! strength updates into streams that any number of consumers can subscribe
//! to. Native resources behind a stream are held only while someone is
//! subscribed.
//!
//! ## Usage
//!
//! Here is an example on how to connect to a device and list its services:
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use gattlink::{AdapterConfig, BtleplugPlatform, ConnectionConfig, Device, Error};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let platform = BtleplugPlatform::new(AdapterConfig::default()).await?;
//!     let device = Device::new(platform, "AA:BB:CC:DD:EE:FF", "Thermometer");
//!
//!     // Watch the connection status, the first item is the current one
//!     let mut statuses = device.status_stream();
//!     println!("Status: {:?}", statuses.next().await);
//!
//!     device.connect(ConnectionConfig::default()).await?;
//!     println!("Status: {:?}", statuses.next().await);
//!
//!     // Services are discovered once the device is connected
//!     let mut services = device.service_discovery_stream();
//!     if let Some(service) = services.next().await {
//!         println!("Service: {:?}", service?);
//!     }
//!
//!     device.disconnect().await
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use btle::{AdapterConfig, BtleLink, BtleplugPlatform};
pub use characteristic::Characteristic;
pub use common::{
    ConnectionStatus, PairingOutcome, PairingStatus, ProtectionLevel, DEFAULT_MTU,
};
pub use device::Device;
pub use error::{Error, Result};
pub use gate::ConnectionConfig;
pub use rssi::RssiStream;
pub use service::Service;
pub use stream::Subscription;

mod device;
mod discovery;
mod gate;
mod name;
mod rssi;
mod status;
mod stream;
mod watch;

mod btle;
mod characteristic;
pub mod common;
mod error;
pub mod platform;
mod service;

pub mod services {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const GENERIC_ACCESS: Uuid = uuid_from_u16(0x1800);
    pub const DEVICE_INFORMATION: Uuid = uuid_from_u16(0x180A);
    pub const HEART_RATE: Uuid = uuid_from_u16(0x180D);
    pub const BATTERY: Uuid = uuid_from_u16(0x180F);
}

pub mod characteristics {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const DEVICE_NAME: Uuid = uuid_from_u16(0x2A00);
    pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2A37);
    pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
}

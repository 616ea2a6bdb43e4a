use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{future, stream, Stream};
use uuid::Uuid;

use crate::common::{ConnectionStatus, PairingStatus, ProtectionLevel, DEFAULT_MTU};
use crate::discovery::ServiceDiscovery;
use crate::gate::{ConnectionConfig, ConnectionGate};
use crate::name::NameStream;
use crate::platform::Platform;
use crate::rssi::{self, RssiStream};
use crate::status::StatusStream;
use crate::stream::Subscription;
use crate::{Error, Result, Service};

/// A remote BLE peripheral and its event streams.
///
/// Cloning is cheap and every clone shares the same link and streams.
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

struct Inner {
    gate: Arc<ConnectionGate>,
    statuses: StatusStream,
    services: ServiceDiscovery,
    names: NameStream,
}

/// Non-owning reference to a device, held by the services found on it.
#[derive(Clone, Default)]
pub(crate) struct WeakDevice(Weak<Inner>);

impl WeakDevice {
    pub(crate) fn upgrade(&self) -> Option<Device> {
        self.0.upgrade().map(|inner| Device { inner })
    }
}

impl Device {
    /// `identifier` is what the platform resolves a link from, usually the
    /// device address. `name` is the name known from discovery.
    pub fn new(
        platform: Arc<dyn Platform>,
        identifier: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let gate = ConnectionGate::new(identifier.into(), platform);
        let statuses = StatusStream::new(gate.clone());
        let names = NameStream::new(gate.clone(), name.into());

        let inner = Arc::new_cyclic(|weak| Inner {
            services: ServiceDiscovery::new(
                gate.clone(),
                statuses.clone(),
                WeakDevice(weak.clone()),
            ),
            gate,
            statuses,
            names,
        });

        Self { inner }
    }

    #[inline]
    pub fn identifier(&self) -> &str {
        self.inner.gate.identifier()
    }

    /// Name reported by the link, or the discovered name while there is none
    #[inline]
    pub fn name(&self) -> String {
        self.inner.names.current()
    }

    /// Connect to the device, pairing first when the device asks for it.
    ///
    /// Does nothing when already connected. On failure the device stays
    /// disconnected and the next call starts over.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<()> {
        self.inner.gate.connect(&config).await
    }

    /// Disconnect from the device
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.gate.disconnect().await
    }

    #[inline]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.gate.current_status()
    }

    /// Connection status changes. The first item is the status at the time of subscribing.
    pub fn status_stream(&self) -> Subscription<ConnectionStatus> {
        self.inner.statuses.subscribe()
    }

    /// Services of the device, discovered each time it connects.
    ///
    /// Services found during the current connection are replayed to new
    /// subscribers. A failed enumeration arrives as an
    /// [`Error::DiscoveryFailed`] item and is retried on the next connect.
    /// Must be called within a Tokio runtime.
    pub fn service_discovery_stream(&self) -> Subscription<Result<Service>> {
        self.inner.services.subscribe()
    }

    /// Discovery filtered by service UUID is not supported.
    pub fn find_services(&self, _uuids: &[Uuid]) -> Result<Subscription<Result<Service>>> {
        Err(Error::NotImplemented("find_services"))
    }

    /// Current name, followed by every rename reported while connected.
    pub fn name_stream(&self) -> Subscription<String> {
        self.inner.names.subscribe()
    }

    /// Signal strength of the device taken from a new adapter scan.
    ///
    /// With `sampling` set, samples arriving sooner than that after the
    /// previous one are skipped.
    pub async fn rssi_stream(&self, sampling: Option<Duration>) -> Result<RssiStream> {
        rssi::rssi_stream(
            self.inner.gate.platform(),
            self.identifier().to_string(),
            sampling,
        )
        .await
    }

    /// Fails with [`Error::InvalidState`] while the device is not connected.
    pub fn pairing_status(&self) -> Result<PairingStatus> {
        let link = self.inner.gate.require_link()?;

        Ok(if link.is_paired() {
            PairingStatus::Paired
        } else {
            PairingStatus::NotPaired
        })
    }

    #[inline]
    pub fn is_pairing_request_supported(&self) -> bool {
        true
    }

    /// Run the pairing handshake and report whether it ended `Paired`.
    ///
    /// The handshake always uses no protection level; `pin` is accepted but
    /// not passed to the platform.
    pub async fn request_pairing(&self, pin: Option<&str>) -> Result<bool> {
        let link = self.inner.gate.require_link()?;

        if pin.is_some() {
            log::debug!("Ignoring pin for pairing with {}", self.identifier());
        }

        let outcome = link.pair(ProtectionLevel::None).await?;
        log::info!("Pairing with {} ended {:?}", self.identifier(), outcome);

        Ok(outcome.is_paired())
    }

    #[inline]
    pub fn is_mtu_request_available(&self) -> bool {
        false
    }

    /// MTU negotiation is not supported.
    pub fn request_mtu(&self, _size: usize) -> Result<usize> {
        Err(Error::NotImplemented("request_mtu"))
    }

    #[inline]
    pub fn current_mtu_size(&self) -> usize {
        DEFAULT_MTU
    }

    /// Emits the current MTU once and ends, since it never changes.
    pub fn mtu_changed_stream(&self) -> Pin<Box<dyn Stream<Item = usize> + Send>> {
        Box::pin(stream::once(future::ready(self.current_mtu_size())))
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.identifier() == other.identifier()
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("identifier", &self.identifier())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PairingOutcome;
    use crate::platform::mock::{MockLink, MockPlatform};
    use crate::platform::ServiceHandle;
    use futures::StreamExt;
    use tokio::time::timeout;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn device(platform: &Arc<MockPlatform>) -> Device {
        let _ = pretty_env_logger::try_init();
        Device::new(platform.clone(), ADDRESS, "Thermometer")
    }

    #[tokio::test]
    async fn pairable_device_pairs_and_connects() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new().pairable(PairingOutcome::Paired));
        let device = device(&platform);

        device.connect(ConnectionConfig::default()).await.unwrap();

        assert_eq!(link.pairing_requests().len(), 1);
        assert_eq!(device.status(), ConnectionStatus::Connected);
        assert_eq!(device.pairing_status().unwrap(), PairingStatus::Paired);
    }

    #[tokio::test]
    async fn unknown_device_stays_disconnected() {
        let platform = MockPlatform::new();
        let device = device(&platform);

        let result = device.connect(ConnectionConfig::default()).await;

        assert!(matches!(result, Err(Error::DeviceNotFound(_))));
        assert_eq!(device.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn pairing_status_needs_a_link() {
        let platform = MockPlatform::new();
        platform.insert(ADDRESS, MockLink::new());
        let device = device(&platform);

        assert!(matches!(device.pairing_status(), Err(Error::InvalidState(_))));
        assert!(matches!(
            device.request_pairing(None).await,
            Err(Error::InvalidState(_))
        ));

        device.connect(ConnectionConfig::default()).await.unwrap();
        assert_eq!(device.pairing_status().unwrap(), PairingStatus::NotPaired);
    }

    #[tokio::test]
    async fn natively_lost_device_has_no_pairing_status() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new());
        let device = device(&platform);
        device.connect(ConnectionConfig::default()).await.unwrap();

        link.set_status(ConnectionStatus::Disconnected);
        device.disconnect().await.unwrap();

        assert_eq!(device.status(), ConnectionStatus::Disconnected);
        assert!(matches!(device.pairing_status(), Err(Error::InvalidState(_))));
        timeout(Duration::from_secs(1), link.closed(1)).await.unwrap();
        assert_eq!(link.closes(), 1);
    }

    #[tokio::test]
    async fn request_pairing_ignores_pin() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new().pairable(PairingOutcome::Failed));
        let device = device(&platform);
        device
            .connect(ConnectionConfig::default().auto_pair(false))
            .await
            .unwrap();

        assert!(!device.request_pairing(Some("123456")).await.unwrap());
        assert_eq!(link.pairing_requests(), vec![ProtectionLevel::None]);
    }

    #[tokio::test]
    async fn mtu_is_fixed() {
        let platform = MockPlatform::new();
        let device = device(&platform);

        assert!(matches!(device.request_mtu(185), Err(Error::NotImplemented(_))));
        assert_eq!(device.current_mtu_size(), 20);
        assert!(!device.is_mtu_request_available());

        let sizes = device.mtu_changed_stream().collect::<Vec<_>>().await;
        assert_eq!(sizes, vec![20]);
    }

    #[tokio::test]
    async fn find_services_is_not_implemented() {
        let platform = MockPlatform::new();
        let device = device(&platform);

        assert!(matches!(
            device.find_services(&[crate::services::BATTERY]),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(device.find_services(&[]), Err(Error::NotImplemented(_))));
    }

    #[tokio::test]
    async fn discovered_services_point_back_to_device() {
        let platform = MockPlatform::new();
        platform.insert(
            ADDRESS,
            MockLink::new().with_services(vec![ServiceHandle {
                uuid: crate::services::BATTERY,
                primary: true,
                characteristics: vec![crate::characteristics::BATTERY_LEVEL],
            }]),
        );
        let device = device(&platform);
        device.connect(ConnectionConfig::default()).await.unwrap();

        let mut services = device.service_discovery_stream();
        let service = timeout(Duration::from_secs(1), services.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(service.device(), Some(device.clone()));
        assert_eq!(
            service.characteristics()[0].uuid(),
            crate::characteristics::BATTERY_LEVEL
        );
        assert_eq!(
            service.characteristics()[0].service_uuid(),
            crate::services::BATTERY
        );
    }

    #[tokio::test]
    async fn clones_share_one_link() {
        let platform = MockPlatform::new();
        platform.insert(ADDRESS, MockLink::new());
        let device = device(&platform);
        let other = device.clone();

        let mut statuses = other.status_stream();
        assert_eq!(statuses.next().await, Some(ConnectionStatus::Disconnected));

        device.connect(ConnectionConfig::default()).await.unwrap();
        other.connect(ConnectionConfig::default()).await.unwrap();

        assert_eq!(statuses.next().await, Some(ConnectionStatus::Connected));
        assert_eq!(platform.resolutions(), 1);
        assert_eq!(other.name(), "Thermometer");
    }
}

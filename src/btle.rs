//! [`Platform`] implementation on top of btleplug.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use uuid::Uuid;

use crate::common::{ConnectionStatus, PairingOutcome, ProtectionLevel};
use crate::platform::{
    Advertisement, Handler, HandlerId, Handlers, NativeLink, Platform, ServiceHandle,
};
use crate::{Device, Error, Result};

pub struct AdapterConfig {
    /// Index of the Bluetooth adapter to use. The first found adapter is used by default.
    adapter_index: usize,
    /// Only advertisements of these services are scanned for. Empty means all.
    services: Vec<Uuid>,
    /// How long connecting waits for an unknown device to show up in the scan.
    resolve_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            services: Vec::new(),
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

impl AdapterConfig {
    /// Index of bluetooth adapter to use
    pub fn adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Scan only for devices advertising the given services
    pub fn filter_by_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }

    /// Give up looking for a device to connect to after given duration
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }
}

pub(crate) struct Session {
    pub(crate) _manager: Manager,
    pub(crate) adapter: Adapter,
}

pub struct BtleplugPlatform {
    session: Session,
    scan_filter: ScanFilter,
    resolve_timeout: Duration,
}

impl BtleplugPlatform {
    pub async fn new(config: AdapterConfig) -> Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if config.adapter_index >= adapters.len() {
            return Err(Error::DeviceNotFound(format!(
                "bluetooth adapter {}",
                config.adapter_index
            )));
        }

        let adapter = adapters.swap_remove(config.adapter_index);

        log::trace!("Using adapter: {:?}", adapter);

        Ok(Arc::new(Self {
            session: Session {
                _manager: manager,
                adapter,
            },
            scan_filter: ScanFilter {
                services: config.services,
            },
            resolve_timeout: config.resolve_timeout,
        }))
    }

    /// Devices for every peripheral the adapter knows about so far.
    pub async fn devices(self: &Arc<Self>) -> Result<Vec<Device>> {
        let mut devices = Vec::new();

        for peripheral in self.session.adapter.peripherals().await? {
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|props| props.local_name)
                .unwrap_or_default();

            devices.push(Device::new(
                self.clone(),
                peripheral.address().to_string(),
                name,
            ));
        }

        Ok(devices)
    }

    async fn find_peripheral(&self, identifier: &str) -> Result<Option<Peripheral>> {
        let adapter = &self.session.adapter;

        let events = adapter.events().await?;
        adapter.start_scan(self.scan_filter.clone()).await?;

        let found = self.search(events, identifier).await;

        // The scan was only needed to resolve this one peripheral
        if let Err(e) = adapter.stop_scan().await {
            log::warn!("Could not stop scanning for {}: {}", identifier, e);
        }

        found
    }

    async fn search(
        &self,
        mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
        identifier: &str,
    ) -> Result<Option<Peripheral>> {
        let adapter = &self.session.adapter;

        if let Some(peripheral) = adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| has_address(peripheral, identifier))
        {
            return Ok(Some(peripheral));
        }

        log::debug!("Waiting for {} to show up in the scan", identifier);

        let search = async {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                    if let Ok(peripheral) = adapter.peripheral(&id).await {
                        if has_address(&peripheral, identifier) {
                            return Some(peripheral);
                        }
                    }
                }
            }
            None
        };

        Ok(tokio::time::timeout(self.resolve_timeout, search)
            .await
            .ok()
            .flatten())
    }
}

fn has_address(peripheral: &Peripheral, identifier: &str) -> bool {
    peripheral
        .address()
        .to_string()
        .eq_ignore_ascii_case(identifier)
}

impl Platform for BtleplugPlatform {
    fn resolve_link<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn NativeLink>>>> {
        async move {
            let peripheral = match self.find_peripheral(identifier).await? {
                Some(peripheral) => peripheral,
                None => return Ok(None),
            };

            if !peripheral.is_connected().await? {
                log::debug!("Connecting to device {}", peripheral.address());
                peripheral.connect().await?;
            }

            let link = BtleLink::open(self.session.adapter.clone(), peripheral).await?;
            Ok(Some(link as Arc<dyn NativeLink>))
        }
        .boxed()
    }

    fn scan_stream(&self) -> BoxFuture<'_, Result<BoxStream<'static, Advertisement>>> {
        async move {
            let adapter = self.session.adapter.clone();

            let events = adapter.events().await?;
            adapter.start_scan(self.scan_filter.clone()).await?;

            log::info!("Starting the scan");

            Ok(events
                .filter_map(move |event| {
                    let adapter = adapter.clone();
                    async move { advertisement(&adapter, event).await }
                })
                .boxed())
        }
        .boxed()
    }
}

async fn advertisement(adapter: &Adapter, event: CentralEvent) -> Option<Advertisement> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };

    let peripheral = adapter.peripheral(&id).await.ok()?;
    let props = peripheral.properties().await.ok().flatten()?;

    Some(Advertisement {
        identifier: peripheral.address().to_string(),
        rssi: props.rssi?,
        local_name: props.local_name,
    })
}

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// A connected btleplug peripheral.
///
/// Connection and name changes are picked up from the adapter's event stream.
/// btleplug has no pairing API, so the link never reports itself pairable.
pub struct BtleLink {
    id: PeripheralId,
    peripheral: Peripheral,
    connected: AtomicBool,
    name: Mutex<Option<String>>,
    status_handlers: Handlers,
    name_handlers: Handlers,
    watcher: Mutex<Option<Trigger>>,
}

impl BtleLink {
    async fn open(adapter: Adapter, peripheral: Peripheral) -> Result<Arc<Self>> {
        let name = peripheral
            .properties()
            .await?
            .and_then(|props| props.local_name);
        let (stopper, events) = Valved::new(adapter.events().await?);

        let link = Arc::new(Self {
            id: peripheral.id(),
            peripheral,
            connected: AtomicBool::new(true),
            name: Mutex::new(name),
            status_handlers: Handlers::new(),
            name_handlers: Handlers::new(),
            watcher: Mutex::new(Some(stopper)),
        });

        tokio::spawn(Self::watch(Arc::downgrade(&link), events));

        Ok(link)
    }

    async fn watch(link: Weak<Self>, mut events: Valved<EventStream>) {
        while let Some(event) = events.next().await {
            let link = match link.upgrade() {
                Some(link) => link,
                None => break,
            };

            match event {
                CentralEvent::DeviceConnected(id) if id == link.id => link.set_connected(true),
                CentralEvent::DeviceDisconnected(id) if id == link.id => {
                    link.set_connected(false)
                }
                CentralEvent::DeviceUpdated(id) if id == link.id => link.refresh_name().await,
                _ => {}
            }
        }

        log::trace!("Stopped watching link events");
    }

    fn set_connected(&self, connected: bool) {
        log::debug!(
            "Device {} {}",
            self.peripheral.address(),
            if connected { "connected" } else { "disconnected" }
        );

        self.connected.store(connected, Ordering::SeqCst);
        self.status_handlers.notify(&());
    }

    async fn refresh_name(&self) {
        let name = match self.peripheral.properties().await {
            Ok(Some(props)) => props.local_name,
            _ => return,
        };

        let changed = {
            let mut current = self.name.lock().unwrap_or_else(PoisonError::into_inner);
            if *current != name {
                *current = name;
                true
            } else {
                false
            }
        };

        if changed {
            self.name_handlers.notify(&());
        }
    }
}

impl NativeLink for BtleLink {
    fn is_pairable(&self) -> bool {
        false
    }

    fn is_paired(&self) -> bool {
        false
    }

    fn pair(&self, _level: ProtectionLevel) -> BoxFuture<'_, Result<PairingOutcome>> {
        futures::future::ready(Ok(PairingOutcome::Unsupported)).boxed()
    }

    fn status(&self) -> ConnectionStatus {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn name(&self) -> Option<String> {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_status_changed(&self, handler: Handler) -> HandlerId {
        self.status_handlers.add_handler(handler)
    }

    fn remove_status_handler(&self, id: HandlerId) -> bool {
        self.status_handlers.remove(id)
    }

    fn on_name_changed(&self, handler: Handler) -> HandlerId {
        self.name_handlers.add_handler(handler)
    }

    fn remove_name_handler(&self, id: HandlerId) -> bool {
        self.name_handlers.remove(id)
    }

    fn services(&self) -> BoxFuture<'_, Result<Vec<ServiceHandle>>> {
        async move {
            let mut services = self.peripheral.services();
            if services.is_empty() {
                self.peripheral.discover_services().await?;
                services = self.peripheral.services();
            }

            Ok(services
                .into_iter()
                .map(|service| ServiceHandle {
                    uuid: service.uuid,
                    primary: service.primary,
                    characteristics: service
                        .characteristics
                        .iter()
                        .map(|characteristic| characteristic.uuid)
                        .collect(),
                })
                .collect::<Vec<_>>())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.watcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.connected.store(false, Ordering::SeqCst);

            self.peripheral.disconnect().await?;
            Ok(())
        }
        .boxed()
    }
}

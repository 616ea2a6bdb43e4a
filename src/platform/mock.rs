//! In-memory platform for exercising the device pipeline without a radio.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{Advertisement, Handler, HandlerId, Handlers, NativeLink, Platform, ServiceHandle};
use crate::common::{ConnectionStatus, PairingOutcome, ProtectionLevel};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockPlatform {
    links: Mutex<HashMap<String, Arc<MockLink>>>,
    resolutions: AtomicUsize,
    scans: AtomicUsize,
    advertisements: broadcast::Sender<Advertisement>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        let (advertisements, _) = broadcast::channel(64);

        Self {
            links: Mutex::new(HashMap::new()),
            resolutions: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            advertisements,
        }
    }
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `identifier` resolvable to `link`.
    pub fn insert(&self, identifier: &str, link: MockLink) -> Arc<MockLink> {
        let link = Arc::new(link);
        lock(&self.links).insert(identifier.to_string(), link.clone());
        link
    }

    /// Number of `resolve_link` calls so far, successful or not.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    /// Number of scan streams opened so far.
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Deliver an advertisement to every open scan stream.
    pub fn advertise(&self, identifier: &str, rssi: i16) {
        self.advertisements
            .send(Advertisement {
                identifier: identifier.to_string(),
                rssi,
                local_name: None,
            })
            .ok();
    }
}

impl Platform for MockPlatform {
    fn resolve_link<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn NativeLink>>>> {
        async move {
            self.resolutions.fetch_add(1, Ordering::SeqCst);

            let link = lock(&self.links).get(identifier).cloned();
            Ok(link.map(|link| {
                link.open();
                link as Arc<dyn NativeLink>
            }))
        }
        .boxed()
    }

    fn scan_stream(&self) -> BoxFuture<'_, Result<BoxStream<'static, Advertisement>>> {
        async move {
            self.scans.fetch_add(1, Ordering::SeqCst);

            let receiver = self.advertisements.subscribe();
            Ok(BroadcastStream::new(receiver)
                .filter_map(|x| async move { x.ok() })
                .boxed())
        }
        .boxed()
    }
}

pub struct MockLink {
    pairable: AtomicBool,
    paired: AtomicBool,
    pairing_outcome: Mutex<PairingOutcome>,
    pairing_requests: Mutex<Vec<ProtectionLevel>>,
    status: Mutex<ConnectionStatus>,
    name: Mutex<Option<String>>,
    services: Mutex<Vec<ServiceHandle>>,
    fail_enumeration: AtomicBool,
    enumerations: AtomicUsize,
    closes: AtomicUsize,
    status_handlers: Handlers,
    name_handlers: Handlers,
    status_registrations: AtomicUsize,
    status_removals: AtomicUsize,
}

impl Default for MockLink {
    fn default() -> Self {
        Self {
            pairable: AtomicBool::new(false),
            paired: AtomicBool::new(false),
            pairing_outcome: Mutex::new(PairingOutcome::Paired),
            pairing_requests: Mutex::new(Vec::new()),
            status: Mutex::new(ConnectionStatus::Disconnected),
            name: Mutex::new(None),
            services: Mutex::new(Vec::new()),
            fail_enumeration: AtomicBool::new(false),
            enumerations: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            status_handlers: Handlers::new(),
            name_handlers: Handlers::new(),
            status_registrations: AtomicUsize::new(0),
            status_removals: AtomicUsize::new(0),
        }
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link that can pair and is not paired yet. Pairing ends with `outcome`.
    pub fn pairable(self, outcome: PairingOutcome) -> Self {
        self.pairable.store(true, Ordering::SeqCst);
        *lock(&self.pairing_outcome) = outcome;
        self
    }

    pub fn named(self, name: &str) -> Self {
        *lock(&self.name) = Some(name.to_string());
        self
    }

    pub fn with_services(self, services: Vec<ServiceHandle>) -> Self {
        *lock(&self.services) = services;
        self
    }

    pub fn failing_enumeration(self) -> Self {
        self.fail_enumeration.store(true, Ordering::SeqCst);
        self
    }

    /// Report a native connection change and fire the status handlers.
    pub fn set_status(&self, status: ConnectionStatus) {
        *lock(&self.status) = status;
        self.status_handlers.notify(&());
    }

    /// Report a native name change and fire the name handlers.
    pub fn set_name(&self, name: &str) {
        *lock(&self.name) = Some(name.to_string());
        self.name_handlers.notify(&());
    }

    pub fn pairing_requests(&self) -> Vec<ProtectionLevel> {
        lock(&self.pairing_requests).clone()
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Yield until `close` has been called `count` times. Closing a link lost
    /// natively happens on a spawned task.
    pub async fn closed(&self, count: usize) {
        while self.closes() < count {
            tokio::task::yield_now().await;
        }
    }

    pub fn status_registrations(&self) -> usize {
        self.status_registrations.load(Ordering::SeqCst)
    }

    pub fn status_removals(&self) -> usize {
        self.status_removals.load(Ordering::SeqCst)
    }

    pub fn status_handler_count(&self) -> usize {
        self.status_handlers.len()
    }

    pub fn name_handler_count(&self) -> usize {
        self.name_handlers.len()
    }

    fn open(&self) {
        *lock(&self.status) = ConnectionStatus::Connected;
    }
}

impl NativeLink for MockLink {
    fn is_pairable(&self) -> bool {
        self.pairable.load(Ordering::SeqCst) && !self.is_paired()
    }

    fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    fn pair(&self, level: ProtectionLevel) -> BoxFuture<'_, Result<PairingOutcome>> {
        async move {
            lock(&self.pairing_requests).push(level);

            let outcome = *lock(&self.pairing_outcome);
            if outcome.is_paired() {
                self.paired.store(true, Ordering::SeqCst);
            }
            Ok(outcome)
        }
        .boxed()
    }

    fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    fn on_status_changed(&self, handler: Handler) -> HandlerId {
        self.status_registrations.fetch_add(1, Ordering::SeqCst);
        self.status_handlers.add_handler(handler)
    }

    fn remove_status_handler(&self, id: HandlerId) -> bool {
        let removed = self.status_handlers.remove(id);
        if removed {
            self.status_removals.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    fn on_name_changed(&self, handler: Handler) -> HandlerId {
        self.name_handlers.add_handler(handler)
    }

    fn remove_name_handler(&self, id: HandlerId) -> bool {
        self.name_handlers.remove(id)
    }

    fn services(&self) -> BoxFuture<'_, Result<Vec<ServiceHandle>>> {
        async move {
            self.enumerations.fetch_add(1, Ordering::SeqCst);

            if self.fail_enumeration.load(Ordering::SeqCst) {
                return Err(Error::Platform("service enumeration failed".to_string()));
            }
            Ok(lock(&self.services).clone())
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *lock(&self.status) = ConnectionStatus::Disconnected;
            Ok(())
        }
        .boxed()
    }
}

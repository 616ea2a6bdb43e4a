use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::common::{ConnectionStatus, ProtectionLevel};
use crate::platform::{same_link, HandlerId, Handlers, NativeLink, Platform};
use crate::{Error, Result};

/// Options for [`Device::connect`](crate::Device::connect).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Pair before connecting when the peripheral is pairable and not paired yet.
    auto_pair: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { auto_pair: true }
    }
}

impl ConnectionConfig {
    /// Enable or disable the pairing handshake done as part of connecting
    pub fn auto_pair(mut self, enabled: bool) -> Self {
        self.auto_pair = enabled;
        self
    }
}

/// Transitions of the gate's link, seen by the streams built on top of it.
#[derive(Clone)]
pub(crate) enum GateEvent {
    Established(Arc<dyn NativeLink>),
    Released,
}

/// Owner of the single native link of a device.
///
/// Connect and disconnect are serialized by `operations`; the link cell itself
/// is only touched under its own mutex and never across an await. A native
/// disconnection notice releases the link without waiting for `disconnect`.
pub(crate) struct ConnectionGate {
    identifier: String,
    platform: Arc<dyn Platform>,
    link: Mutex<Option<HeldLink>>,
    operations: tokio::sync::Mutex<()>,
    events: Handlers<GateEvent>,
    me: Weak<ConnectionGate>,
}

struct HeldLink {
    link: Arc<dyn NativeLink>,
    on_lost: HandlerId,
}

impl ConnectionGate {
    pub(crate) fn new(identifier: String, platform: Arc<dyn Platform>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            identifier,
            platform,
            link: Mutex::new(None),
            operations: tokio::sync::Mutex::new(()),
            events: Handlers::new(),
            me: me.clone(),
        })
    }

    pub(crate) fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub(crate) fn events(&self) -> &Handlers<GateEvent> {
        &self.events
    }

    pub(crate) async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        let _operation = self.operations.lock().await;

        if self.current_status().is_connected() {
            log::debug!("{} is already connected", self.identifier);
            return Ok(());
        }

        // The native layer dropped the previous session; replace it.
        if let Some(stale) = self.take_link() {
            log::debug!("Releasing stale link to {}", self.identifier);
            self.events.notify(&GateEvent::Released);
            Self::abandon(&self.identifier, stale).await;
        }

        log::info!("Connecting to {}", self.identifier);

        let link = self
            .platform
            .resolve_link(&self.identifier)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(self.identifier.clone()))?;

        if config.auto_pair && link.is_pairable() && !link.is_paired() {
            log::debug!("Pairing with {}", self.identifier);

            let outcome = match link.pair(ProtectionLevel::None).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    Self::abandon(&self.identifier, link).await;
                    return Err(e);
                }
            };

            if !outcome.is_paired() {
                log::warn!("Pairing with {} failed: {:?}", self.identifier, outcome);
                Self::abandon(&self.identifier, link).await;
                return Err(Error::PairingFailed(outcome));
            }
        }

        self.hold(link.clone());

        log::info!("Connected to {}", self.identifier);
        self.events.notify(&GateEvent::Established(link));

        Ok(())
    }

    pub(crate) async fn disconnect(&self) -> Result<()> {
        let _operation = self.operations.lock().await;

        // A link the native layer already dropped is still closed here.
        let link = match self.take_link() {
            Some(link) => link,
            None => {
                log::debug!("{} is already disconnected", self.identifier);
                return Ok(());
            }
        };

        log::info!("Disconnecting from {}", self.identifier);
        self.events.notify(&GateEvent::Released);

        link.close().await
    }

    pub(crate) fn current_status(&self) -> ConnectionStatus {
        self.lock_link()
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |held| held.link.status())
    }

    pub(crate) fn link(&self) -> Option<Arc<dyn NativeLink>> {
        self.lock_link().as_ref().map(|held| held.link.clone())
    }

    pub(crate) fn require_link(&self) -> Result<Arc<dyn NativeLink>> {
        self.link()
            .filter(|link| link.status().is_connected())
            .ok_or(Error::InvalidState("device has no native link"))
    }

    fn hold(&self, link: Arc<dyn NativeLink>) {
        let gate = self.me.clone();
        let watched = Arc::downgrade(&link);

        let on_lost = link.on_status_changed(Arc::new(move || {
            if let (Some(gate), Some(link)) = (gate.upgrade(), watched.upgrade()) {
                if !link.status().is_connected() {
                    gate.release_lost(&link);
                }
            }
        }));

        *self.lock_link() = Some(HeldLink { link, on_lost });
    }

    fn take_link(&self) -> Option<Arc<dyn NativeLink>> {
        let held = self.lock_link().take()?;
        held.link.remove_status_handler(held.on_lost);
        Some(held.link)
    }

    /// Drops `link` after a native disconnection notice, unless a connect or
    /// disconnect already replaced it.
    fn release_lost(&self, link: &Arc<dyn NativeLink>) {
        let held = {
            let mut cell = self.lock_link();
            let current = cell.as_ref().map_or(false, |held| same_link(&held.link, link));
            if current {
                cell.take()
            } else {
                None
            }
        };
        let held = match held {
            Some(held) => held,
            None => return,
        };

        held.link.remove_status_handler(held.on_lost);

        log::info!("{} was disconnected", self.identifier);
        self.events.notify(&GateEvent::Released);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let identifier = self.identifier.clone();
                let link = held.link;
                runtime.spawn(async move {
                    Self::abandon(&identifier, link).await;
                });
            }
            Err(_) => log::warn!(
                "No runtime to close the lost link to {}",
                self.identifier
            ),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<HeldLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn abandon(identifier: &str, link: Arc<dyn NativeLink>) {
        if let Err(e) = link.close().await {
            log::warn!("Could not close link to {}: {}", identifier, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PairingOutcome;
    use crate::platform::mock::{MockLink, MockPlatform};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{timeout, Duration};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn gate(platform: &Arc<MockPlatform>) -> Arc<ConnectionGate> {
        ConnectionGate::new(ADDRESS.to_string(), platform.clone())
    }

    #[tokio::test]
    async fn pairable_link_is_paired_before_connecting() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new().pairable(PairingOutcome::Paired));
        let gate = gate(&platform);

        gate.connect(&ConnectionConfig::default()).await.unwrap();

        assert_eq!(link.pairing_requests(), vec![ProtectionLevel::None]);
        assert_eq!(gate.current_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn second_connect_does_not_resolve_again() {
        let platform = MockPlatform::new();
        platform.insert(ADDRESS, MockLink::new());
        let gate = gate(&platform);

        gate.connect(&ConnectionConfig::default()).await.unwrap();
        gate.connect(&ConnectionConfig::default()).await.unwrap();

        assert_eq!(platform.resolutions(), 1);
        assert_eq!(gate.current_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn unknown_identifier_fails_with_device_not_found() {
        let platform = MockPlatform::new();
        let gate = gate(&platform);

        let result = gate.connect(&ConnectionConfig::default()).await;

        assert!(matches!(result, Err(Error::DeviceNotFound(id)) if id == ADDRESS));
        assert_eq!(gate.current_status(), ConnectionStatus::Disconnected);
        assert!(gate.link().is_none());

        gate.connect(&ConnectionConfig::default()).await.ok();
        assert_eq!(platform.resolutions(), 2);
    }

    #[tokio::test]
    async fn rejected_pairing_leaves_no_link() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new().pairable(PairingOutcome::Rejected));
        let gate = gate(&platform);

        let result = gate.connect(&ConnectionConfig::default()).await;

        assert!(matches!(
            result,
            Err(Error::PairingFailed(PairingOutcome::Rejected))
        ));
        assert!(gate.link().is_none());
        assert_eq!(link.closes(), 1);
        assert_eq!(gate.current_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn auto_pair_can_be_turned_off() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new().pairable(PairingOutcome::Rejected));
        let gate = gate(&platform);

        gate.connect(&ConnectionConfig::default().auto_pair(false))
            .await
            .unwrap();

        assert!(link.pairing_requests().is_empty());
        assert_eq!(gate.current_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn disconnect_releases_link() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new());
        let gate = gate(&platform);

        gate.disconnect().await.unwrap();
        assert_eq!(link.closes(), 0);

        gate.connect(&ConnectionConfig::default()).await.unwrap();
        gate.disconnect().await.unwrap();

        assert_eq!(link.closes(), 1);
        assert!(gate.link().is_none());
        assert!(matches!(gate.require_link(), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn natively_lost_link_is_replaced_on_connect() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new());
        let gate = gate(&platform);

        gate.connect(&ConnectionConfig::default()).await.unwrap();
        link.set_status(ConnectionStatus::Disconnected);
        assert_eq!(gate.current_status(), ConnectionStatus::Disconnected);
        timeout(Duration::from_secs(1), link.closed(1)).await.unwrap();

        gate.connect(&ConnectionConfig::default()).await.unwrap();

        assert_eq!(platform.resolutions(), 2);
        assert_eq!(link.closes(), 1);
        assert_eq!(gate.current_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn native_disconnect_releases_and_closes_link() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new().pairable(PairingOutcome::Paired));
        let gate = gate(&platform);

        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        gate.events().add(move |event| {
            if let GateEvent::Released = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        gate.connect(&ConnectionConfig::default()).await.unwrap();
        assert_eq!(link.status_handler_count(), 1);

        link.set_status(ConnectionStatus::Disconnected);

        assert!(gate.link().is_none());
        assert!(matches!(gate.require_link(), Err(Error::InvalidState(_))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(link.status_handler_count(), 0);
        timeout(Duration::from_secs(1), link.closed(1)).await.unwrap();

        gate.disconnect().await.unwrap();
        assert_eq!(link.closes(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connects_resolve_one_link() {
        let platform = MockPlatform::new();
        platform.insert(ADDRESS, MockLink::new());
        let gate = gate(&platform);

        let (a, b, c) = tokio::join!(
            tokio::spawn(connect(gate.clone())),
            tokio::spawn(connect(gate.clone())),
            tokio::spawn(connect(gate.clone())),
        );
        for result in [a, b, c] {
            result.unwrap().unwrap();
        }

        assert_eq!(platform.resolutions(), 1);
        assert_eq!(gate.current_status(), ConnectionStatus::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interleaved_connect_and_disconnect_hold_at_most_one_link() {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new());
        let gate = gate(&platform);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    gate.connect(&ConnectionConfig::default()).await
                } else {
                    gate.disconnect().await
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Every resolved link was closed except the one still held.
        let held = usize::from(gate.link().is_some());
        assert_eq!(platform.resolutions(), link.closes() + held);
        assert_eq!(gate.current_status().is_connected(), held == 1);
        assert!(link.status_handler_count() <= 1);
    }

    async fn connect(gate: Arc<ConnectionGate>) -> Result<()> {
        gate.connect(&ConnectionConfig::default()).await
    }
}

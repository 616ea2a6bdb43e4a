use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::{stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::common::ConnectionStatus;
use crate::device::WeakDevice;
use crate::gate::{ConnectionGate, GateEvent};
use crate::platform::HandlerId;
use crate::status::StatusStream;
use crate::stream::{Lease, RefCount, Subscription};
use crate::{Error, Result, Service};

/// What the discovery task publishes. The error is kept as text so every
/// subscriber gets its own copy.
#[derive(Clone)]
enum Discovered {
    Service(Service),
    Failed(String),
}

impl Discovered {
    fn into_result(self) -> Result<Service> {
        match self {
            Discovered::Service(service) => Ok(service),
            Discovered::Failed(reason) => Err(Error::DiscoveryFailed(reason)),
        }
    }
}

/// Services found during the current connected period.
#[derive(Default)]
struct ServiceCache {
    connected: bool,
    /// Bumped on every reset, so an enumeration started before it is dropped.
    epoch: u64,
    services: Vec<Service>,
    failure: Option<String>,
}

impl ServiceCache {
    /// Track a status change. Returns true when it starts a connected period,
    /// which is when the services need to be enumerated.
    fn on_status(&mut self, status: ConnectionStatus) -> bool {
        match status {
            ConnectionStatus::Connected => {
                if std::mem::replace(&mut self.connected, true) {
                    return false;
                }
                self.failure = None;
                true
            }
            ConnectionStatus::Disconnected => {
                self.reset();
                false
            }
        }
    }

    fn reset(&mut self) {
        self.connected = false;
        self.epoch += 1;
        self.services.clear();
        self.failure = None;
    }

    fn replay(&self) -> Vec<Discovered> {
        self.services
            .iter()
            .cloned()
            .map(Discovered::Service)
            .chain(self.failure.clone().map(Discovered::Failed))
            .collect()
    }
}

/// Multicast stream of discovered services.
///
/// Services are replayed to late subscribers while the device stays connected
/// and forgotten as soon as the gate lets go of the link. A failed enumeration
/// is delivered as an error item and retried on the next connected status.
#[derive(Clone)]
pub(crate) struct ServiceDiscovery {
    shared: Arc<Shared>,
}

struct Shared {
    gate: Arc<ConnectionGate>,
    statuses: StatusStream,
    device: WeakDevice,
    sender: broadcast::Sender<Discovered>,
    cache: Mutex<ServiceCache>,
    refs: RefCount<Pump>,
}

impl ServiceDiscovery {
    pub(crate) fn new(gate: Arc<ConnectionGate>, statuses: StatusStream, device: WeakDevice) -> Self {
        let (sender, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(Shared {
                gate,
                statuses,
                device,
                sender,
                cache: Mutex::new(ServiceCache::default()),
                refs: RefCount::new(),
            }),
        }
    }

    /// Must be called within a Tokio runtime, the first subscriber spawns the discovery task.
    pub(crate) fn subscribe(&self) -> Subscription<Result<Service>> {
        let (replay, receiver) = {
            let cache = self.shared.lock_cache();
            (cache.replay(), self.shared.sender.subscribe())
        };
        self.shared.refs.acquire(|| Pump::start(&self.shared));

        let updates = BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() });

        let shared = self.shared.clone();
        Subscription::new(
            Box::pin(
                stream::iter(replay)
                    .chain(updates)
                    .map(Discovered::into_result),
            ),
            Lease::new(move || shared.refs.release()),
        )
    }
}

impl Shared {
    fn lock_cache(&self) -> MutexGuard<'_, ServiceCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enumerate(&self, epoch: u64) {
        let link = match self.gate.link() {
            Some(link) => link,
            None => return,
        };

        log::debug!("Discovering services of {}", self.gate.identifier());

        let result = link.services().await;

        let mut cache = self.lock_cache();
        if cache.epoch != epoch {
            // Disconnected while enumerating, the result is already stale.
            return;
        }

        match result {
            Ok(handles) => {
                for handle in handles {
                    let service = Service::new(self.device.clone(), handle);
                    cache.services.push(service.clone());
                    self.sender.send(Discovered::Service(service)).ok();
                }

                log::info!(
                    "Discovered {} services on {}",
                    cache.services.len(),
                    self.gate.identifier()
                );
            }
            Err(e) => {
                log::error!(
                    "Service discovery on {} failed: {}",
                    self.gate.identifier(),
                    e
                );

                let reason = e.to_string();
                // Let the next Connected status try again.
                cache.connected = false;
                cache.failure = Some(reason.clone());
                self.sender.send(Discovered::Failed(reason)).ok();
            }
        }
    }
}

/// The discovery task, running while the stream has subscribers.
struct Pump {
    shared: Weak<Shared>,
    gate: Arc<ConnectionGate>,
    listener: HandlerId,
    _stopper: Trigger,
}

impl Pump {
    fn start(shared: &Arc<Shared>) -> Self {
        let weak = Arc::downgrade(shared);

        // Forget the services the moment the link goes away, the task only
        // sees the Disconnected status some time later.
        let listener = shared.gate.events().add({
            let weak = weak.clone();
            move |event| {
                if let (GateEvent::Released, Some(shared)) = (event, weak.upgrade()) {
                    shared.lock_cache().reset();
                }
            }
        });

        let (stopper, statuses) = Valved::new(shared.statuses.subscribe());
        tokio::spawn(Self::run(weak.clone(), statuses));

        log::debug!("Service discovery of {} started", shared.gate.identifier());

        Self {
            shared: weak,
            gate: shared.gate.clone(),
            listener,
            _stopper: stopper,
        }
    }

    async fn run(shared: Weak<Shared>, mut statuses: Valved<Subscription<ConnectionStatus>>) {
        while let Some(status) = statuses.next().await {
            let shared = match shared.upgrade() {
                Some(shared) => shared,
                None => break,
            };

            let epoch = {
                let mut cache = shared.lock_cache();
                if !cache.on_status(status) {
                    continue;
                }
                cache.epoch
            };
            shared.enumerate(epoch).await;
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.gate.events().remove(self.listener);

        // Nobody watches the status while stopped, so nothing cached can be trusted later.
        if let Some(shared) = self.shared.upgrade() {
            shared.lock_cache().reset();
            log::debug!("Service discovery of {} stopped", shared.gate.identifier());
        }
    }
}

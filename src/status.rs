use std::sync::{Arc, Weak};

use futures::{future, stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::common::ConnectionStatus;
use crate::gate::ConnectionGate;
use crate::platform::Handler;
use crate::stream::{Lease, RefCount, Subscription};
use crate::watch::{NativeEvent, NativeWatch};

/// Multicast connection status, replaying the current status to every new subscriber.
#[derive(Clone)]
pub(crate) struct StatusStream {
    shared: Arc<Shared>,
}

struct Shared {
    gate: Arc<ConnectionGate>,
    sender: broadcast::Sender<ConnectionStatus>,
    refs: RefCount<NativeWatch>,
}

impl StatusStream {
    pub(crate) fn new(gate: Arc<ConnectionGate>) -> Self {
        let (sender, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                gate,
                sender,
                refs: RefCount::new(),
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> Subscription<ConnectionStatus> {
        // Subscribe before reading the status, so a transition in between is
        // delivered after it instead of being lost.
        let receiver = self.shared.sender.subscribe();
        self.shared.refs.acquire(|| self.shared.start());

        let current = self.shared.gate.current_status();
        let updates = BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() });

        let shared = self.shared.clone();
        Subscription::new(
            Box::pin(stream::once(future::ready(current)).chain(updates)),
            Lease::new(move || shared.refs.release()),
        )
    }

    #[cfg(test)]
    pub(crate) fn subscribers(&self) -> usize {
        self.shared.refs.subscribers()
    }
}

impl Shared {
    fn start(&self) -> NativeWatch {
        let emit = emitter(Arc::downgrade(&self.gate), self.sender.clone());

        log::debug!("Status stream of {} started", self.gate.identifier());

        NativeWatch::start(
            self.gate.clone(),
            NativeEvent::StatusChanged,
            emit.clone(),
            Some(emit),
        )
    }
}

fn emitter(gate: Weak<ConnectionGate>, sender: broadcast::Sender<ConnectionStatus>) -> Handler {
    Arc::new(move || {
        if let Some(gate) = gate.upgrade() {
            sender.send(gate.current_status()).ok();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ConnectionConfig;
    use crate::platform::mock::{MockLink, MockPlatform};
    use std::time::Duration;
    use tokio::time::timeout;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn setup() -> (Arc<MockLink>, Arc<ConnectionGate>, StatusStream) {
        let platform = MockPlatform::new();
        let link = platform.insert(ADDRESS, MockLink::new());
        let gate = ConnectionGate::new(ADDRESS.to_string(), platform);
        let statuses = StatusStream::new(gate.clone());
        (link, gate, statuses)
    }

    async fn next(subscription: &mut Subscription<ConnectionStatus>) -> ConnectionStatus {
        timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("no status within a second")
            .expect("status stream ended")
    }

    #[tokio::test]
    async fn early_subscriber_sees_disconnected_then_connected() {
        let (_link, gate, statuses) = setup();
        let mut subscription = statuses.subscribe();

        assert_eq!(next(&mut subscription).await, ConnectionStatus::Disconnected);

        gate.connect(&ConnectionConfig::default()).await.unwrap();
        assert_eq!(next(&mut subscription).await, ConnectionStatus::Connected);

        gate.disconnect().await.unwrap();
        assert_eq!(next(&mut subscription).await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn late_subscriber_starts_with_connected() {
        let (_link, gate, statuses) = setup();
        gate.connect(&ConnectionConfig::default()).await.unwrap();

        let mut subscription = statuses.subscribe();
        assert_eq!(next(&mut subscription).await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn native_changes_are_forwarded() {
        let (link, gate, statuses) = setup();
        let mut subscription = statuses.subscribe();
        next(&mut subscription).await;

        gate.connect(&ConnectionConfig::default()).await.unwrap();
        assert_eq!(next(&mut subscription).await, ConnectionStatus::Connected);

        link.set_status(ConnectionStatus::Disconnected);
        assert_eq!(next(&mut subscription).await, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn native_handler_follows_subscriber_count() {
        let (link, gate, statuses) = setup();
        gate.connect(&ConnectionConfig::default()).await.unwrap();
        // The gate keeps its own handler to notice a lost link.
        assert_eq!(link.status_handler_count(), 1);

        let first = statuses.subscribe();
        let second = statuses.subscribe();
        assert_eq!(link.status_registrations(), 2);
        assert_eq!(statuses.subscribers(), 2);

        drop(first);
        assert_eq!(link.status_removals(), 0);

        drop(second);
        assert_eq!(link.status_removals(), 1);
        assert_eq!(link.status_handler_count(), 1);

        let again = statuses.subscribe();
        assert_eq!(link.status_registrations(), 3);
        assert_eq!(link.status_handler_count(), 2);

        drop(again);
        assert_eq!(link.status_removals(), 2);
        assert!(gate.events().is_empty());
    }

    #[tokio::test]
    async fn teardown_without_link_is_harmless() {
        let (link, gate, statuses) = setup();

        drop(statuses.subscribe());

        assert_eq!(link.status_registrations(), 0);
        assert_eq!(link.status_removals(), 0);
        assert!(gate.events().is_empty());
    }
}

use std::sync::{Arc, Weak};

use futures::{future, stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::gate::ConnectionGate;
use crate::stream::{Lease, RefCount, Subscription};
use crate::watch::{NativeEvent, NativeWatch};

/// Multicast device name. Starts with the current name, then follows native renames.
#[derive(Clone)]
pub(crate) struct NameStream {
    shared: Arc<Shared>,
}

struct Shared {
    gate: Arc<ConnectionGate>,
    /// Name known before any link exists.
    advertised: String,
    sender: broadcast::Sender<String>,
    refs: RefCount<NativeWatch>,
}

impl NameStream {
    pub(crate) fn new(gate: Arc<ConnectionGate>, advertised: String) -> Self {
        let (sender, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                gate,
                advertised,
                sender,
                refs: RefCount::new(),
            }),
        }
    }

    pub(crate) fn current(&self) -> String {
        current_name(&self.shared.gate, &self.shared.advertised)
    }

    pub(crate) fn subscribe(&self) -> Subscription<String> {
        let receiver = self.shared.sender.subscribe();
        self.shared.refs.acquire(|| self.shared.start());

        let current = self.current();
        let updates = BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() });

        let shared = self.shared.clone();
        Subscription::new(
            Box::pin(stream::once(future::ready(current)).chain(updates)),
            Lease::new(move || shared.refs.release()),
        )
    }
}

impl Shared {
    fn start(&self) -> NativeWatch {
        let gate: Weak<ConnectionGate> = Arc::downgrade(&self.gate);
        let advertised = self.advertised.clone();
        let sender = self.sender.clone();

        NativeWatch::start(
            self.gate.clone(),
            NativeEvent::NameChanged,
            Arc::new(move || {
                if let Some(gate) = gate.upgrade() {
                    let name = current_name(&gate, &advertised);
                    log::trace!("{} is now called {:?}", gate.identifier(), name);
                    sender.send(name).ok();
                }
            }),
            None,
        )
    }
}

fn current_name(gate: &ConnectionGate, advertised: &str) -> String {
    gate.link()
        .and_then(|link| link.name())
        .unwrap_or_else(|| advertised.to_string())
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::gate::{ConnectionGate, GateEvent};
use crate::platform::{same_link, Handler, HandlerId, NativeLink};

/// Which native notification a [`NativeWatch`] listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeEvent {
    StatusChanged,
    NameChanged,
}

impl NativeEvent {
    fn register(self, link: &dyn NativeLink, handler: Handler) -> HandlerId {
        match self {
            NativeEvent::StatusChanged => link.on_status_changed(handler),
            NativeEvent::NameChanged => link.on_name_changed(handler),
        }
    }

    fn remove(self, link: &dyn NativeLink, id: HandlerId) -> bool {
        match self {
            NativeEvent::StatusChanged => link.remove_status_handler(id),
            NativeEvent::NameChanged => link.remove_name_handler(id),
        }
    }
}

struct Registration {
    link: Arc<dyn NativeLink>,
    id: HandlerId,
}

/// Keeps one native handler registered on whatever link the gate currently holds.
///
/// The handler moves to the new link on every connect and is removed on
/// disconnect. Dropping the watch removes both the gate listener and the
/// native handler.
pub(crate) struct NativeWatch {
    gate: Arc<ConnectionGate>,
    listener: HandlerId,
    slot: Arc<Slot>,
}

struct Slot {
    event: NativeEvent,
    handler: Handler,
    registration: Mutex<Option<Registration>>,
}

impl NativeWatch {
    /// `on_gate` runs after each connect or disconnect of the gate, once the
    /// handler has been moved.
    pub(crate) fn start(
        gate: Arc<ConnectionGate>,
        event: NativeEvent,
        handler: Handler,
        on_gate: Option<Handler>,
    ) -> Self {
        let slot = Arc::new(Slot {
            event,
            handler,
            registration: Mutex::new(None),
        });

        let listener = gate.events().add({
            let slot = slot.clone();

            move |gate_event| {
                match gate_event {
                    GateEvent::Established(link) => slot.register(link.clone()),
                    GateEvent::Released => slot.unregister(),
                }
                if let Some(on_gate) = on_gate.as_ref() {
                    on_gate();
                }
            }
        });

        // A link that is already up is watched right away.
        slot.register_current(&gate);

        Self {
            gate,
            listener,
            slot,
        }
    }
}

impl Drop for NativeWatch {
    fn drop(&mut self) {
        self.gate.events().remove(self.listener);
        self.slot.unregister();
    }
}

impl Slot {
    fn register(&self, link: Arc<dyn NativeLink>) {
        let mut registration = self.lock_registration();
        self.move_to(&mut registration, link);
    }

    /// Reads the gate's link under the registration lock, so a release racing
    /// with this call is applied after it and not lost.
    fn register_current(&self, gate: &ConnectionGate) {
        let mut registration = self.lock_registration();
        if let Some(link) = gate.link() {
            self.move_to(&mut registration, link);
        }
    }

    fn move_to(&self, registration: &mut Option<Registration>, link: Arc<dyn NativeLink>) {
        if let Some(current) = registration.as_ref() {
            if same_link(&current.link, &link) {
                return;
            }
        }
        if let Some(previous) = registration.take() {
            self.event.remove(previous.link.as_ref(), previous.id);
        }

        let id = self.event.register(link.as_ref(), self.handler.clone());
        *registration = Some(Registration { link, id });
    }

    fn unregister(&self) {
        let registration = self.lock_registration().take();

        if let Some(registration) = registration {
            self.event.remove(registration.link.as_ref(), registration.id);
        }
    }

    fn lock_registration(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

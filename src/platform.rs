//! The seam between the device pipeline and a concrete BLE stack.
//!
//! A [`Platform`] resolves identifiers into [`NativeLink`]s and provides the
//! adapter-level advertisement stream. Everything above this module only talks
//! to these traits, so the same pipeline runs on btleplug or in memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::common::{ConnectionStatus, PairingOutcome, ProtectionLevel};
use crate::Result;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub trait Platform: Send + Sync + 'static {
    /// Find the peripheral with the given identifier and open a link to it.
    /// `Ok(None)` means the identifier is unknown to the platform.
    fn resolve_link<'a>(
        &'a self,
        identifier: &'a str,
    ) -> BoxFuture<'a, Result<Option<Arc<dyn NativeLink>>>>;

    /// Start an adapter scan and stream every advertisement it sees.
    fn scan_stream(&self) -> BoxFuture<'_, Result<BoxStream<'static, Advertisement>>>;
}

pub trait NativeLink: Send + Sync + 'static {
    fn is_pairable(&self) -> bool;

    fn is_paired(&self) -> bool;

    fn pair(&self, level: ProtectionLevel) -> BoxFuture<'_, Result<PairingOutcome>>;

    /// Connection state as currently reported by the native layer.
    fn status(&self) -> ConnectionStatus;

    fn name(&self) -> Option<String>;

    fn on_status_changed(&self, handler: Handler) -> HandlerId;

    fn remove_status_handler(&self, id: HandlerId) -> bool;

    fn on_name_changed(&self, handler: Handler) -> HandlerId;

    fn remove_name_handler(&self, id: HandlerId) -> bool;

    /// Services exposed by the peripheral, discovering them if needed.
    fn services(&self) -> BoxFuture<'_, Result<Vec<ServiceHandle>>>;

    /// Tear down the radio session. The link is not used afterwards.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// One advertisement seen by an adapter scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub identifier: String,
    pub rssi: i16,
    pub local_name: Option<String>,
}

/// Platform-neutral description of a discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Uuid>,
}

pub type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

type Entry<T> = (HandlerId, Arc<dyn Fn(&T) + Send + Sync>);

/// Registry of callbacks, used for native change notifications.
///
/// `notify` runs on a snapshot of the registered callbacks, so a callback may
/// add or remove handlers (including itself) while it is being invoked.
pub struct Handlers<T = ()> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Handlers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    /// Returns false when no handler was registered under `id`.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, value: &T) {
        let snapshot = self
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect::<Vec<_>>();

        for handler in snapshot {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Handlers<()> {
    /// Register a handler shaped like the ones [`NativeLink`] accepts.
    pub fn add_handler(&self, handler: Handler) -> HandlerId {
        self.add(move |_| handler())
    }
}

/// Whether both handles point at the same native link.
pub(crate) fn same_link(a: &Arc<dyn NativeLink>, b: &Arc<dyn NativeLink>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn removed_handler_is_not_notified() {
        let handlers = Handlers::<u8>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = handlers.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handlers.notify(&1);

        assert!(handlers.remove(id));
        assert!(!handlers.remove(id));
        handlers.notify(&2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handlers.is_empty());
    }

    #[test]
    fn handler_can_unregister_itself_while_notified() {
        let handlers = Arc::new(Handlers::<()>::new());
        let slot = Arc::new(Mutex::new(None));

        let registry = handlers.clone();
        let own_id = slot.clone();
        let id = handlers.add(move |_| {
            if let Some(id) = own_id.lock().unwrap().take() {
                registry.remove(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        handlers.notify(&());
        assert!(handlers.is_empty());
    }
}

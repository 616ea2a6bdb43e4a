use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;

/// A consumer's handle on one of the device streams.
///
/// Dropping the subscription detaches the consumer. When it was the last one
/// attached, the stream releases the native resources it acquired.
pub struct Subscription<T> {
    inner: Pin<Box<dyn Stream<Item = T> + Send>>,
    _lease: Lease,
}

impl<T> Subscription<T> {
    pub(crate) fn new(inner: Pin<Box<dyn Stream<Item = T> + Send>>, lease: Lease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Runs its release callback exactly once, when dropped.
pub(crate) struct Lease(Option<Box<dyn FnOnce() + Send>>);

impl Lease {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

/// Subscriber count plus the resource held while it is non-zero.
///
/// The resource is built on the first `acquire` and dropped on the last
/// `release`; its `Drop` impl is where teardown lives.
pub(crate) struct RefCount<A> {
    state: Mutex<RefState<A>>,
}

struct RefState<A> {
    subscribers: usize,
    active: Option<A>,
}

impl<A> RefCount<A> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RefState {
                subscribers: 0,
                active: None,
            }),
        }
    }

    pub(crate) fn acquire(&self, start: impl FnOnce() -> A) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscribers += 1;
        if state.active.is_none() {
            state.active = Some(start());
        }
    }

    pub(crate) fn release(&self) {
        let stopped = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.subscribers = state.subscribers.saturating_sub(1);
            if state.subscribers == 0 {
                state.active.take()
            } else {
                None
            }
        };

        // Teardown runs outside the lock, it may call back into the device.
        drop(stopped);
    }

    #[cfg(test)]
    pub(crate) fn subscribers(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
    }
}

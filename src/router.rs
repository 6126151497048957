//! Error routing that follows connection custody.
//!
//! Every connection carries exactly one [`Custody`] value inside its state
//! lock. Handing a connection to a caller or taking it back swaps that value
//! in a single critical section, so an error is always attributed to exactly
//! one observer. The transport sees a single forwarding callback per session
//! for the whole life of the session; custody changes never touch it.
//!
//! The first error on a connection moves it to `Closing` and is counted and
//! delivered. Anything the session reports after that (a server typically
//! sends "terminating connection" and then the socket drops) describes the
//! same event and is absorbed.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::{ConnectionId, ConnectionState, Shared, Slot};
use crate::error::Error;
use crate::TransportObserver;

/// Callback receiving connection-level errors.
pub type ErrorObserver = Arc<dyn Fn(ConnectionId, &Error) + Send + Sync>;

/// Who answers for a connection's errors right now.
#[derive(Clone)]
pub(crate) enum Custody {
    /// idle in the pool, errors go to the pool default observer
    Pool,
    /// checked out; `None` means the caller bound no observer of its own and
    /// the pool default stands in
    Caller(Option<ErrorObserver>),
}

impl Debug for Custody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Custody::Pool => f.write_str("Pool"),
            Custody::Caller(Some(_)) => f.write_str("Caller(observer)"),
            Custody::Caller(None) => f.write_str("Caller(default)"),
        }
    }
}

/// An error accepted by the router, to be handed to its observer once the
/// state lock is released.
#[must_use]
pub(crate) struct Delivery {
    connection: ConnectionId,
    error: Error,
    observer: Option<ErrorObserver>,
}

impl Delivery {
    pub(crate) fn deliver(self) {
        match self.observer {
            Some(observer) => observer(self.connection, &self.error),
            None => tracing::warn!(
                connection = %self.connection,
                error = %self.error,
                "unobserved connection error"
            ),
        }
    }
}

#[derive(Default)]
pub struct ErrorRouter {
    default: RwLock<Option<ErrorObserver>>,
    errors: AtomicU64,
}

impl Debug for ErrorRouter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRouter")
            .field("has_default", &self.default.read().is_some())
            .field("errors", &self.error_count())
            .finish()
    }
}

impl ErrorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool-wide default observer.
    pub fn set_default(&self, observer: ErrorObserver) {
        *self.default.write() = Some(observer);
    }

    /// Errors delivered so far. Each logical connection error counts once.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Zero the counter and return its previous value.
    pub fn reset_error_count(&self) -> u64 {
        self.errors.swap(0, Ordering::SeqCst)
    }

    /// Swap pool custody for caller custody. Caller must hold the slot lock.
    pub(crate) fn bind_to_caller(&self, slot: &mut Slot, observer: Option<ErrorObserver>) {
        slot.custody = Custody::Caller(observer);
    }

    /// Inverse of [`bind_to_caller`](Self::bind_to_caller), run on release.
    pub(crate) fn bind_to_pool(&self, slot: &mut Slot) {
        slot.custody = Custody::Pool;
    }

    /// Accept `error` for the connection if it is still usable. Must be called
    /// with the slot lock held; the returned delivery runs after unlocking.
    pub(crate) fn raise(&self, shared: &Shared, slot: &mut Slot, error: Error) -> Option<Delivery> {
        if !slot.state.is_usable() {
            tracing::trace!(connection = %shared.id, error = %error, "absorbed error on retired connection");
            return None;
        }
        // a session killed mid-transaction is the deadline, whoever noticed first
        let error = match slot.monitor.preempt() {
            Some(timeout) => {
                tracing::warn!(connection = %shared.id, ?timeout, error = %error, "session terminated during armed transaction");
                Error::IdleInTransactionTimeout(timeout)
            }
            None => error,
        };
        slot.state = ConnectionState::Closing;
        slot.monitor.disarm();
        shared.signal_terminated();
        self.errors.fetch_add(1, Ordering::SeqCst);
        let observer = match &slot.custody {
            Custody::Caller(Some(observer)) => Some(observer.clone()),
            Custody::Caller(None) | Custody::Pool => self.default.read().clone(),
        };
        Some(Delivery {
            connection: shared.id,
            error,
            observer,
        })
    }

    /// Route an error coming from outside the state lock.
    pub(crate) fn report(&self, shared: &Shared, error: Error) {
        let delivery = {
            let mut slot = shared.slot.lock();
            self.raise(shared, &mut slot, error)
        };
        if let Some(delivery) = delivery {
            delivery.deliver();
        }
    }

    /// The callback installed on the transport for one session.
    pub(crate) fn forwarder(self: &Arc<Self>, shared: &Arc<Shared>) -> TransportObserver {
        let router = self.clone();
        let shared = shared.clone();
        Arc::new(move |error| router.report(&shared, error))
    }
}

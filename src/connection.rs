use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::monitor::TimeoutMonitor;
use crate::router::Custody;
use crate::Transport;

/// Opaque connection identity, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// in the idle set, custody with the pool
    Idle,
    /// handed to a caller
    CheckedOut,
    /// errored or timed out, waiting to be closed by whoever holds it
    Closing,
    /// raw session closed
    Closed,
}

impl ConnectionState {
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::CheckedOut)
    }
}

/// Everything guarded by the connection's state lock. Custody rebinding,
/// timeout firing and error delivery all happen inside this one lock.
pub(crate) struct Slot {
    pub(crate) state: ConnectionState,
    pub(crate) custody: Custody,
    pub(crate) monitor: TimeoutMonitor,
}

/// State shared between the connection, its timeout task and the transport
/// error callback.
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) slot: Mutex<Slot>,
    terminated: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn new(id: ConnectionId) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            id,
            slot: Mutex::new(Slot {
                state: ConnectionState::Idle,
                custody: Custody::Pool,
                monitor: TimeoutMonitor::default(),
            }),
            terminated,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    /// Wake anything waiting on a statement so it fails fast.
    pub(crate) fn signal_terminated(&self) {
        self.terminated.send_replace(true);
    }

    pub(crate) fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    /// Move a usable connection to Closing without reporting an ambient
    /// error. Statement failures take this path; the caller already sees them.
    pub(crate) fn retire(&self) -> bool {
        let mut slot = self.slot.lock();
        if !slot.state.is_usable() {
            return false;
        }
        slot.state = ConnectionState::Closing;
        slot.monitor.disarm();
        drop(slot);
        self.signal_terminated();
        true
    }
}

/// A raw transport session together with its pool-side bookkeeping.
pub struct Connection<T: Transport> {
    pub(crate) handle: T::Handle,
    pub(crate) shared: Arc<Shared>,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(handle: T::Handle, shared: Arc<Shared>) -> Self {
        Self { handle, shared }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl<T: Transport> Debug for Connection<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

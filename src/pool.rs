use crate::config::PoolConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState, Shared};
use crate::error::{Error, Result};
use crate::event::PoolEvent;
use crate::guard::PooledConnection;
use crate::router::{ErrorObserver, ErrorRouter};
use crate::state::State;
use crate::Transport;
use dark_std::sync::AtomicDuration;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

/// Entry in the idle queue. `Vacated` wakes a blocked acquirer after a
/// connection was retired so it can open a replacement in the freed slot.
pub(crate) enum Idle<T: Transport> {
    Ready(Connection<T>),
    Vacated,
}

/// Pool hands out connections to callers and takes them back.
///
/// Cloning is cheap; all clones share the same connections, observers and
/// counters.
pub struct Pool<T: Transport> {
    pub transport: Arc<T>,
    pub(crate) router: Arc<ErrorRouter>,
    idle_send: Arc<Sender<Idle<T>>>,
    idle_recv: Arc<Receiver<Idle<T>>>,
    registry: Arc<Mutex<HashMap<ConnectionId, Arc<Shared>>>>,
    events: broadcast::Sender<PoolEvent>,
    max_open: Arc<AtomicU64>,
    // open connections plus reservations for ones being opened
    slots: Arc<AtomicU64>,
    waits: Arc<AtomicU64>,
    connecting: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    acquire_timeout_ms: Arc<AtomicU64>,
    idle_in_transaction_timeout: Arc<AtomicDuration>,
}

impl<T: Transport> Debug for Pool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        Debug::fmt(&state, f)
    }
}

impl<T: Transport> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            router: self.router.clone(),
            idle_send: self.idle_send.clone(),
            idle_recv: self.idle_recv.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            max_open: self.max_open.clone(),
            slots: self.slots.clone(),
            waits: self.waits.clone(),
            connecting: self.connecting.clone(),
            next_id: self.next_id.clone(),
            closed: self.closed.clone(),
            acquire_timeout_ms: self.acquire_timeout_ms.clone(),
            idle_in_transaction_timeout: self.idle_in_transaction_timeout.clone(),
        }
    }
}

impl<T: Transport> Pool<T> {
    /// Pool with [`PoolConfig::default`].
    pub fn new(transport: T) -> Self {
        Self::build(transport, PoolConfig::default())
    }

    /// Fails with [`Error::Config`] on an invalid configuration.
    pub fn with_config(transport: T, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    fn build(transport: T, config: PoolConfig) -> Self {
        let (s, r) = flume::unbounded();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport: Arc::new(transport),
            router: Arc::new(ErrorRouter::new()),
            idle_send: Arc::new(s),
            idle_recv: Arc::new(r),
            registry: Arc::new(Mutex::new(HashMap::new())),
            events,
            max_open: Arc::new(AtomicU64::new(config.max_connections)),
            slots: Arc::new(AtomicU64::new(0)),
            waits: Arc::new(AtomicU64::new(0)),
            connecting: Arc::new(AtomicU64::new(0)),
            next_id: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            acquire_timeout_ms: Arc::new(AtomicU64::new(config.acquire_timeout_ms)),
            idle_in_transaction_timeout: Arc::new(AtomicDuration::new(
                config.idle_in_transaction_timeout_duration(),
            )),
        }
    }

    /// Check out a connection, waiting up to the configured acquire timeout.
    /// Its errors go to the default observer until it is released.
    pub async fn acquire(&self) -> Result<PooledConnection<T>> {
        self.checkout(None, self.get_acquire_timeout()).await
    }

    /// Like [`acquire`](Self::acquire), but errors on the connection are
    /// delivered to `observer` only, until release.
    pub async fn acquire_with<F>(&self, observer: F) -> Result<PooledConnection<T>>
    where
        F: Fn(ConnectionId, &Error) + Send + Sync + 'static,
    {
        self.checkout(Some(Arc::new(observer)), self.get_acquire_timeout())
            .await
    }

    /// Acquire with an explicit timeout instead of the configured one.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<T>> {
        self.checkout(None, timeout).await
    }

    async fn checkout(
        &self,
        observer: Option<ErrorObserver>,
        timeout: Duration,
    ) -> Result<PooledConnection<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.waits.fetch_add(1, Ordering::SeqCst);
        defer!(|| {
            self.waits.fetch_sub(1, Ordering::SeqCst);
        });
        tokio::time::timeout(timeout, self.wait_for_connection(&observer))
            .await
            .map_err(|_| {
                tracing::debug!(?timeout, "acquire timed out");
                Error::PoolExhausted(timeout)
            })?
    }

    async fn wait_for_connection(
        &self,
        observer: &Option<ErrorObserver>,
    ) -> Result<PooledConnection<T>> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            let entry = match self.idle_recv.try_recv() {
                Ok(entry) => entry,
                Err(_) => {
                    if self.try_reserve() {
                        Idle::Ready(self.open().await?)
                    } else {
                        self.idle_recv
                            .recv_async()
                            .await
                            .map_err(|_| Error::Closed)?
                    }
                }
            };
            if let Idle::Ready(conn) = entry {
                match self.check_out(conn, observer) {
                    Ok(guard) => return Ok(guard),
                    // errored while idle, its slot is backfilled on the next pass
                    Err(conn) => self.retire(conn),
                }
            }
        }
    }

    fn try_reserve(&self) -> bool {
        let max = self.max_open.load(Ordering::SeqCst);
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn free_slot(&self) {
        self.slots.fetch_sub(1, Ordering::SeqCst);
        if self.waits.load(Ordering::SeqCst) > 0 {
            _ = self.idle_send.send(Idle::Vacated);
        }
    }

    /// Open a connection into an already reserved slot. The slot is given
    /// back if opening fails or the caller stops waiting.
    async fn open(&self) -> Result<Connection<T>> {
        self.connecting.fetch_add(1, Ordering::SeqCst);
        defer!(|| {
            self.connecting.fetch_sub(1, Ordering::SeqCst);
        });
        let kept = AtomicBool::new(false);
        defer!(|| {
            if !kept.load(Ordering::SeqCst) {
                self.free_slot();
            }
        });
        let handle = self.transport.open().await?;
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let shared = Arc::new(Shared::new(id));
        self.transport
            .on_error(&handle, self.router.forwarder(&shared));
        self.registry.lock().insert(id, shared.clone());
        kept.store(true, Ordering::SeqCst);
        tracing::debug!(connection = %id, "opened connection");
        Ok(Connection::new(handle, shared))
    }

    fn check_out(
        &self,
        conn: Connection<T>,
        observer: &Option<ErrorObserver>,
    ) -> std::result::Result<PooledConnection<T>, Connection<T>> {
        {
            let mut slot = conn.shared.slot.lock();
            if slot.state != ConnectionState::Idle {
                drop(slot);
                return Err(conn);
            }
            slot.state = ConnectionState::CheckedOut;
            slot.monitor.reset();
            self.router.bind_to_caller(&mut slot, observer.clone());
        }
        tracing::debug!(connection = %conn.id(), "acquired connection");
        self.emit(PoolEvent::Acquired {
            connection: conn.id(),
        });
        Ok(PooledConnection::new(conn, self.clone()))
    }

    /// Return a connection. Same as dropping the guard.
    pub fn release(&self, conn: PooledConnection<T>) {
        drop(conn);
    }

    /// Take a connection back from its guard: back to the idle set if it is
    /// still healthy, closed otherwise.
    pub(crate) fn recycle(&self, conn: Connection<T>) {
        let id = conn.id();
        let reusable = {
            let mut slot = conn.shared.slot.lock();
            slot.monitor.reset();
            let keep = slot.state == ConnectionState::CheckedOut
                && !self.closed.load(Ordering::SeqCst)
                && self.slots.load(Ordering::SeqCst) <= self.max_open.load(Ordering::SeqCst);
            if keep {
                slot.state = ConnectionState::Idle;
                self.router.bind_to_pool(&mut slot);
            }
            keep
        };
        if reusable {
            if let Err(e) = self.idle_send.send(Idle::Ready(conn)) {
                if let Idle::Ready(conn) = e.into_inner() {
                    self.retire(conn);
                }
            }
        } else {
            self.retire(conn);
        }
        tracing::debug!(connection = %id, retired = !reusable, "released connection");
        self.emit(PoolEvent::Released {
            connection: id,
            retired: !reusable,
        });
    }

    /// Best-effort ROLLBACK for a guard dropped mid-transaction, then release.
    pub(crate) async fn rollback_and_recycle(self, mut conn: Connection<T>) {
        tracing::debug!(connection = %conn.id(), "rolling back abandoned transaction");
        if let Err(e) = self.transport.execute(&mut conn.handle, "ROLLBACK").await {
            tracing::warn!(connection = %conn.id(), error = %e, "rollback of abandoned transaction failed");
            conn.shared.retire();
        }
        self.recycle(conn);
    }

    /// Close a connection for good and free its slot.
    fn retire(&self, conn: Connection<T>) {
        let id = conn.id();
        {
            let mut slot = conn.shared.slot.lock();
            slot.state = ConnectionState::Closed;
            slot.monitor.reset();
        }
        conn.shared.signal_terminated();
        self.transport.off_error(&conn.handle);
        self.registry.lock().remove(&id);
        self.transport.close(conn.handle);
        tracing::debug!(connection = %id, "closed connection");
        self.free_slot();
    }

    /// Register the default observer for connections without a caller-specific one.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(ConnectionId, &Error) + Send + Sync + 'static,
    {
        self.router.set_default(Arc::new(observer));
    }

    pub fn error_count(&self) -> u64 {
        self.router.error_count()
    }

    /// Zero the error counter, returning the previous count.
    pub fn reset_error_count(&self) -> u64 {
        self.router.reset_error_count()
    }

    /// Lifecycle events. Events published while nobody listens are dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        _ = self.events.send(event);
    }

    pub fn state(&self) -> State {
        let (mut idle, mut in_use, mut closing) = (0, 0, 0);
        let registry = self.registry.lock();
        for shared in registry.values() {
            match shared.state() {
                ConnectionState::Idle => idle += 1,
                ConnectionState::CheckedOut => in_use += 1,
                ConnectionState::Closing => closing += 1,
                ConnectionState::Closed => {}
            }
        }
        State {
            max_open: self.max_open.load(Ordering::Relaxed),
            connections: idle + in_use + closing,
            idle,
            in_use,
            closing,
            connecting: self.connecting.load(Ordering::SeqCst),
            waits: self.waits.load(Ordering::SeqCst),
            errors: self.router.error_count(),
        }
    }

    /// Change the connection limit. Growing wakes waiters that can now open a
    /// connection. Shrinking closes surplus idle connections now and surplus
    /// checked-out ones as they are released.
    pub fn set_max_open(&self, n: u64) {
        if n == 0 {
            return;
        }
        let old = self.max_open.swap(n, Ordering::SeqCst);
        if n > old {
            let wake = (n - old).min(self.waits.load(Ordering::SeqCst));
            for _ in 0..wake {
                _ = self.idle_send.send(Idle::Vacated);
            }
            return;
        }
        while self.slots.load(Ordering::SeqCst) > n {
            match self.idle_recv.try_recv() {
                Ok(Idle::Ready(conn)) => self.retire(conn),
                Ok(Idle::Vacated) => {}
                Err(_) => break,
            }
        }
    }

    pub fn get_max_open(&self) -> u64 {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn set_acquire_timeout(&self, timeout: Duration) {
        self.acquire_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms.load(Ordering::SeqCst))
    }

    /// Default idle-in-transaction deadline; `None` disables it.
    pub fn set_idle_in_transaction_timeout(&self, timeout: Option<Duration>) {
        self.idle_in_transaction_timeout.store(timeout);
    }

    pub fn idle_in_transaction_timeout(&self) -> Option<Duration> {
        self.idle_in_transaction_timeout.get()
    }

    /// Shut the pool down. Idle connections close now, checked-out ones on
    /// release, and every later acquire fails with [`Error::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        while let Ok(entry) = self.idle_recv.try_recv() {
            if let Idle::Ready(conn) = entry {
                self.retire(conn);
            }
        }
        for _ in 0..self.waits.load(Ordering::SeqCst) {
            _ = self.idle_send.send(Idle::Vacated);
        }
        tracing::debug!("pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

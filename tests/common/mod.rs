#![allow(dead_code)]

use async_trait::async_trait;
use idle_tx_pool::{Error, Pool, PoolConfig, Transport, TransportObserver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory transport. Handle ids count up from 1 in open order, which
/// matches the pool's connection ids as long as no open fails.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    next_id: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    fail_open: AtomicBool,
    statements: Mutex<Vec<(u64, String)>>,
    observers: Mutex<HashMap<u64, Vec<TransportObserver>>>,
    session_timeouts: Mutex<HashMap<u64, Option<Duration>>>,
    failing: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

#[derive(Debug)]
pub struct MockHandle {
    pub id: u64,
}

#[async_trait]
impl Transport for MockTransport {
    type Handle = MockHandle;
    type Rows = Vec<String>;

    async fn open(&self) -> Result<Self::Handle, Error> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(Error::transport("connection refused"));
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    fn close(&self, _handle: Self::Handle) {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn execute(&self, handle: &mut Self::Handle, statement: &str) -> Result<Self::Rows, Error> {
        self.inner
            .statements
            .lock()
            .push((handle.id, statement.to_string()));
        let delay = self.inner.delays.lock().get(statement).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fail = self.inner.failing.lock().iter().any(|s| s == statement);
        if fail {
            return Err(Error::transport(format!("{} failed", statement)));
        }
        Ok(vec![statement.to_string()])
    }

    async fn set_session_timeout(
        &self,
        handle: &mut Self::Handle,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.inner.session_timeouts.lock().insert(handle.id, timeout);
        Ok(())
    }

    fn on_error(&self, handle: &Self::Handle, observer: TransportObserver) {
        self.inner
            .observers
            .lock()
            .entry(handle.id)
            .or_default()
            .push(observer);
    }

    fn off_error(&self, handle: &Self::Handle) {
        self.inner.observers.lock().remove(&handle.id);
    }
}

impl MockTransport {
    pub fn opened(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_statement(&self, statement: &str) {
        self.inner.failing.lock().push(statement.to_string());
    }

    pub fn delay_statement(&self, statement: &str, delay: Duration) {
        self.inner
            .delays
            .lock()
            .insert(statement.to_string(), delay);
    }

    /// Statements the server saw on session `id`, in order.
    pub fn statements(&self, id: u64) -> Vec<String> {
        self.inner
            .statements
            .lock()
            .iter()
            .filter(|(handle, _)| *handle == id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn session_timeout(&self, id: u64) -> Option<Duration> {
        self.inner
            .session_timeouts
            .lock()
            .get(&id)
            .copied()
            .flatten()
    }

    pub fn observer_count(&self, id: u64) -> usize {
        self.inner
            .observers
            .lock()
            .get(&id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Report an error on session `id` the way a server push would.
    pub fn emit_error(&self, id: u64, message: &str) {
        let observers = self
            .inner
            .observers
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        for observer in observers {
            observer(Error::transport(message));
        }
    }
}

pub fn init_tracing() {
    _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pool(max: u64, idle_in_transaction_ms: u64) -> Pool<MockTransport> {
    init_tracing();
    let config = PoolConfig::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(5))
        .idle_in_transaction_timeout(match idle_in_transaction_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        });
    Pool::with_config(MockTransport::default(), config).unwrap()
}

/// Counts errors delivered to an observer.
#[derive(Clone, Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn observer(&self) -> impl Fn(idle_tx_pool::ConnectionId, &Error) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |id, e| seen.lock().push(format!("{}: {}", id, e))
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

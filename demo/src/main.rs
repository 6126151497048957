use async_trait::async_trait;
use idle_tx_pool::{run, Error, Pool, PoolConfig, PoolEvent, Transport, TransportObserver};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Sessions that live in memory. Each keeps its error callback so the
/// demo can show that only one is ever attached per session.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next: AtomicU64,
    observers: Mutex<HashMap<u64, usize>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    type Handle = u64;
    type Rows = ();

    async fn open(&self) -> Result<Self::Handle, Error> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn close(&self, handle: Self::Handle) {
        tracing::info!(session = handle, "session closed");
    }

    async fn execute(&self, handle: &mut Self::Handle, statement: &str) -> Result<(), Error> {
        tracing::debug!(session = *handle, statement, "execute");
        Ok(())
    }

    async fn set_session_timeout(
        &self,
        _handle: &mut Self::Handle,
        _timeout: Option<Duration>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn on_error(&self, handle: &Self::Handle, _observer: TransportObserver) {
        if let Ok(mut observers) = self.observers.lock() {
            *observers.entry(*handle).or_default() += 1;
        }
    }

    fn off_error(&self, handle: &Self::Handle) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.remove(handle);
        }
    }
}

async fn scenario(pool: &Pool<MemoryTransport>, name: &str, delay: Duration) {
    let before = pool.error_count();
    let outcome = run(pool, None, |conn| {
        Box::pin(async move {
            conn.execute("SELECT 1").await?;
            tokio::time::sleep(delay).await;
            conn.execute("SELECT 1").await?;
            Ok::<_, Error>(())
        })
    })
    .await;
    println!(
        "{}: outcome = {:?}, errors +{}, state = {}",
        name,
        outcome,
        pool.error_count() - before,
        pool.state()
    );
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PoolConfig::new()
        .max_connections(2)
        .idle_in_transaction_timeout(Some(Duration::from_millis(1000)));
    let p = Pool::with_config(MemoryTransport::default(), config).unwrap();
    p.on_error(|id, e| println!("pool observer: {} {}", id, e));

    let mut events = p.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if !matches!(event, PoolEvent::Acquired { .. }) {
                println!("event = {:?}", event);
            }
        }
    });

    scenario(&p, "finishes in time", Duration::from_millis(500)).await;
    scenario(&p, "idles too long", Duration::from_millis(1500)).await;
    scenario(&p, "idles too long again", Duration::from_millis(1500)).await;
    println!(
        "total errors = {}, observers attached = {:?}",
        p.error_count(),
        p.transport.observers.lock().map(|o| o.clone()).unwrap_or_default()
    );
}

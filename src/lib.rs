#[macro_use]
mod defer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod guard;
pub mod monitor;
pub mod pool;
pub mod router;
pub mod state;
pub mod transaction;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Callback a transport invokes when a session reports an error on its own
/// (server-side termination, broken socket) rather than as a statement result.
pub type TransportObserver = Arc<dyn Fn(Error) + Send + Sync>;

/// Transport opens raw database sessions and runs statements on them.
///
/// The pool never speaks the wire protocol itself; everything below the
/// session boundary goes through this trait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Handle: Send + 'static;
    type Rows: Send;

    /// open a new raw session
    async fn open(&self) -> Result<Self::Handle>;
    /// close a raw session. Runs from `Drop`, so it can't await.
    fn close(&self, handle: Self::Handle);
    /// run one statement, failing with [`Error::Transport`] on any wire failure
    async fn execute(&self, handle: &mut Self::Handle, statement: &str) -> Result<Self::Rows>;
    /// apply the idle-in-transaction deadline at session level (`None` disables it)
    async fn set_session_timeout(
        &self,
        handle: &mut Self::Handle,
        timeout: Option<Duration>,
    ) -> Result<()>;
    /// attach the single error callback for `handle`
    fn on_error(&self, handle: &Self::Handle, observer: TransportObserver);
    /// detach the error callback for `handle`
    fn off_error(&self, handle: &Self::Handle);
}

pub use config::PoolConfig;
pub use connection::{ConnectionId, ConnectionState};
pub use error::{Error, Result};
pub use event::PoolEvent;
pub use guard::PooledConnection;
pub use monitor::MonitorState;
pub use pool::Pool;
pub use router::ErrorObserver;
pub use state::State;
pub use transaction::{run, RollbackReason, TransactionOutcome};

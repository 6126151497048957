use crate::connection::{Connection, ConnectionId, ConnectionState, Shared};
use crate::error::{Error, Result};
use crate::monitor::{self, MonitorState};
use crate::{Pool, Transport};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// PooledConnection is a checked-out connection. Dropping it releases the
/// connection back to its pool.
///
/// A guard dropped while a transaction is still open (the owning task was
/// cancelled, say) rolls back on a spawned task before releasing.
pub struct PooledConnection<T: Transport> {
    // taken only in Drop
    inner: Option<Connection<T>>,
    shared: Arc<Shared>,
    pool: Pool<T>,
    idle_timeout: Option<Duration>,
    in_transaction: bool,
}

impl<T: Transport> PooledConnection<T> {
    pub(crate) fn new(conn: Connection<T>, pool: Pool<T>) -> Self {
        let idle_timeout = pool.idle_in_transaction_timeout();
        Self {
            shared: conn.shared.clone(),
            inner: Some(conn),
            pool,
            idle_timeout,
            in_transaction: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.shared.slot.lock().monitor.state()
    }

    /// When the armed idle-in-transaction deadline elapses, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.slot.lock().monitor.deadline()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn timed_out(&self) -> bool {
        self.monitor_state() == MonitorState::Fired
    }

    pub fn idle_in_transaction_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Run one statement. Fails with [`Error::ConnectionTerminated`] as soon
    /// as the connection is terminated, even mid-statement.
    pub async fn execute(&mut self, statement: &str) -> Result<T::Rows> {
        let conn = match self.inner.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::Closed),
        };
        let id = conn.id();
        if !conn.state().is_usable() {
            return Err(Error::ConnectionTerminated(id));
        }
        let terminated = conn.shared.terminated();
        tracing::debug!(connection = %id, statement, "executing statement");
        let result = tokio::select! {
            biased;
            _ = until_terminated(terminated) => Err(Error::ConnectionTerminated(id)),
            r = self.pool.transport.execute(&mut conn.handle, statement) => r,
        };
        if let Err(e) = &result {
            if conn.shared.retire() {
                tracing::warn!(connection = %id, error = %e, "statement failed, retiring connection");
            }
        }
        result
    }

    /// Apply the session-level idle-in-transaction timeout and remember it for
    /// the next [`begin`](Self::begin). The setting stays on the session
    /// after release; every transaction sets its own.
    pub async fn set_idle_in_transaction_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let conn = match self.inner.as_mut() {
            Some(conn) => conn,
            None => return Err(Error::Closed),
        };
        if !conn.state().is_usable() {
            return Err(Error::ConnectionTerminated(conn.id()));
        }
        if let Err(e) = self
            .pool
            .transport
            .set_session_timeout(&mut conn.handle, timeout)
            .await
        {
            conn.shared.retire();
            return Err(e);
        }
        self.idle_timeout = timeout;
        Ok(())
    }

    /// BEGIN, then arm the idle-in-transaction monitor.
    pub async fn begin(&mut self) -> Result<()> {
        tracing::debug!(connection = %self.id(), "beginning transaction");
        self.execute("BEGIN").await?;
        self.in_transaction = true;
        if let Some(timeout) = self.idle_timeout {
            monitor::arm(&self.shared, &self.pool.router, timeout);
        }
        Ok(())
    }

    /// Disarm the monitor and COMMIT. Fails with
    /// [`Error::IdleInTransactionTimeout`] if the deadline already fired.
    pub async fn commit(&mut self) -> Result<()> {
        if self.disarm() == MonitorState::Fired {
            return Err(Error::IdleInTransactionTimeout(
                self.idle_timeout.unwrap_or_default(),
            ));
        }
        tracing::debug!(connection = %self.id(), "committing transaction");
        self.execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    /// Disarm the monitor and ROLLBACK. A failed rollback comes back as
    /// [`Error::RollbackFailed`]; the transaction counts as ended either way.
    pub async fn rollback(&mut self) -> Result<()> {
        self.disarm();
        tracing::debug!(connection = %self.id(), "rolling back transaction");
        let result = self.execute("ROLLBACK").await;
        self.in_transaction = false;
        result
            .map(|_| ())
            .map_err(|e| Error::RollbackFailed(e.to_string()))
    }

    /// Stop the idle-in-transaction monitor, returning where it ended up.
    /// `Fired` means the deadline won.
    pub fn disarm(&self) -> MonitorState {
        self.shared.slot.lock().monitor.disarm()
    }
}

async fn until_terminated(mut terminated: watch::Receiver<bool>) {
    loop {
        let done = *terminated.borrow_and_update();
        if done || terminated.changed().await.is_err() {
            return;
        }
    }
}

impl<T: Transport> Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.inner)
            .field("in_transaction", &self.in_transaction)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        let Some(conn) = self.inner.take() else {
            return;
        };
        conn.shared.slot.lock().monitor.disarm();
        if self.in_transaction && conn.state().is_usable() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let pool = self.pool.clone();
                    runtime.spawn(pool.rollback_and_recycle(conn));
                    return;
                }
                Err(_) => {
                    // closing the session aborts the transaction server-side
                    conn.shared.retire();
                }
            }
        }
        self.pool.recycle(conn);
    }
}

//! Run caller work inside a transaction on a pooled connection.
//!
//! ```no_run
//! use idle_tx_pool::{run, Error, Pool, Transport, TransactionOutcome};
//! use std::time::Duration;
//!
//! async fn transfer<T: Transport>(pool: &Pool<T>) {
//!     let outcome = run(pool, Some(Duration::from_secs(1)), |conn| {
//!         Box::pin(async move {
//!             conn.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1").await?;
//!             conn.execute("UPDATE accounts SET balance = balance + 10 WHERE id = 2").await?;
//!             Ok::<_, Error>(())
//!         })
//!     })
//!     .await;
//!     if let TransactionOutcome::TimedOut = outcome {
//!         // the connection was terminated and retired; retry on a fresh one
//!     }
//! }
//! ```

use std::fmt::{Display, Formatter};
use std::time::Duration;

use futures_core::future::BoxFuture;

use crate::error::Error;
use crate::event::PoolEvent;
use crate::guard::PooledConnection;
use crate::monitor::MonitorState;
use crate::{Pool, Transport};

/// How one [`run`] ended. Created once, never changed.
#[derive(Debug)]
pub enum TransactionOutcome<R, E> {
    Committed(R),
    RolledBack(RollbackReason<E>),
    /// The idle-in-transaction deadline fired before the transaction ended.
    TimedOut,
}

impl<R, E> TransactionOutcome<R, E> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed(_))
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, TransactionOutcome::RolledBack(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, TransactionOutcome::TimedOut)
    }
}

/// Why a transaction did not commit.
#[derive(Debug)]
pub enum RollbackReason<E> {
    /// No connection could be acquired; nothing was started.
    Acquire(Error),
    /// Setting the session timeout or BEGIN failed.
    Begin(Error),
    /// The caller's work returned an error.
    Work(E),
    /// COMMIT failed.
    Commit(Error),
}

impl<E: Display> Display for RollbackReason<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackReason::Acquire(e) => write!(f, "acquire failed: {}", e),
            RollbackReason::Begin(e) => write!(f, "begin failed: {}", e),
            RollbackReason::Work(e) => write!(f, "work failed: {}", e),
            RollbackReason::Commit(e) => write!(f, "commit failed: {}", e),
        }
    }
}

/// Acquire a connection, apply `idle_timeout` (the pool default when `None`),
/// BEGIN, run `work`, then COMMIT or ROLLBACK and release.
///
/// Transactional failures never surface as errors: they come back as the
/// outcome. A ROLLBACK that fails because the deadline already killed the
/// connection is logged and published on the event stream, and does not
/// change the outcome.
pub async fn run<T, F, R, E>(
    pool: &Pool<T>,
    idle_timeout: Option<Duration>,
    work: F,
) -> TransactionOutcome<R, E>
where
    T: Transport,
    F: for<'c> FnOnce(&'c mut PooledConnection<T>) -> BoxFuture<'c, Result<R, E>>,
    E: Display,
{
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            let reason = RollbackReason::Acquire(e);
            pool.emit(PoolEvent::RolledBack {
                connection: None,
                reason: reason.to_string(),
                rollback_error: None,
            });
            return TransactionOutcome::RolledBack(reason);
        }
    };
    let timeout = idle_timeout.or_else(|| pool.idle_in_transaction_timeout());

    let started = match conn.set_idle_in_transaction_timeout(timeout).await {
        Ok(()) => conn.begin().await,
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        return finish(pool, conn, TransactionOutcome::RolledBack(RollbackReason::Begin(e)), None);
    }

    let (outcome, rollback_error) = match work(&mut conn).await {
        Ok(value) => match conn.commit().await {
            Ok(()) => (TransactionOutcome::Committed(value), None),
            Err(e) => {
                let rollback_error = rollback_quietly(&mut conn).await;
                if conn.timed_out() {
                    (TransactionOutcome::TimedOut, rollback_error)
                } else {
                    (
                        TransactionOutcome::RolledBack(RollbackReason::Commit(e)),
                        rollback_error,
                    )
                }
            }
        },
        Err(e) => {
            // whichever came first, the work error or the deadline, decides
            let fired = conn.disarm() == MonitorState::Fired;
            let rollback_error = rollback_quietly(&mut conn).await;
            if fired {
                (TransactionOutcome::TimedOut, rollback_error)
            } else {
                (
                    TransactionOutcome::RolledBack(RollbackReason::Work(e)),
                    rollback_error,
                )
            }
        }
    };
    finish(pool, conn, outcome, rollback_error)
}

async fn rollback_quietly<T: Transport>(conn: &mut PooledConnection<T>) -> Option<Error> {
    match conn.rollback().await {
        Ok(()) => None,
        Err(e) => {
            tracing::warn!(connection = %conn.id(), error = %e, "rollback failed");
            Some(e)
        }
    }
}

fn finish<T, R, E>(
    pool: &Pool<T>,
    conn: PooledConnection<T>,
    outcome: TransactionOutcome<R, E>,
    rollback_error: Option<Error>,
) -> TransactionOutcome<R, E>
where
    T: Transport,
    E: Display,
{
    let connection = conn.id();
    let event = match &outcome {
        TransactionOutcome::Committed(_) => {
            tracing::debug!(connection = %connection, "transaction committed");
            PoolEvent::Committed { connection }
        }
        TransactionOutcome::RolledBack(reason) => {
            tracing::debug!(connection = %connection, reason = %reason, "transaction rolled back");
            PoolEvent::RolledBack {
                connection: Some(connection),
                reason: reason.to_string(),
                rollback_error,
            }
        }
        TransactionOutcome::TimedOut => {
            tracing::warn!(connection = %connection, "transaction timed out");
            PoolEvent::TimedOut {
                connection,
                rollback_error,
            }
        }
    };
    pool.emit(event);
    pool.release(conn);
    outcome
}

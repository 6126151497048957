use crate::connection::ConnectionId;
use crate::error::Error;

/// Lifecycle events published on [`Pool::subscribe`](crate::Pool::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Acquired {
        connection: ConnectionId,
    },
    /// `retired` is true when the connection was closed instead of going idle
    Released {
        connection: ConnectionId,
        retired: bool,
    },
    Committed {
        connection: ConnectionId,
    },
    RolledBack {
        connection: Option<ConnectionId>,
        reason: String,
        rollback_error: Option<Error>,
    },
    TimedOut {
        connection: ConnectionId,
        rollback_error: Option<Error>,
    },
}

impl PoolEvent {
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            PoolEvent::Acquired { connection }
            | PoolEvent::Released { connection, .. }
            | PoolEvent::Committed { connection }
            | PoolEvent::TimedOut { connection, .. } => Some(*connection),
            PoolEvent::RolledBack { connection, .. } => *connection,
        }
    }
}

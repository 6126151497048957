use std::fmt::{Display, Formatter};

/// Current state of the connection pool
#[derive(Debug, Eq, PartialEq)]
pub struct State {
    /// Maximum open connections allowed
    pub max_open: u64,
    /// Open connections = idle + in_use + closing
    pub connections: u64,
    /// Idle connections available
    pub idle: u64,
    /// Connections checked out by callers
    pub in_use: u64,
    /// Errored or timed out, not yet closed
    pub closing: u64,
    /// Currently establishing connections
    pub connecting: u64,
    /// Callers waiting in acquire
    pub waits: u64,
    /// Connection errors delivered since the last reset
    pub errors: u64,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ max_open: {}, connections: {}, idle: {}, in_use: {}, closing: {}, connecting: {}, waits: {}, errors: {} }}",
            self.max_open,
            self.connections,
            self.idle,
            self.in_use,
            self.closing,
            self.connecting,
            self.waits,
            self.errors
        )
    }
}

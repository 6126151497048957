//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Settings a [`Pool`](crate::Pool) is built from.
///
/// Field names serialize in camelCase (`maxConnections`, `acquireTimeoutMs`,
/// `defaultIdleInTransactionTimeoutMs`); missing fields fall back to
/// [`PoolConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Upper bound on open connections. Must be greater than zero.
    pub max_connections: u64,
    /// How long `acquire` may wait. Zero means a single attempt without waiting.
    pub acquire_timeout_ms: u64,
    /// Idle-in-transaction deadline applied when a caller gives none.
    /// Zero disables the deadline.
    pub default_idle_in_transaction_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: num_cpus::get() as u64,
            acquire_timeout_ms: 30_000,
            default_idle_in_transaction_timeout_ms: 0,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_connections(mut self, n: u64) -> Self {
        self.max_connections = n;
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn idle_in_transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_idle_in_transaction_timeout_ms =
            timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
        self
    }

    pub fn acquire_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// `None` when the deadline is disabled.
    pub fn idle_in_transaction_timeout_duration(&self) -> Option<Duration> {
        match self.default_idle_in_transaction_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Config("maxConnections must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, num_cpus::get() as u64);
        assert_eq!(config.acquire_timeout_duration(), Duration::from_secs(30));
        assert_eq!(config.idle_in_transaction_timeout_duration(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_millis(250))
            .idle_in_transaction_timeout(Some(Duration::from_secs(1)));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.acquire_timeout_ms, 250);
        assert_eq!(
            config.idle_in_transaction_timeout_duration(),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let config = PoolConfig::new().max_connections(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_deserialize_camel_case_with_defaults() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"maxConnections": 2, "defaultIdleInTransactionTimeoutMs": 1000}"#)
                .unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.acquire_timeout_ms, 30_000);
        assert_eq!(config.default_idle_in_transaction_timeout_ms, 1000);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["acquireTimeoutMs"], 30_000);
    }
}

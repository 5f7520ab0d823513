//! Pool configuration.

use std::time::Duration;

/// Configuration shared by the connection pool and the statement pool.
///
/// All knobs are fixed at construction; there is no live reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Maximum number of physical connections.
    pub max_connections: usize,

    /// Maximum number of live prepared statements across all queries.
    pub max_statements: usize,

    /// Whether cached statements verify their connection before reuse.
    pub check_connections: bool,

    /// Connections used more recently than this are not re-checked.
    pub check_interval: Duration,

    /// Autocommit mode applied to new connections.
    pub autocommit: bool,

    /// Schema selected on new connections, if the driver supports it.
    pub schema: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_statements: 50,
            check_connections: true,
            check_interval: Duration::from_secs(30),
            autocommit: true,
            schema: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the maximum number of cached statements.
    #[must_use]
    pub fn max_statements(mut self, count: usize) -> Self {
        self.max_statements = count;
        self
    }

    /// Enable or disable connection checks on statement reuse.
    #[must_use]
    pub fn check_connections(mut self, enabled: bool) -> Self {
        self.check_connections = enabled;
        self
    }

    /// Set the minimum idle time before a connection is re-checked.
    #[must_use]
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Set the autocommit mode of new connections.
    #[must_use]
    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = enabled;
        self
    }

    /// Set the schema selected on new connections.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// The check interval if connection checks are enabled.
    #[must_use]
    pub fn effective_check_interval(&self) -> Option<Duration> {
        self.check_connections.then_some(self.check_interval)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), crate::error::PoolError> {
        if self.max_connections == 0 {
            return Err(crate::error::PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.max_statements == 0 {
            return Err(crate::error::PoolError::Configuration(
                "max_statements must be greater than 0".into(),
            ));
        }
        if self.schema.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(crate::error::PoolError::Configuration(
                "schema must not be blank".into(),
            ));
        }
        Ok(())
    }
}

//! Pool error types.

use sqlpool_driver::DriverError;
use thiserror::Error;

/// Result type for pool operations.
pub type Result<T, E = PoolError> = std::result::Result<T, E>;

/// Errors returned by the connection and statement pools.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The driver failed to connect, prepare or execute. Propagated as-is.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Every statement slot is taken and none could be reused.
    #[error("statement pool exhausted: {max} statements in use or cached")]
    StatementCapacity {
        /// Configured statement ceiling.
        max: usize,
    },

    /// The driver descriptor names a last-insert-id method the data source
    /// cannot provide.
    #[error("driver misconfiguration: {0}")]
    Misconfigured(String),

    /// The requested feature is deliberately not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// The driver cannot perform the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The statement was invalidated and closed.
    #[error("statement has been invalidated")]
    Invalidated,

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,
}

impl PoolError {
    /// Whether retrying the request may succeed.
    ///
    /// Connection failures and capacity exhaustion are transient; the pool
    /// itself never retries.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Driver(e) => e.is_connection_error(),
            Self::StatementCapacity { .. } => true,
            _ => false,
        }
    }
}

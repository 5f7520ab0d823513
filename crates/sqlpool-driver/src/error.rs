//! Driver-level error types.

use thiserror::Error;

/// Errors reported by a driver implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// Acquiring or using a physical connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Preparing, binding or executing a statement failed.
    #[error("statement error: {0}")]
    Statement(String),

    /// The connection, statement or cursor has already been closed.
    #[error("resource closed")]
    Closed,

    /// The driver does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A result column could not be located.
    #[error("column not found: {0}")]
    Column(String),

    /// A value could not be converted to the requested type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    Type {
        /// Expected type.
        expected: &'static str,
        /// Actual value description.
        actual: String,
    },
}

impl DriverError {
    /// Whether the error indicates a broken or unreachable connection.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Closed)
    }
}

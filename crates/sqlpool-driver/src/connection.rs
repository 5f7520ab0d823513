//! Connection, statement and cursor capabilities.
//!
//! All traits are object safe; the pools hold `Box<dyn RawConnection>` and
//! friends so a single pool type works with any driver.

use std::any::Any;
use std::sync::Arc;

use crate::credentials::Credentials;
use crate::error::DriverError;
use crate::value::{Row, SqlValue};

/// Factory for raw database connections.
pub trait DataSource: Send + Sync {
    /// Open a connection using the data source's own authentication.
    fn connect(&self) -> Result<Box<dyn RawConnection>, DriverError>;

    /// Open a connection with explicit credentials.
    fn connect_with(&self, credentials: &Credentials)
    -> Result<Box<dyn RawConnection>, DriverError>;

    /// Resolve a driver-specific last-insert-id method by name.
    ///
    /// Only consulted for [`LastInsertPolicy::Method`](crate::LastInsertPolicy::Method).
    fn last_insert_method(&self, _name: &str) -> Option<Arc<dyn LastInsertIdMethod>> {
        None
    }
}

/// How a statement is going to be used, chosen at preparation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareKind {
    /// A query, prepared with a forward-only, read-only cursor.
    Query,
    /// An update, optionally asking the driver to return generated keys.
    Update {
        /// Whether generated keys must be retrievable after execution.
        generated_keys: bool,
    },
}

impl PrepareKind {
    /// Whether this is an update statement.
    #[must_use]
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update { .. })
    }
}

/// A physical database connection.
pub trait RawConnection: Send {
    /// Prepare a statement.
    fn prepare(&mut self, sql: &str, kind: PrepareKind)
    -> Result<Box<dyn RawStatement>, DriverError>;

    /// Execute a statement directly, returning the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Enable or disable autocommit.
    fn set_autocommit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Whether the driver reports the connection as closed.
    ///
    /// Some drivers stop reporting this reliably after an interrupt, so the
    /// pool keeps its own closed flag as well.
    fn is_closed(&self) -> bool;

    /// Close the connection.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// A prepared statement owned by a [`RawConnection`].
pub trait RawStatement: Send {
    /// Bind a parameter at a 1-based position.
    fn bind(&mut self, index: usize, value: &SqlValue) -> Result<(), DriverError>;

    /// Execute as a query.
    fn execute_query(&mut self) -> Result<Box<dyn ResultCursor>, DriverError>;

    /// Execute as an update, returning the affected row count.
    fn execute_update(&mut self) -> Result<u64, DriverError>;

    /// Keys generated by the last update, if the statement was prepared with
    /// generated keys enabled.
    fn generated_keys(&mut self) -> Result<Box<dyn ResultCursor>, DriverError>;

    /// Close the statement.
    fn close(&mut self) -> Result<(), DriverError>;

    /// Access to the concrete statement type, for [`LastInsertIdMethod`]
    /// implementations that need driver internals.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Forward-only cursor over a result set.
pub trait ResultCursor: Send {
    /// Column names of the result.
    fn columns(&self) -> &[String];

    /// Advance to the next row.
    fn next_row(&mut self) -> Result<Option<Row>, DriverError>;

    /// Close the cursor, releasing driver resources.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Driver-specific accessor for the id generated by the last insert.
///
/// This replaces a by-name method lookup on the statement's concrete type:
/// the driver adapter registers a typed implementation under a name and the
/// pool resolves it once.
pub trait LastInsertIdMethod: Send + Sync {
    /// Name the method is registered under.
    fn name(&self) -> &str;

    /// Read the last generated id from `statement`.
    fn last_insert_id(&self, statement: &mut dyn RawStatement) -> Result<SqlValue, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_kind_is_update() {
        assert!(!PrepareKind::Query.is_update());
        assert!(
            PrepareKind::Update {
                generated_keys: false
            }
            .is_update()
        );
    }
}

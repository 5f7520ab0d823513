//! Pooled prepared statements.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sqlpool_driver::{DriverError, PrepareKind, RawStatement, ResultCursor, Row, SqlValue};

use crate::connection::ManagedConnection;
use crate::error::{PoolError, Result};
use crate::lifecycle::{Pooled, PooledState};

/// A prepared statement cached by a [`StatementPool`](crate::StatementPool).
///
/// The statement shares its [`ManagedConnection`] with every other statement
/// prepared on it and never outlives it in a usable state: when the
/// connection dies the pool invalidates and closes all of them.
///
/// Queries are not released automatically because the caller still iterates
/// the result; call [`notify_over`](Pooled::notify_over) when done. Updates
/// release the statement as soon as they complete.
pub struct PooledStatement {
    id: u64,
    sql: String,
    kind: PrepareKind,
    state: PooledState,
    open: AtomicBool,
    statement: Mutex<Option<Box<dyn RawStatement>>>,
    cursor: Mutex<Option<Box<dyn ResultCursor>>>,
    connection: Arc<ManagedConnection>,
}

impl std::fmt::Debug for PooledStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledStatement")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .field("state", &self.state.state())
            .field("connection_id", &self.connection.id())
            .finish()
    }
}

impl PooledStatement {
    pub(crate) fn new(
        id: u64,
        sql: &str,
        kind: PrepareKind,
        statement: Box<dyn RawStatement>,
        connection: Arc<ManagedConnection>,
    ) -> Self {
        Self {
            id,
            sql: sql.to_string(),
            kind,
            state: PooledState::new(),
            open: AtomicBool::new(true),
            statement: Mutex::new(Some(statement)),
            cursor: Mutex::new(None),
            connection,
        }
    }

    /// Unique id within the statement pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The SQL text this statement was prepared from.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether this is an update statement.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.kind.is_update()
    }

    /// The connection the statement was prepared on.
    #[must_use]
    pub fn connection(&self) -> &Arc<ManagedConnection> {
        &self.connection
    }

    /// Whether the statement runs on `connection`.
    pub(crate) fn belongs_to(&self, connection: &Arc<ManagedConnection>) -> bool {
        Arc::ptr_eq(&self.connection, connection)
    }

    /// Bind `params` at positions 1.. and run `op` inside the connection's
    /// busy state.
    fn run<T>(
        &self,
        params: &[SqlValue],
        op: impl FnOnce(&mut dyn RawStatement) -> std::result::Result<T, DriverError>,
    ) -> Result<T> {
        let _busy = self.connection.busy();
        let mut statement = self.statement.lock();
        let statement = statement.as_mut().ok_or(PoolError::Invalidated)?;
        for (index, value) in params.iter().enumerate() {
            statement.bind(index + 1, value)?;
        }
        Ok(op(&mut **statement)?)
    }

    /// Execute as a query.
    ///
    /// The result set stays open until it is closed, the statement is
    /// executed again, or [`notify_over`](Pooled::notify_over) is called.
    pub fn execute_query(&self, params: &[SqlValue]) -> Result<Rows<'_>> {
        tracing::debug!(
            statement_id = self.id,
            sql = %self.sql,
            params_count = params.len(),
            "executing query"
        );
        let cursor = self.run(params, |statement| statement.execute_query())?;
        if let Some(mut previous) = self.cursor.lock().replace(cursor) {
            self.close_cursor(previous.as_mut());
        }
        Ok(Rows { statement: self })
    }

    /// Execute as an update and release the statement.
    ///
    /// Returns the number of affected rows.
    pub fn execute_update(&self, params: &[SqlValue]) -> Result<u64> {
        tracing::debug!(
            statement_id = self.id,
            sql = %self.sql,
            params_count = params.len(),
            "executing update"
        );
        let outcome = self.run(params, |statement| statement.execute_update());
        self.notify_over();
        outcome
    }

    /// The id generated by the last insert run through this statement.
    ///
    /// A NULL id is reported as [`NULL_INSERT_ID`](crate::NULL_INSERT_ID).
    pub fn last_insert_id(&self, key_column: &str) -> Result<i64> {
        let mut statement = self.statement.lock();
        let statement = statement.as_mut().ok_or(PoolError::Invalidated)?;
        self.connection.last_insert_id(statement.as_mut(), key_column)
    }

    fn close_cursor(&self, cursor: &mut dyn ResultCursor) {
        if let Err(error) = cursor.close() {
            tracing::debug!(statement_id = self.id, error = %error, "failed to close result set");
        }
    }
}

impl Pooled for PooledStatement {
    fn pooled_state(&self) -> &PooledState {
        &self.state
    }

    /// Valid only while the statement handle is still open.
    fn is_valid(&self) -> bool {
        self.state.is_valid() && self.open.load(Ordering::Acquire)
    }

    /// Close any open result set and make the statement reusable.
    fn notify_over(&self) {
        if let Some(mut cursor) = self.cursor.lock().take() {
            self.close_cursor(cursor.as_mut());
        }
        self.state.set_in_use(false);
        tracing::trace!(statement_id = self.id, "statement released");
    }

    fn close(&self) -> std::result::Result<(), DriverError> {
        self.state.invalidate();
        self.open.store(false, Ordering::Release);
        if let Some(mut cursor) = self.cursor.lock().take() {
            self.close_cursor(cursor.as_mut());
        }
        match self.statement.lock().take() {
            Some(mut statement) => statement.close(),
            None => Ok(()),
        }
    }
}

/// The open result set of a query.
///
/// Borrowed from its [`PooledStatement`]; iterate with
/// [`next_row`](Self::next_row) or as an [`Iterator`].
pub struct Rows<'a> {
    statement: &'a PooledStatement,
}

impl Rows<'_> {
    /// Column names of the result.
    pub fn columns(&self) -> Result<Vec<String>> {
        let cursor = self.statement.cursor.lock();
        let cursor = cursor.as_ref().ok_or(DriverError::Closed)?;
        Ok(cursor.columns().to_vec())
    }

    /// Fetch the next row, or `None` at the end of the result.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let _busy = self.statement.connection.busy();
        let mut cursor = self.statement.cursor.lock();
        let cursor = cursor.as_mut().ok_or(DriverError::Closed)?;
        Ok(cursor.next_row()?)
    }

    /// Close the result set without releasing the statement.
    pub fn close(self) {
        if let Some(mut cursor) = self.statement.cursor.lock().take() {
            self.statement.close_cursor(cursor.as_mut());
        }
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

//! Managed database connections.
//!
//! A [`ManagedConnection`] exclusively owns one raw driver connection and
//! tracks how many operations are currently running on it. Every driver call
//! made through the wrapper is bracketed by a [`BusyGuard`], so the busy
//! depth is released on every exit path, errors included.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sqlpool_driver::{
    DataSource, DriverError, DriverInfo, LastInsertIdMethod, LastInsertPolicy, PrepareKind,
    RawConnection, RawStatement, ResultCursor, SqlValue,
};

use crate::error::{PoolError, Result};

/// Value reported for a generated id that came back as SQL NULL.
pub const NULL_INSERT_ID: i64 = -1;

#[derive(Debug)]
struct BusyState {
    depth: u32,
    last_use: Instant,
}

/// Resolves the driver's last-insert-id method once and shares it between
/// all connections of a pool.
pub(crate) struct LastInsertResolver {
    source: Arc<dyn DataSource>,
    method: OnceLock<Arc<dyn LastInsertIdMethod>>,
}

impl LastInsertResolver {
    pub(crate) fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            method: OnceLock::new(),
        }
    }

    fn method(&self, name: &str) -> Result<Arc<dyn LastInsertIdMethod>> {
        if let Some(method) = self.method.get() {
            return Ok(Arc::clone(method));
        }
        let resolved = self.source.last_insert_method(name).ok_or_else(|| {
            PoolError::Misconfigured(format!("last insert id method '{name}' is not available"))
        })?;
        tracing::debug!(method = name, "resolved last insert id method");
        Ok(Arc::clone(self.method.get_or_init(|| resolved)))
    }
}

/// A pooled wrapper around one raw database connection.
pub struct ManagedConnection {
    id: u64,
    raw: Mutex<Option<Box<dyn RawConnection>>>,
    busy: Mutex<BusyState>,
    closed: AtomicBool,
    created_at: Instant,
    info: Arc<DriverInfo>,
    resolver: Arc<LastInsertResolver>,
    ping_statement: Mutex<Option<Box<dyn RawStatement>>>,
    last_id_statement: Mutex<Option<Box<dyn RawStatement>>>,
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("vendor", &self.info.vendor)
            .field("busy_depth", &self.busy_depth())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ManagedConnection {
    pub(crate) fn new(
        id: u64,
        raw: Box<dyn RawConnection>,
        info: Arc<DriverInfo>,
        resolver: Arc<LastInsertResolver>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            raw: Mutex::new(Some(raw)),
            busy: Mutex::new(BusyState {
                depth: 0,
                last_use: now,
            }),
            closed: AtomicBool::new(false),
            created_at: now,
            info,
            resolver,
            ping_statement: Mutex::new(None),
            last_id_statement: Mutex::new(None),
        }
    }

    /// Unique id of this connection within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Driver descriptor.
    #[must_use]
    pub fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    /// When the connection was opened.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Enter busy state. Calls nest; each must be paired with
    /// [`leave_busy_state`](Self::leave_busy_state). Prefer [`busy`](Self::busy).
    pub fn enter_busy_state(&self) {
        let mut busy = self.busy.lock();
        busy.depth += 1;
        tracing::trace!(connection_id = self.id, depth = busy.depth, "enter busy state");
    }

    /// Leave busy state and refresh the last-use time.
    pub fn leave_busy_state(&self) {
        let mut busy = self.busy.lock();
        if busy.depth == 0 {
            tracing::warn!(connection_id = self.id, "unbalanced leave_busy_state");
        }
        busy.depth = busy.depth.saturating_sub(1);
        busy.last_use = Instant::now();
        tracing::trace!(connection_id = self.id, depth = busy.depth, "leave busy state");
    }

    /// Enter busy state for the lifetime of the returned guard.
    #[must_use = "busy state is left as soon as the guard is dropped"]
    pub fn busy(&self) -> BusyGuard<'_> {
        self.enter_busy_state();
        BusyGuard { connection: self }
    }

    /// Whether an operation is running on the connection.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.lock().depth > 0
    }

    /// Current nesting depth of busy state.
    #[must_use]
    pub fn busy_depth(&self) -> u32 {
        self.busy.lock().depth
    }

    /// When the connection last left busy state.
    #[must_use]
    pub fn last_use(&self) -> Instant {
        self.busy.lock().last_use
    }

    /// Whether the connection is closed: explicitly, according to the
    /// driver, or because the raw handle is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        self.raw.lock().as_ref().is_none_or(|raw| raw.is_closed())
    }

    /// Close the connection and the statements it prepared for itself.
    ///
    /// The closed flag is set before the driver is asked, since some drivers
    /// stop reporting their closed state reliably after an interrupt.
    pub fn close(&self) -> std::result::Result<(), DriverError> {
        self.closed.store(true, Ordering::Release);
        for slot in [&self.ping_statement, &self.last_id_statement] {
            if let Some(mut statement) = slot.lock().take() {
                if let Err(error) = statement.close() {
                    tracing::debug!(connection_id = self.id, error = %error, "failed to close internal statement");
                }
            }
        }
        match self.raw.lock().take() {
            Some(mut raw) => {
                tracing::debug!(connection_id = self.id, "closing connection");
                raw.close()
            }
            None => Ok(()),
        }
    }

    /// Probe the connection.
    ///
    /// With a ping query the probe statement is prepared once and re-executed
    /// on later calls; without one this falls back to [`is_closed`](Self::is_closed).
    /// Failures are logged and reported as `false`, never raised.
    pub fn check(&self) -> bool {
        let Some(query) = self.info.ping_query.as_deref() else {
            return !self.is_closed();
        };
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.ping(query) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(connection_id = self.id, error = %error, "connection check failed");
                false
            }
        }
    }

    fn ping(&self, query: &str) -> std::result::Result<(), DriverError> {
        let _busy = self.busy();
        let mut probe = self.ping_statement.lock();
        if probe.is_none() {
            *probe = Some(self.with_raw(|raw| raw.prepare(query, PrepareKind::Query))?);
        }
        let Some(statement) = probe.as_mut() else {
            return Err(DriverError::Closed);
        };
        let mut cursor = statement.execute_query()?;
        cursor.close()
    }

    /// Run `op` on the raw connection inside busy state.
    fn with_raw<T>(
        &self,
        op: impl FnOnce(&mut dyn RawConnection) -> std::result::Result<T, DriverError>,
    ) -> std::result::Result<T, DriverError> {
        let _busy = self.busy();
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        let mut raw = self.raw.lock();
        let raw = raw.as_mut().ok_or(DriverError::Closed)?;
        op(&mut **raw)
    }

    /// Prepare a statement on this connection.
    pub(crate) fn prepare(
        &self,
        sql: &str,
        kind: PrepareKind,
    ) -> std::result::Result<Box<dyn RawStatement>, DriverError> {
        self.with_raw(|raw| raw.prepare(sql, kind))
    }

    /// Execute a statement directly, returning the affected row count.
    pub fn execute(&self, sql: &str) -> Result<u64> {
        tracing::debug!(connection_id = self.id, sql = sql, "executing statement");
        Ok(self.with_raw(|raw| raw.execute(sql))?)
    }

    /// Enable or disable autocommit.
    pub fn set_autocommit(&self, enabled: bool) -> Result<()> {
        Ok(self.with_raw(|raw| raw.set_autocommit(enabled))?)
    }

    /// Commit the current transaction.
    pub fn commit(&self) -> Result<()> {
        tracing::debug!(connection_id = self.id, "committing transaction");
        Ok(self.with_raw(|raw| raw.commit())?)
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        tracing::debug!(connection_id = self.id, "rolling back transaction");
        Ok(self.with_raw(|raw| raw.rollback())?)
    }

    /// Read the id generated by the last insert executed on `statement`.
    ///
    /// The retrieval strategy follows the driver's [`LastInsertPolicy`]. A
    /// NULL id is reported as [`NULL_INSERT_ID`].
    pub(crate) fn last_insert_id(
        &self,
        statement: &mut dyn RawStatement,
        key_column: &str,
    ) -> Result<i64> {
        let value = match &self.info.last_insert {
            LastInsertPolicy::GeneratedKeys => {
                let _busy = self.busy();
                let mut keys = statement.generated_keys()?;
                let value = read_key(keys.as_mut(), Some(key_column));
                close_cursor(self.id, keys.as_mut());
                value?
            }
            LastInsertPolicy::Query(query) => {
                let _busy = self.busy();
                let mut cached = self.last_id_statement.lock();
                if cached.is_none() {
                    *cached = Some(self.prepare(query, PrepareKind::Query)?);
                }
                let Some(id_statement) = cached.as_mut() else {
                    return Err(DriverError::Closed.into());
                };
                let mut cursor = id_statement.execute_query()?;
                let value = read_key(cursor.as_mut(), None);
                close_cursor(self.id, cursor.as_mut());
                value?
            }
            LastInsertPolicy::Method(name) => {
                let method = self.resolver.method(name)?;
                let _busy = self.busy();
                method.last_insert_id(statement)?
            }
            LastInsertPolicy::Returning => {
                return Err(PoolError::NotImplemented(
                    "last insert id through a RETURNING clause",
                ));
            }
            LastInsertPolicy::None => {
                return Err(PoolError::Unsupported(format!(
                    "driver '{}' cannot report generated ids",
                    self.info.vendor
                )));
            }
        };
        Ok(value.to_i64()?.unwrap_or(NULL_INSERT_ID))
    }
}

/// Read the key value from the first row of `cursor`.
///
/// A single-column result is read positionally; otherwise the value is
/// looked up by `key_column`.
fn read_key(
    cursor: &mut dyn ResultCursor,
    key_column: Option<&str>,
) -> std::result::Result<SqlValue, DriverError> {
    let single_column = cursor.columns().len() == 1;
    let row = cursor
        .next_row()?
        .ok_or_else(|| DriverError::Statement("no generated key returned".into()))?;
    match key_column {
        Some(column) if !single_column => row.get_by_name(column).cloned(),
        _ => row
            .get(0)
            .cloned()
            .ok_or_else(|| DriverError::Column("1".into())),
    }
}

fn close_cursor(connection_id: u64, cursor: &mut dyn ResultCursor) {
    if let Err(error) = cursor.close() {
        tracing::debug!(connection_id, error = %error, "failed to close key cursor");
    }
}

/// Scoped busy state of a [`ManagedConnection`].
///
/// Created by [`ManagedConnection::busy`]; leaves busy state on drop.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    connection: &'a ManagedConnection,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.connection.leave_busy_state();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sqlpool_testing::MockDataSource;

    fn connection(source: &MockDataSource, info: DriverInfo) -> ManagedConnection {
        let raw = source.connect().unwrap();
        let source: Arc<dyn DataSource> = Arc::new(source.clone());
        ManagedConnection::new(1, raw, Arc::new(info), Arc::new(LastInsertResolver::new(source)))
    }

    #[test]
    fn test_busy_depth_nesting() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        assert!(!conn.is_busy());

        conn.enter_busy_state();
        conn.enter_busy_state();
        assert_eq!(conn.busy_depth(), 2);

        conn.leave_busy_state();
        assert!(conn.is_busy());

        conn.leave_busy_state();
        assert!(!conn.is_busy());
    }

    #[test]
    fn test_busy_guard_releases_on_error_path() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        source.connection(1).unwrap().break_link();

        assert!(conn.execute("delete from t").is_err());
        assert!(!conn.is_busy());
    }

    #[test]
    fn test_leave_busy_state_refreshes_last_use() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        let before = conn.last_use();
        std::thread::sleep(std::time::Duration::from_millis(2));
        drop(conn.busy());
        assert!(conn.last_use() > before);
    }

    #[test]
    fn test_unbalanced_leave_saturates() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        conn.leave_busy_state();
        assert_eq!(conn.busy_depth(), 0);
    }

    #[test]
    fn test_is_closed_sources() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        assert!(!conn.is_closed());

        source.connection(1).unwrap().kill();
        assert!(conn.is_closed());

        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(matches!(conn.commit(), Err(PoolError::Driver(DriverError::Closed))));
    }

    #[test]
    fn test_check_without_ping_query_uses_closed_state() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        source.connection(1).unwrap().break_link();
        assert!(conn.check());

        source.connection(1).unwrap().kill();
        assert!(!conn.check());
    }

    #[test]
    fn test_check_reuses_ping_statement() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::new("test").ping_query("select 1"));

        assert!(conn.check());
        assert!(conn.check());
        assert!(conn.check());
        assert_eq!(source.prepare_count("select 1"), 1);
        assert_eq!(source.executed().len(), 3);
        assert!(!conn.is_busy());
    }

    #[test]
    fn test_check_failure_is_not_raised() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::new("test").ping_query("select 1"));
        assert!(conn.check());

        source.connection(1).unwrap().break_link();
        assert!(!conn.check());
        assert!(!conn.is_busy());
    }

    #[test]
    fn test_transactions() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::default());
        conn.set_autocommit(false).unwrap();
        conn.commit().unwrap();
        conn.rollback().unwrap();

        let handle = source.connection(1).unwrap();
        assert!(!handle.autocommit());
        assert_eq!(handle.commits(), 1);
        assert_eq!(handle.rollbacks(), 1);
    }

    #[test]
    fn test_returning_policy_is_not_implemented() {
        let source = MockDataSource::new();
        let info = DriverInfo::new("test").last_insert(LastInsertPolicy::Returning);
        let conn = connection(&source, info);
        let mut stmt = conn.prepare("insert into t values (1)", PrepareKind::Query).unwrap();
        assert!(matches!(
            conn.last_insert_id(stmt.as_mut(), "id"),
            Err(PoolError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_missing_method_is_misconfiguration() {
        let source = MockDataSource::new();
        let info = DriverInfo::new("test").last_insert(LastInsertPolicy::Method("lastId".into()));
        let conn = connection(&source, info);
        let mut stmt = conn.prepare("insert into t values (1)", PrepareKind::Query).unwrap();
        assert!(matches!(
            conn.last_insert_id(stmt.as_mut(), "id"),
            Err(PoolError::Misconfigured(_))
        ));
        assert!(!conn.is_busy());
    }

    #[test]
    fn test_no_policy_is_unsupported() {
        let source = MockDataSource::new();
        let conn = connection(&source, DriverInfo::new("plain"));
        let mut stmt = conn.prepare("insert into t values (1)", PrepareKind::Query).unwrap();
        assert!(matches!(
            conn.last_insert_id(stmt.as_mut(), "id"),
            Err(PoolError::Unsupported(_))
        ));
    }
}

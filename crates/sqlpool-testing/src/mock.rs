//! Scripted in-memory driver.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sqlpool_driver::{
    Credentials, DataSource, DriverError, LastInsertIdMethod, PrepareKind, RawConnection,
    RawStatement, ResultCursor, Row, SqlValue,
};

/// Column name used for generated keys and last-id queries.
pub const GENERATED_KEY_COLUMN: &str = "GENERATED_KEY";

/// A statement execution recorded by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// Id of the connection that ran the statement.
    pub connection_id: u64,
    /// SQL text.
    pub sql: String,
    /// Bound parameters, in position order.
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone)]
struct ScriptedResult {
    columns: Arc<[String]>,
    rows: Vec<Vec<SqlValue>>,
}

/// Per-connection state shared between the connection, its statements and
/// the test's [`MockConnectionHandle`].
#[derive(Debug)]
struct ConnectionFlags {
    id: u64,
    closed: AtomicBool,
    broken: AtomicBool,
    fail_close: AtomicBool,
    autocommit: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    /// Last id generated on this connection; zero means none yet.
    last_id: AtomicI64,
}

impl ConnectionFlags {
    fn ensure_usable(&self) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(DriverError::Connection(format!(
                "connection {} reset by peer",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    results: Mutex<HashMap<String, ScriptedResult>>,
    update_counts: Mutex<HashMap<String, u64>>,
    last_id_query: Mutex<Option<String>>,
    methods: Mutex<HashMap<String, Arc<dyn LastInsertIdMethod>>>,
    connections: Mutex<Vec<Arc<ConnectionFlags>>>,
    executed: Mutex<Vec<ExecutedStatement>>,
    prepared: Mutex<HashMap<String, usize>>,
    credentials_seen: Mutex<Vec<Option<String>>>,
    fail_connect: AtomicBool,
    next_connection_id: AtomicU64,
    next_insert_id: AtomicI64,
    open_cursors: AtomicUsize,
    statements_closed: AtomicUsize,
}

/// In-memory [`DataSource`] with scripted results and fault injection.
///
/// Cloning yields another handle to the same state, so a test can keep one
/// clone for inspection after handing the other to a pool.
#[derive(Clone, Default)]
pub struct MockDataSource {
    state: Arc<MockState>,
}

impl MockDataSource {
    /// Create an empty data source. Unscripted queries return no rows.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result of a query.
    #[must_use]
    pub fn with_query_result(
        self,
        sql: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue>>,
    ) -> Self {
        let columns: Arc<[String]> = columns.iter().map(|c| (*c).to_string()).collect();
        self.state
            .results
            .lock()
            .insert(sql.to_string(), ScriptedResult { columns, rows });
        self
    }

    /// Script the affected row count of an update (default 1).
    #[must_use]
    pub fn with_update_count(self, sql: &str, count: u64) -> Self {
        self.state.update_counts.lock().insert(sql.to_string(), count);
        self
    }

    /// Make `sql` return the connection's last generated id, or NULL when
    /// nothing was inserted yet.
    #[must_use]
    pub fn with_last_id_query(self, sql: &str) -> Self {
        *self.state.last_id_query.lock() = Some(sql.to_string());
        self
    }

    /// Register a last-insert-id method that reads the statement's own id.
    #[must_use]
    pub fn with_last_id_method(self, name: &str) -> Self {
        let method: Arc<dyn LastInsertIdMethod> = Arc::new(MockLastIdMethod {
            name: name.to_string(),
        });
        self.state.methods.lock().insert(name.to_string(), method);
        self
    }

    /// Make subsequent connection attempts fail.
    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::Release);
    }

    /// Handle to the physical connection with the given id (1-based, in
    /// creation order).
    #[must_use]
    pub fn connection(&self, id: u64) -> Option<MockConnectionHandle> {
        self.state
            .connections
            .lock()
            .iter()
            .find(|c| c.id == id)
            .map(|flags| MockConnectionHandle {
                flags: Arc::clone(flags),
            })
    }

    /// Number of physical connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.state.connections.lock().len()
    }

    /// Every statement executed so far.
    #[must_use]
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.executed.lock().clone()
    }

    /// How many times `sql` was prepared across all connections.
    #[must_use]
    pub fn prepare_count(&self, sql: &str) -> usize {
        self.state.prepared.lock().get(sql).copied().unwrap_or(0)
    }

    /// Usernames passed to the data source, `None` for credential-less opens.
    #[must_use]
    pub fn credentials_seen(&self) -> Vec<Option<String>> {
        self.state.credentials_seen.lock().clone()
    }

    /// Number of result cursors currently open.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.state.open_cursors.load(Ordering::Acquire)
    }

    /// Number of statements closed so far.
    #[must_use]
    pub fn statements_closed(&self) -> usize {
        self.state.statements_closed.load(Ordering::Acquire)
    }

    fn open(&self, username: Option<String>) -> Result<Box<dyn RawConnection>, DriverError> {
        self.state.credentials_seen.lock().push(username);
        if self.state.fail_connect.load(Ordering::Acquire) {
            return Err(DriverError::Connection("connection refused".into()));
        }
        let id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let flags = Arc::new(ConnectionFlags {
            id,
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            autocommit: AtomicBool::new(true),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            last_id: AtomicI64::new(0),
        });
        self.state.connections.lock().push(Arc::clone(&flags));
        tracing::trace!(connection_id = id, "mock connection opened");
        Ok(Box::new(MockConnection {
            flags,
            state: Arc::clone(&self.state),
        }))
    }
}

impl DataSource for MockDataSource {
    fn connect(&self) -> Result<Box<dyn RawConnection>, DriverError> {
        self.open(None)
    }

    fn connect_with(
        &self,
        credentials: &Credentials,
    ) -> Result<Box<dyn RawConnection>, DriverError> {
        self.open(credentials.username.clone())
    }

    fn last_insert_method(&self, name: &str) -> Option<Arc<dyn LastInsertIdMethod>> {
        self.state.methods.lock().get(name).cloned()
    }
}

/// Test-side handle to one physical mock connection.
#[derive(Debug, Clone)]
pub struct MockConnectionHandle {
    flags: Arc<ConnectionFlags>,
}

impl MockConnectionHandle {
    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.flags.id
    }

    /// Close the connection behind the pool's back.
    pub fn kill(&self) {
        self.flags.closed.store(true, Ordering::Release);
    }

    /// Keep reporting the connection as open but fail every statement on it.
    pub fn break_link(&self) {
        self.flags.broken.store(true, Ordering::Release);
    }

    /// Make `close()` on this connection fail.
    pub fn fail_close(&self) {
        self.flags.fail_close.store(true, Ordering::Release);
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    /// Current autocommit setting.
    #[must_use]
    pub fn autocommit(&self) -> bool {
        self.flags.autocommit.load(Ordering::Acquire)
    }

    /// Number of commits issued.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.flags.commits.load(Ordering::Acquire)
    }

    /// Number of rollbacks issued.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.flags.rollbacks.load(Ordering::Acquire)
    }
}

struct MockConnection {
    flags: Arc<ConnectionFlags>,
    state: Arc<MockState>,
}

impl RawConnection for MockConnection {
    fn prepare(
        &mut self,
        sql: &str,
        kind: PrepareKind,
    ) -> Result<Box<dyn RawStatement>, DriverError> {
        self.flags.ensure_usable()?;
        *self.state.prepared.lock().entry(sql.to_string()).or_insert(0) += 1;
        Ok(Box::new(MockStatement {
            sql: sql.to_string(),
            kind,
            params: Vec::new(),
            closed: false,
            last_id: None,
            flags: Arc::clone(&self.flags),
            state: Arc::clone(&self.state),
        }))
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.flags.ensure_usable()?;
        self.state.executed.lock().push(ExecutedStatement {
            connection_id: self.flags.id,
            sql: sql.to_string(),
            params: Vec::new(),
        });
        Ok(0)
    }

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.flags.ensure_usable()?;
        self.flags.autocommit.store(enabled, Ordering::Release);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.flags.ensure_usable()?;
        self.flags.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.flags.ensure_usable()?;
        self.flags.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.flags.fail_close.load(Ordering::Acquire) {
            return Err(DriverError::Connection("close failed".into()));
        }
        self.flags.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Mock prepared statement. Public so [`LastInsertIdMethod`] implementations
/// in tests can downcast to it.
pub struct MockStatement {
    sql: String,
    kind: PrepareKind,
    params: Vec<SqlValue>,
    closed: bool,
    last_id: Option<i64>,
    flags: Arc<ConnectionFlags>,
    state: Arc<MockState>,
}

impl MockStatement {
    /// Id generated by this statement's last execution, if it inserted a row.
    #[must_use]
    pub fn last_id(&self) -> Option<i64> {
        self.last_id
    }

    fn ensure_usable(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.flags.ensure_usable()
    }

    fn record(&mut self) {
        let params = std::mem::take(&mut self.params);
        self.state.executed.lock().push(ExecutedStatement {
            connection_id: self.flags.id,
            sql: self.sql.clone(),
            params,
        });
    }

    fn cursor(&self, columns: Arc<[String]>, rows: Vec<Vec<SqlValue>>) -> Box<dyn ResultCursor> {
        self.state.open_cursors.fetch_add(1, Ordering::AcqRel);
        Box::new(MockCursor {
            rows: rows.into_iter().map(|r| Row::new(Arc::clone(&columns), r)).collect(),
            columns,
            closed: false,
            state: Arc::clone(&self.state),
        })
    }

    fn key_cursor(&self, id: Option<i64>) -> Box<dyn ResultCursor> {
        let columns: Arc<[String]> = vec![GENERATED_KEY_COLUMN.to_string()].into();
        let value = id.map_or(SqlValue::Null, SqlValue::Int);
        self.cursor(columns, vec![vec![value]])
    }
}

impl RawStatement for MockStatement {
    fn bind(&mut self, index: usize, value: &SqlValue) -> Result<(), DriverError> {
        self.ensure_usable()?;
        if index == 0 {
            return Err(DriverError::Statement("parameter index is 1-based".into()));
        }
        if self.params.len() < index {
            self.params.resize(index, SqlValue::Null);
        }
        self.params[index - 1] = value.clone();
        Ok(())
    }

    fn execute_query(&mut self) -> Result<Box<dyn ResultCursor>, DriverError> {
        self.ensure_usable()?;
        self.record();

        let last_id_query = self.state.last_id_query.lock().clone();
        if last_id_query.as_deref() == Some(self.sql.as_str()) {
            let last = self.flags.last_id.load(Ordering::Acquire);
            return Ok(self.key_cursor((last != 0).then_some(last)));
        }

        let scripted = self.state.results.lock().get(&self.sql).cloned();
        Ok(match scripted {
            Some(result) => self.cursor(result.columns, result.rows),
            None => self.cursor(Vec::<String>::new().into(), Vec::new()),
        })
    }

    fn execute_update(&mut self) -> Result<u64, DriverError> {
        self.ensure_usable()?;
        self.record();

        if self.sql.trim_start().to_ascii_lowercase().starts_with("insert") {
            let id = self.state.next_insert_id.fetch_add(1, Ordering::AcqRel) + 1;
            self.flags.last_id.store(id, Ordering::Release);
            self.last_id = Some(id);
        } else {
            self.last_id = None;
        }

        let count = self.state.update_counts.lock().get(&self.sql).copied();
        Ok(count.unwrap_or(1))
    }

    fn generated_keys(&mut self) -> Result<Box<dyn ResultCursor>, DriverError> {
        self.ensure_usable()?;
        match self.kind {
            PrepareKind::Update {
                generated_keys: true,
            } => Ok(self.key_cursor(self.last_id)),
            _ => Err(DriverError::Statement(
                "statement was not prepared to return generated keys".into(),
            )),
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.statements_closed.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct MockCursor {
    columns: Arc<[String]>,
    rows: VecDeque<Row>,
    closed: bool,
    state: Arc<MockState>,
}

impl ResultCursor for MockCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Row>, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            self.state.open_cursors.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
}

impl Drop for MockCursor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MockLastIdMethod {
    name: String,
}

impl LastInsertIdMethod for MockLastIdMethod {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_insert_id(&self, statement: &mut dyn RawStatement) -> Result<SqlValue, DriverError> {
        let statement = statement
            .as_any_mut()
            .downcast_mut::<MockStatement>()
            .ok_or_else(|| DriverError::Unsupported(format!("{} on foreign statement", self.name)))?;
        Ok(statement.last_id().map_or(SqlValue::Null, SqlValue::Int))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_query_result() {
        let source = MockDataSource::new().with_query_result(
            "select a from t",
            &["a"],
            vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]],
        );
        let mut conn = source.connect().unwrap();
        let mut stmt = conn.prepare("select a from t", PrepareKind::Query).unwrap();
        let mut cursor = stmt.execute_query().unwrap();
        assert_eq!(source.open_cursors(), 1);
        assert_eq!(cursor.columns(), ["a".to_string()]);
        assert_eq!(cursor.next_row().unwrap().unwrap().get(0), Some(&SqlValue::Int(1)));
        assert_eq!(cursor.next_row().unwrap().unwrap().get(0), Some(&SqlValue::Int(2)));
        assert!(cursor.next_row().unwrap().is_none());
        cursor.close().unwrap();
        assert_eq!(source.open_cursors(), 0);
    }

    #[test]
    fn test_broken_link_fails_statements_but_not_is_closed() {
        let source = MockDataSource::new();
        let mut conn = source.connect().unwrap();
        source.connection(1).unwrap().break_link();
        assert!(!conn.is_closed());
        assert!(matches!(
            conn.prepare("select 1", PrepareKind::Query),
            Err(DriverError::Connection(_))
        ));
    }

    #[test]
    fn test_inserts_generate_ids() {
        let source = MockDataSource::new();
        let mut conn = source.connect().unwrap();
        let mut stmt = conn
            .prepare(
                "insert into t values (?)",
                PrepareKind::Update {
                    generated_keys: true,
                },
            )
            .unwrap();
        stmt.bind(1, &SqlValue::Int(9)).unwrap();
        stmt.execute_update().unwrap();
        let mut keys = stmt.generated_keys().unwrap();
        assert_eq!(keys.next_row().unwrap().unwrap().get(0), Some(&SqlValue::Int(1)));
        assert_eq!(source.executed()[0].params, vec![SqlValue::Int(9)]);
    }

    #[test]
    fn test_credentials_recorded() {
        let source = MockDataSource::new();
        source.connect().unwrap();
        source.connect_with(&Credentials::new("scott", "tiger")).unwrap();
        assert_eq!(source.credentials_seen(), vec![None, Some("scott".to_string())]);
    }
}

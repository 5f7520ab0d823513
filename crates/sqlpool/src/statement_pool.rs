//! Prepared-statement cache keyed by query text.
//!
//! Statements are grouped by their exact (case-sensitive) SQL text. A lookup
//! scans the group for a statement that is valid, idle and sits on an idle,
//! healthy connection; on a miss a new statement is prepared on a connection
//! borrowed from the [`ConnectionPool`], up to a fixed global ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sqlpool_driver::PrepareKind;

use crate::connection::ManagedConnection;
use crate::error::{PoolError, Result};
use crate::lifecycle::{CleanupReport, Pooled};
use crate::pool::ConnectionPool;
use crate::statement::PooledStatement;

/// A pool of prepared statements.
///
/// # Example
///
/// ```rust,ignore
/// let statements = StatementPool::new(Arc::new(connection_pool));
///
/// let insert = statements.prepare_update("insert into users (name) values (?)")?;
/// insert.execute_update(&["ann".into()])?;
/// let id = insert.last_insert_id("id")?;
///
/// let query = statements.prepare_query("select name from users where id = ?")?;
/// for row in query.execute_query(&[id.into()])? {
///     println!("{:?}", row?.get(0));
/// }
/// query.notify_over();
/// ```
pub struct StatementPool {
    connections: Arc<ConnectionPool>,
    inner: Mutex<StatementPoolInner>,
    closed: AtomicBool,
    next_statement_id: AtomicU64,
    created_at: Instant,
    metrics: Mutex<StatementMetricsInner>,
}

#[derive(Default)]
struct StatementPoolInner {
    statements: HashMap<String, Vec<Arc<PooledStatement>>>,
    /// Live statements across all queries.
    count: usize,
}

#[derive(Debug, Default)]
struct StatementMetricsInner {
    prepared: u64,
    reused: u64,
    invalidated: u64,
    capacity_rejections: u64,
    health_checks_performed: u64,
    health_checks_failed: u64,
}

/// Result of scanning the statements cached for one query.
enum Scan {
    Hit(Arc<PooledStatement>),
    Unhealthy(Arc<ManagedConnection>),
    Miss,
}

impl std::fmt::Debug for StatementPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementPool")
            .field("usage", &self.usage_stats())
            .field("max_statements", &self.max_statements())
            .finish()
    }
}

impl StatementPool {
    /// Create a statement pool drawing connections from `connections`.
    ///
    /// Capacity and health-check settings come from the connection pool's
    /// [`PoolConfig`](crate::PoolConfig).
    pub fn new(connections: Arc<ConnectionPool>) -> Self {
        tracing::info!(
            max_statements = connections.config().max_statements,
            check_connections = connections.config().check_connections,
            check_interval = ?connections.config().check_interval,
            "statement pool created"
        );
        Self {
            connections,
            inner: Mutex::new(StatementPoolInner::default()),
            closed: AtomicBool::new(false),
            next_statement_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(StatementMetricsInner::default()),
        }
    }

    /// The underlying connection pool.
    #[must_use]
    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }

    fn max_statements(&self) -> usize {
        self.connections.config().max_statements
    }

    /// Get a query statement for `sql`, marked in use.
    pub fn prepare_query(&self, sql: &str) -> Result<Arc<PooledStatement>> {
        self.prepare_statement(sql, false)
    }

    /// Get an update statement for `sql`, marked in use.
    pub fn prepare_update(&self, sql: &str) -> Result<Arc<PooledStatement>> {
        self.prepare_statement(sql, true)
    }

    fn prepare_statement(&self, sql: &str, update: bool) -> Result<Arc<PooledStatement>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let mut inner = self.inner.lock();

        loop {
            match self.scan(&mut inner, sql) {
                Scan::Hit(statement) => {
                    statement.set_in_use(true);
                    self.metrics.lock().reused += 1;
                    tracing::trace!(statement_id = statement.id(), sql = sql, "reusing statement");
                    return Ok(statement);
                }
                Scan::Unhealthy(connection) => {
                    self.invalidate_connection(&mut inner, &connection);
                }
                Scan::Miss => break,
            }
        }

        let max = self.max_statements();
        if inner.count >= max {
            self.sweep_invalid(&mut inner);
        }
        if inner.count >= max {
            self.metrics.lock().capacity_rejections += 1;
            tracing::warn!(max, sql = sql, "statement pool exhausted");
            return Err(PoolError::StatementCapacity { max });
        }

        let connection = self.connections.get_connection()?;
        let kind = if update {
            PrepareKind::Update {
                generated_keys: connection.driver_info().last_insert.wants_generated_keys(),
            }
        } else {
            PrepareKind::Query
        };
        let raw = connection.prepare(sql, kind)?;

        let id = self.next_statement_id.fetch_add(1, Ordering::Relaxed);
        let statement = Arc::new(PooledStatement::new(id, sql, kind, raw, connection));
        statement.set_in_use(true);
        inner
            .statements
            .entry(sql.to_string())
            .or_default()
            .push(Arc::clone(&statement));
        inner.count += 1;
        self.metrics.lock().prepared += 1;

        tracing::debug!(
            statement_id = id,
            connection_id = statement.connection().id(),
            sql = sql,
            update,
            "prepared statement"
        );
        Ok(statement)
    }

    /// Scan the statements cached for `sql`, dropping invalid ones.
    fn scan(&self, inner: &mut StatementPoolInner, sql: &str) -> Scan {
        let check_interval = self.connections.config().effective_check_interval();
        let Some(list) = inner.statements.get_mut(sql) else {
            return Scan::Miss;
        };

        let mut removed = Vec::new();
        let mut outcome = Scan::Miss;
        let mut index = 0;
        while index < list.len() {
            let statement = &list[index];
            let state = statement.resource_state();
            if state.should_remove() {
                removed.push(list.remove(index));
                continue;
            }
            let connection = statement.connection();
            if state.is_available() && !connection.is_busy() {
                // a closed connection never recovers, whatever the interval
                if connection.is_closed() {
                    outcome = Scan::Unhealthy(Arc::clone(connection));
                    break;
                }
                let due = check_interval.is_some_and(|interval| connection.last_use().elapsed() >= interval);
                if due {
                    let healthy = connection.check();
                    let mut metrics = self.metrics.lock();
                    metrics.health_checks_performed += 1;
                    if !healthy {
                        metrics.health_checks_failed += 1;
                        outcome = Scan::Unhealthy(Arc::clone(connection));
                        break;
                    }
                }
                outcome = Scan::Hit(Arc::clone(statement));
                break;
            }
            index += 1;
        }
        if list.is_empty() {
            inner.statements.remove(sql);
        }

        inner.count -= removed.len();
        if !removed.is_empty() {
            close_all(&removed);
            tracing::debug!(sql = sql, removed = removed.len(), "dropped invalid statements");
        }
        outcome
    }

    /// Remove invalid statements under every query, not just the one being
    /// requested, so they stop counting against the ceiling.
    fn sweep_invalid(&self, inner: &mut StatementPoolInner) {
        let mut removed = Vec::new();
        inner.statements.retain(|_, list| {
            list.retain(|statement| {
                if statement.resource_state().should_remove() {
                    removed.push(Arc::clone(statement));
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
        if removed.is_empty() {
            return;
        }
        inner.count -= removed.len();
        close_all(&removed);
        tracing::debug!(removed = removed.len(), "swept invalid statements");
    }

    /// Invalidate and remove every statement prepared on `connection`, then
    /// close the connection.
    fn invalidate_connection(
        &self,
        inner: &mut StatementPoolInner,
        connection: &Arc<ManagedConnection>,
    ) {
        let mut removed = Vec::new();
        inner.statements.retain(|_, list| {
            list.retain(|statement| {
                if statement.belongs_to(connection) {
                    statement.invalidate();
                    removed.push(Arc::clone(statement));
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });
        inner.count -= removed.len();

        let mut report = close_all(&removed);
        report.record(connection.id(), "connection", connection.close());
        self.metrics.lock().invalidated += removed.len() as u64;

        tracing::warn!(
            connection_id = connection.id(),
            invalidated = removed.len(),
            "connection is dead, statements invalidated"
        );
    }

    /// Close every cached statement, best effort, and empty the cache.
    pub fn clear(&self) -> CleanupReport {
        let drained = {
            let mut inner = self.inner.lock();
            inner.count = 0;
            std::mem::take(&mut inner.statements)
        };
        let mut report = CleanupReport::default();
        for statement in drained.values().flatten() {
            report.record(statement.id(), "statement", statement.close());
        }
        tracing::info!(
            closed = report.closed,
            failed = report.failures.len(),
            "statement pool cleared"
        );
        report
    }

    /// Clear the cache and refuse further requests. The connection pool is
    /// left open.
    pub fn close(&self) -> CleanupReport {
        self.closed.store(true, Ordering::Release);
        tracing::info!("statement pool closed");
        self.clear()
    }

    /// Idle statements and distinct cached queries.
    #[must_use]
    pub fn usage_stats(&self) -> UsageStats {
        let inner = self.inner.lock();
        let idle_statements = inner
            .statements
            .values()
            .flatten()
            .filter(|s| s.resource_state().is_available())
            .count();
        UsageStats {
            idle_statements,
            distinct_queries: inner.statements.len(),
            total_statements: inner.count,
        }
    }

    /// Get statement pool metrics.
    #[must_use]
    pub fn metrics(&self) -> StatementMetrics {
        let inner = self.metrics.lock();
        StatementMetrics {
            statements_prepared: inner.prepared,
            statements_reused: inner.reused,
            statements_invalidated: inner.invalidated,
            capacity_rejections: inner.capacity_rejections,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            uptime: self.created_at.elapsed(),
        }
    }
}

/// Close `statements`, best effort.
fn close_all(statements: &[Arc<PooledStatement>]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for statement in statements {
        report.record(statement.id(), "statement", statement.close());
    }
    report
}

/// Usage snapshot of a [`StatementPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    /// Valid statements not currently handed out.
    pub idle_statements: usize,
    /// Distinct query texts with cached statements.
    pub distinct_queries: usize,
    /// All live statements.
    pub total_statements: usize,
}

/// Metrics collected from a [`StatementPool`].
#[derive(Debug, Clone)]
pub struct StatementMetrics {
    /// Statements prepared on a cache miss.
    pub statements_prepared: u64,
    /// Requests served from the cache.
    pub statements_reused: u64,
    /// Statements invalidated because their connection failed a check.
    pub statements_invalidated: u64,
    /// Requests rejected at the statement ceiling.
    pub capacity_rejections: u64,
    /// Connection checks performed during lookups.
    pub health_checks_performed: u64,
    /// Connection checks that failed.
    pub health_checks_failed: u64,
    /// Time since pool creation.
    pub uptime: std::time::Duration,
}

impl StatementMetrics {
    /// Fraction of requests served from the cache (0.0 to 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.statements_prepared + self.statements_reused;
        if total == 0 {
            return 0.0;
        }
        self.statements_reused as f64 / total as f64
    }

    /// Calculate health check success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self.health_checks_performed - self.health_checks_failed;
        successful as f64 / self.health_checks_performed as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use sqlpool_driver::DriverInfo;
    use sqlpool_testing::MockDataSource;
    use std::time::Duration;

    fn statements(source: &MockDataSource, config: PoolConfig) -> StatementPool {
        let pool = ConnectionPool::builder()
            .data_source(source.clone())
            .driver_info(DriverInfo::new("test").ping_query("select 1"))
            .config(config)
            .build()
            .unwrap();
        StatementPool::new(Arc::new(pool))
    }

    #[test]
    fn test_released_statement_is_reused() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());

        let first = pool.prepare_query("select * from t").unwrap();
        first.notify_over();
        let second = pool.prepare_query("select * from t").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.prepare_count("select * from t"), 1);
        assert_eq!(pool.metrics().statements_reused, 1);
    }

    #[test]
    fn test_in_use_statement_is_not_shared() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());

        let first = pool.prepare_query("select * from t").unwrap();
        let second = pool.prepare_query("select * from t").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.usage_stats().total_statements, 2);
    }

    #[test]
    fn test_query_text_is_case_sensitive() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());

        let lower = pool.prepare_query("select 1").unwrap();
        lower.notify_over();
        let upper = pool.prepare_query("SELECT 1").unwrap();
        assert!(!Arc::ptr_eq(&lower, &upper));
        assert_eq!(pool.usage_stats().distinct_queries, 2);
    }

    #[test]
    fn test_capacity_error_without_eviction() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new().max_statements(2));

        let a = pool.prepare_query("select a from t").unwrap();
        a.notify_over();
        let _b = pool.prepare_query("select b from t").unwrap();

        assert!(matches!(
            pool.prepare_query("select c from t"),
            Err(PoolError::StatementCapacity { max: 2 })
        ));
        // the idle statement of another query is not evicted
        assert_eq!(pool.usage_stats().idle_statements, 1);
        assert_eq!(pool.metrics().capacity_rejections, 1);

        // the cached query is still served
        assert!(Arc::ptr_eq(&a, &pool.prepare_query("select a from t").unwrap()));
    }

    #[test]
    fn test_update_requests_generated_keys_only_when_needed() {
        let source = MockDataSource::new();
        let pool = ConnectionPool::builder()
            .data_source(source.clone())
            .driver_info(DriverInfo::for_vendor("sqlserver").unwrap())
            .build()
            .unwrap();
        let pool = StatementPool::new(Arc::new(pool));

        let insert = pool.prepare_update("insert into t (a) values (?)").unwrap();
        insert.execute_update(&[1.into()]).unwrap();
        assert_eq!(insert.last_insert_id("id").unwrap(), 1);
    }

    #[test]
    fn test_recent_connection_skips_check() {
        let source = MockDataSource::new();
        let pool = statements(
            &source,
            PoolConfig::new().check_interval(Duration::from_secs(3600)),
        );

        let first = pool.prepare_query("select * from t").unwrap();
        first.notify_over();
        pool.prepare_query("select * from t").unwrap();

        assert_eq!(source.prepare_count("select 1"), 0);
        assert_eq!(pool.metrics().health_checks_performed, 0);
    }

    #[test]
    fn test_due_connection_is_checked() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new().check_interval(Duration::ZERO));

        let first = pool.prepare_query("select * from t").unwrap();
        first.notify_over();
        let second = pool.prepare_query("select * from t").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.prepare_count("select 1"), 1);
        assert_eq!(pool.metrics().health_checks_performed, 1);
    }

    #[test]
    fn test_checks_disabled() {
        let source = MockDataSource::new();
        let pool = statements(
            &source,
            PoolConfig::new()
                .check_connections(false)
                .check_interval(Duration::ZERO),
        );

        let first = pool.prepare_query("select * from t").unwrap();
        first.notify_over();
        source.connection(1).unwrap().break_link();
        let second = pool.prepare_query("select * from t").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.metrics().health_checks_performed, 0);
    }

    #[test]
    fn test_closed_statements_are_dropped_from_scan() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());

        let first = pool.prepare_query("select * from t").unwrap();
        first.notify_over();
        first.close().unwrap();

        let second = pool.prepare_query("select * from t").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.usage_stats().total_statements, 1);
    }

    #[test]
    fn test_usage_stats() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());

        let a = pool.prepare_query("select a from t").unwrap();
        let _a2 = pool.prepare_query("select a from t").unwrap();
        let _b = pool.prepare_update("update t set b = 1").unwrap();
        a.notify_over();

        let stats = pool.usage_stats();
        assert_eq!(stats.idle_statements, 1);
        assert_eq!(stats.distinct_queries, 2);
        assert_eq!(stats.total_statements, 3);
    }

    #[test]
    fn test_clear_closes_everything() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());

        let a = pool.prepare_query("select a from t").unwrap();
        pool.prepare_query("select b from t").unwrap();

        let report = pool.clear();
        assert_eq!(report.closed, 2);
        assert!(report.is_clean());
        assert!(!a.is_valid());
        assert_eq!(pool.usage_stats().total_statements, 0);
        assert_eq!(source.statements_closed(), 2);
    }

    #[test]
    fn test_closed_pool_rejects_requests() {
        let source = MockDataSource::new();
        let pool = statements(&source, PoolConfig::new());
        pool.close();
        assert!(matches!(pool.prepare_query("select 1"), Err(PoolError::Closed)));
        assert!(!pool.connection_pool().is_closed());
    }

    #[test]
    fn test_metrics_rates() {
        let metrics = StatementMetrics {
            statements_prepared: 1,
            statements_reused: 3,
            statements_invalidated: 0,
            capacity_rejections: 0,
            health_checks_performed: 4,
            health_checks_failed: 1,
            uptime: Duration::from_secs(1),
        };
        assert!((metrics.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert!((metrics.health_check_success_rate() - 0.75).abs() < f64::EPSILON);
    }
}

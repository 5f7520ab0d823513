//! Connection pool implementation.
//!
//! The pool hands out idle connections, opens new ones up to
//! [`PoolConfig::max_connections`], and once saturated degrades to handing
//! out a busy connection instead of blocking or failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sqlpool_driver::{Credentials, DataSource, DriverInfo};

use crate::config::PoolConfig;
use crate::connection::{LastInsertResolver, ManagedConnection};
use crate::error::{PoolError, Result};
use crate::lifecycle::CleanupReport;

/// A bounded pool of [`ManagedConnection`]s.
///
/// # Saturation
///
/// When every connection is busy and the pool is at capacity,
/// [`get_connection`](Self::get_connection) returns the first connection in
/// the pool even though it is in use. Callers must tolerate sharing a
/// physical connection under that load.
///
/// # Example
///
/// ```rust,ignore
/// use sqlpool::{ConnectionPool, PoolConfig};
/// use sqlpool_driver::{Credentials, DriverInfo};
///
/// let pool = ConnectionPool::builder()
///     .data_source(my_driver)
///     .driver_info(DriverInfo::for_vendor("postgresql").unwrap_or_default())
///     .credentials(Credentials::new("app", "secret"))
///     .config(PoolConfig::new().max_connections(4).schema("sales"))
///     .build()?;
///
/// let conn = pool.get_connection()?;
/// conn.execute("delete from sessions where expired")?;
/// ```
pub struct ConnectionPool {
    config: PoolConfig,
    source: Arc<dyn DataSource>,
    credentials: Credentials,
    info: Arc<DriverInfo>,
    resolver: Arc<LastInsertResolver>,

    /// Connections in creation order.
    connections: Mutex<Vec<Arc<ManagedConnection>>>,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections closed or dropped as dead.
    connections_closed: u64,
    /// Total checkouts.
    checkouts: u64,
    /// Checkouts that handed out a busy connection.
    degraded_checkouts: u64,
    /// Failed connection attempts.
    connect_failures: u64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("vendor", &self.info.vendor)
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new()
    }

    /// Create a pool. No connection is opened until the first request.
    pub fn new(
        source: Arc<dyn DataSource>,
        info: DriverInfo,
        credentials: Credentials,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!(
            vendor = %info.vendor,
            max = config.max_connections,
            schema = ?config.schema,
            autocommit = config.autocommit,
            "connection pool created"
        );

        Ok(Self {
            resolver: Arc::new(LastInsertResolver::new(Arc::clone(&source))),
            source,
            credentials,
            info: Arc::new(info),
            config,
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        })
    }

    /// Get a connection.
    ///
    /// Dead connections are dropped along the way. The first idle connection
    /// is returned; otherwise a new one is opened, or at capacity the first
    /// connection is returned even though it is busy.
    pub fn get_connection(&self) -> Result<Arc<ManagedConnection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let mut connections = self.connections.lock();

        let before = connections.len();
        connections.retain(|conn| {
            let closed = conn.is_closed();
            if closed {
                tracing::debug!(connection_id = conn.id(), "dropping closed connection");
            }
            !closed
        });
        let dropped = before - connections.len();

        let mut metrics = self.metrics.lock();
        metrics.connections_closed += dropped as u64;

        if let Some(conn) = connections.iter().find(|conn| !conn.is_busy()) {
            metrics.checkouts += 1;
            tracing::trace!(connection_id = conn.id(), "reusing idle connection");
            return Ok(Arc::clone(conn));
        }

        if connections.len() >= self.config.max_connections {
            if let Some(first) = connections.first() {
                metrics.checkouts += 1;
                metrics.degraded_checkouts += 1;
                tracing::warn!(
                    connection_id = first.id(),
                    max = self.config.max_connections,
                    "connection pool saturated, sharing a busy connection"
                );
                return Ok(Arc::clone(first));
            }
        }
        drop(metrics);

        let conn = match self.create_connection() {
            Ok(conn) => Arc::new(conn),
            Err(error) => {
                self.metrics.lock().connect_failures += 1;
                return Err(error);
            }
        };
        connections.push(Arc::clone(&conn));

        let mut metrics = self.metrics.lock();
        metrics.connections_created += 1;
        metrics.checkouts += 1;
        Ok(conn)
    }

    fn create_connection(&self) -> Result<ManagedConnection> {
        let id = self.next_connection_id();
        tracing::debug!(connection_id = id, vendor = %self.info.vendor, "opening connection");

        let raw = if self.credentials.has_credentials() {
            self.source.connect_with(&self.credentials)?
        } else {
            self.source.connect()?
        };
        let conn = ManagedConnection::new(id, raw, Arc::clone(&self.info), Arc::clone(&self.resolver));

        if let Err(error) = self.initialize(&conn) {
            if let Err(close_error) = conn.close() {
                tracing::debug!(connection_id = id, error = %close_error, "failed to close half-initialized connection");
            }
            return Err(error);
        }
        Ok(conn)
    }

    /// Select the configured schema and apply the autocommit mode.
    fn initialize(&self, conn: &ManagedConnection) -> Result<()> {
        if let Some(schema) = self.config.schema.as_deref() {
            match self.info.schema_query_for(schema) {
                Some(query) => {
                    conn.execute(&query)?;
                }
                None => tracing::debug!(
                    vendor = %self.info.vendor,
                    schema,
                    "driver has no schema query, schema not selected"
                ),
            }
        }
        conn.set_autocommit(self.config.autocommit)
    }

    /// Close every connection, best effort.
    ///
    /// Close failures are logged and reported, never raised. The pool stays
    /// usable and opens fresh connections on demand.
    pub fn clear(&self) -> CleanupReport {
        let drained: Vec<_> = std::mem::take(&mut *self.connections.lock());
        let mut report = CleanupReport::default();
        for conn in &drained {
            report.record(conn.id(), "connection", conn.close());
        }
        self.metrics.lock().connections_closed += drained.len() as u64;
        tracing::info!(
            closed = report.closed,
            failed = report.failures.len(),
            "connection pool cleared"
        );
        report
    }

    /// Clear the pool and refuse further requests.
    pub fn close(&self) -> CleanupReport {
        self.closed.store(true, Ordering::Release);
        tracing::info!("connection pool closed");
        self.clear()
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let connections = self.connections.lock();
        let busy = connections.iter().filter(|c| c.is_busy()).count();
        PoolStatus {
            idle: connections.len() - busy,
            busy,
            total: connections.len(),
            max: self.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts: inner.checkouts,
            degraded_checkouts: inner.degraded_checkouts,
            connect_failures: inner.connect_failures,
            uptime: self.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the driver descriptor.
    #[must_use]
    pub fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    /// Generate a new unique connection ID.
    fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ConnectionPool::builder()
///     .data_source(driver)
///     .config(PoolConfig::new().max_connections(4))
///     .build()?;
/// ```
#[derive(Default)]
pub struct ConnectionPoolBuilder {
    source: Option<Arc<dyn DataSource>>,
    info: DriverInfo,
    credentials: Credentials,
    config: PoolConfig,
}

impl ConnectionPoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data source producing raw connections.
    #[must_use]
    pub fn data_source(mut self, source: impl DataSource + 'static) -> Self {
        let source: Arc<dyn DataSource> = Arc::new(source);
        self.source = Some(source);
        self
    }

    /// Set a shared data source.
    #[must_use]
    pub fn shared_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the driver descriptor.
    #[must_use]
    pub fn driver_info(mut self, info: DriverInfo) -> Self {
        self.info = info;
        self
    }

    /// Set the login credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<ConnectionPool> {
        let source = self
            .source
            .ok_or_else(|| PoolError::Configuration("a data source is required".into()))?;
        ConnectionPool::new(source, self.info, self.credentials, self.config)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections.
    pub idle: usize,
    /// Number of connections currently busy.
    pub busy: usize,
    /// Total number of connections.
    pub total: usize,
    /// Maximum allowed connections.
    pub max: usize,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.busy as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed or dropped as dead.
    pub connections_closed: u64,
    /// Connection checkouts.
    pub checkouts: u64,
    /// Checkouts that returned a busy connection at capacity.
    pub degraded_checkouts: u64,
    /// Failed attempts to open a connection.
    pub connect_failures: u64,
    /// Time since pool creation.
    pub uptime: std::time::Duration,
}

impl PoolMetrics {
    /// Fraction of checkouts served without sharing a busy connection
    /// (0.0 to 1.0).
    #[must_use]
    pub fn exclusive_checkout_rate(&self) -> f64 {
        if self.checkouts == 0 {
            return 1.0;
        }
        (self.checkouts - self.degraded_checkouts) as f64 / self.checkouts as f64
    }

    /// Fraction of connection attempts that succeeded (0.0 to 1.0).
    #[must_use]
    pub fn connect_success_rate(&self) -> f64 {
        let attempts = self.connections_created + self.connect_failures;
        if attempts == 0 {
            return 1.0;
        }
        self.connections_created as f64 / attempts as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sqlpool_driver::DriverError;
    use sqlpool_testing::MockDataSource;

    fn pool(source: &MockDataSource, config: PoolConfig) -> ConnectionPool {
        ConnectionPool::builder()
            .data_source(source.clone())
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            idle: 5,
            busy: 5,
            total: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            idle: 0,
            busy: 10,
            total: 10,
            max: 10,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            idle: 5,
            busy: 5,
            total: 10,
            max: 20,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_rates() {
        let metrics = PoolMetrics {
            connections_created: 9,
            connections_closed: 2,
            checkouts: 100,
            degraded_checkouts: 10,
            connect_failures: 1,
            uptime: std::time::Duration::from_secs(3600),
        };

        assert!((metrics.exclusive_checkout_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.connect_success_rate() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_requires_data_source() {
        assert!(matches!(
            ConnectionPool::builder().build(),
            Err(PoolError::Configuration(_))
        ));
    }

    #[test]
    fn test_builder_validates_config() {
        let result = ConnectionPool::builder()
            .data_source(MockDataSource::new())
            .max_connections(0)
            .build();
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[test]
    fn test_idle_connection_is_reused() {
        let source = MockDataSource::new();
        let pool = pool(&source, PoolConfig::new());

        let first = pool.get_connection().unwrap();
        let second = pool.get_connection().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.connections_opened(), 1);
    }

    #[test]
    fn test_busy_connection_triggers_new_one_below_capacity() {
        let source = MockDataSource::new();
        let pool = pool(&source, PoolConfig::new().max_connections(2));

        let first = pool.get_connection().unwrap();
        let _busy = first.busy();
        let second = pool.get_connection().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.status().total, 2);
        assert_eq!(pool.status().busy, 1);
    }

    #[test]
    fn test_closed_connections_are_dropped() {
        let source = MockDataSource::new();
        let pool = pool(&source, PoolConfig::new());

        let first = pool.get_connection().unwrap();
        source.connection(first.id()).unwrap().kill();

        let second = pool.get_connection().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(pool.status().total, 1);
        assert_eq!(pool.metrics().connections_closed, 1);
    }

    #[test]
    fn test_new_connection_applies_schema_and_autocommit() {
        let source = MockDataSource::new();
        let pool = ConnectionPool::builder()
            .data_source(source.clone())
            .driver_info(DriverInfo::for_vendor("postgresql").unwrap())
            .credentials(Credentials::new("app", "secret"))
            .config(PoolConfig::new().schema("sales").autocommit(false))
            .build()
            .unwrap();

        let conn = pool.get_connection().unwrap();
        let executed = source.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].sql, "set search_path = sales");
        assert!(!source.connection(conn.id()).unwrap().autocommit());
        assert_eq!(source.credentials_seen(), vec![Some("app".to_string())]);
    }

    #[test]
    fn test_connect_failure_propagates() {
        let source = MockDataSource::new();
        source.fail_connect(true);
        let pool = pool(&source, PoolConfig::new());

        assert!(matches!(
            pool.get_connection(),
            Err(PoolError::Driver(DriverError::Connection(_)))
        ));
        assert_eq!(pool.status().total, 0);
        assert_eq!(pool.metrics().connect_failures, 1);
    }

    #[test]
    fn test_clear_is_best_effort() {
        let source = MockDataSource::new();
        let pool = pool(&source, PoolConfig::new().max_connections(3));

        let a = pool.get_connection().unwrap();
        let _a_busy = a.busy();
        let b = pool.get_connection().unwrap();
        let _b_busy = b.busy();
        let c = pool.get_connection().unwrap();
        source.connection(b.id()).unwrap().fail_close();

        let report = pool.clear();
        assert_eq!(report.closed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, b.id());
        assert!(source.connection(a.id()).unwrap().is_closed());
        assert!(source.connection(c.id()).unwrap().is_closed());
        assert_eq!(pool.status().total, 0);
    }

    #[test]
    fn test_closed_pool_rejects_requests() {
        let source = MockDataSource::new();
        let pool = pool(&source, PoolConfig::new());
        pool.get_connection().unwrap();

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.get_connection(), Err(PoolError::Closed)));
    }
}

//! # sqlpool
//!
//! Connection pool and prepared-statement cache for blocking database
//! drivers.
//!
//! The pool sits between application code and a driver implementing the
//! [`sqlpool_driver`] traits. Statements are cached by SQL text and reused
//! whenever a copy is idle on an idle, healthy connection; connections are
//! created on demand up to a ceiling, after which checkouts degrade to
//! sharing instead of failing.
//!
//! ## Features
//!
//! - Statement reuse keyed by exact SQL text
//! - Busy tracking with nesting, so a connection running a statement is
//!   never handed to another one
//! - Interval-gated connection checks with cascading invalidation of every
//!   statement on a dead connection
//! - Vendor-neutral last-insert-id retrieval (generated keys, follow-up
//!   query or a driver-specific method)
//! - Pool status and metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool::{ConnectionPool, PoolConfig, Pooled, StatementPool};
//! use sqlpool::driver::DriverInfo;
//! use std::sync::Arc;
//!
//! let pool = ConnectionPool::builder()
//!     .data_source(my_driver)
//!     .driver_info(DriverInfo::for_vendor("postgresql").unwrap_or_default())
//!     .config(PoolConfig::new().max_connections(4).max_statements(32))
//!     .build()?;
//! let statements = StatementPool::new(Arc::new(pool));
//!
//! let insert = statements.prepare_update("insert into users (name) values (?)")?;
//! insert.execute_update(&["ann".into()])?;
//! println!("new id: {}", insert.last_insert_id("id")?);
//!
//! let query = statements.prepare_query("select name from users")?;
//! for row in query.execute_query(&[])? {
//!     println!("{:?}", row?.get(0));
//! }
//! query.notify_over();
//!
//! println!("hit rate: {:.2}", statements.metrics().hit_rate());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod statement;
pub mod statement_pool;

/// Driver abstraction the pool is built on.
pub use sqlpool_driver as driver;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::{PoolError, Result};

// Connections
pub use connection::{BusyGuard, ManagedConnection, NULL_INSERT_ID};
pub use pool::{ConnectionPool, ConnectionPoolBuilder, PoolMetrics, PoolStatus};

// Statements
pub use statement::{PooledStatement, Rows};
pub use statement_pool::{StatementMetrics, StatementPool, UsageStats};

// Lifecycle management
pub use lifecycle::{CleanupReport, Pooled, PooledState, ResourceState};

//! # sqlpool-driver
//!
//! Driver capability traits for the `sqlpool` connection and statement pools.
//!
//! The pools never talk to a database directly. Everything they need from the
//! driver layer is expressed here as a small set of object-safe traits that a
//! host application implements once per database client library:
//!
//! - [`DataSource`]: produces raw connections, with or without credentials
//! - [`RawConnection`]: prepares statements, executes one-off SQL, manages
//!   transactions and reports whether it is closed
//! - [`RawStatement`]: binds positional parameters and executes
//! - [`ResultCursor`]: forward-only iteration over result rows
//!
//! Driver-specific facts the pool relies on (ping query, schema-set template,
//! last-insert-id policy) travel in a [`DriverInfo`] descriptor.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool_driver::{DriverInfo, LastInsertPolicy};
//!
//! let info = DriverInfo::for_vendor("postgresql").unwrap_or_default();
//! assert_eq!(info.ping_query.as_deref(), Some("select 1"));
//! assert!(matches!(info.last_insert, LastInsertPolicy::Query(_)));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod credentials;
pub mod error;
pub mod info;
pub mod value;

pub use connection::{
    DataSource, LastInsertIdMethod, PrepareKind, RawConnection, RawStatement, ResultCursor,
};
pub use credentials::Credentials;
pub use error::DriverError;
pub use info::{CaseFolding, DriverInfo, LastInsertPolicy};
pub use value::{Row, SqlValue};

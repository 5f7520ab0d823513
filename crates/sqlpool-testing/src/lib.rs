//! # sqlpool-testing
//!
//! Test infrastructure for the `sqlpool` crates.
//!
//! [`MockDataSource`] implements every `sqlpool-driver` capability in memory.
//! Results are scripted per SQL text, inserts hand out auto-increment ids,
//! and each physical connection can be killed or have its link broken to
//! exercise the pool's health checks and invalidation paths.
//!
//! ```rust,ignore
//! use sqlpool_testing::MockDataSource;
//!
//! let source = MockDataSource::new()
//!     .with_query_result("select name from users", &["name"], vec![vec!["ann".into()]]);
//! // hand `source` to a ConnectionPool ...
//! source.connection(1).unwrap().break_link();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

pub use mock::{ExecutedStatement, MockConnectionHandle, MockDataSource, MockStatement};

//! # sqlx-sqlite-conn-mgr
//!
//! A bounded connection pool for SQLite built on SQLx, with busy-retry and
//! exponential backoff for the single-writer realities of an embedded store.
//!
//! ## Core Types
//!
//! - **[`Pool`]**: bounded set of connections with a FIFO wait queue
//! - **[`PooledHandle`]**: RAII guard returning its connection on drop
//! - **[`RetryExecutor`]**: retries `SQLITE_BUSY`/`SQLITE_LOCKED` with backoff
//! - **[`StorageHandle`]** / **[`Connector`]**: the narrow connection interface
//!   the pool relies on; [`SqliteHandle`] and [`SqliteConnector`] implement it
//! - **[`Clock`]**: injectable time source ([`SystemClock`], [`ManualClock`])
//! - **[`Error`]**: error type for pool and handle operations
//!
//! ## Architecture
//!
//! - **Hard ceiling**: never more than `max_connections` handles exist
//! - **FIFO fairness**: released connections go straight to the oldest waiter
//! - **Cancellable waits**: timeouts and dropped futures give up their place
//!   in the queue without leaking a connection
//! - **Configured once**: pragmas run exactly once per new connection

mod clock;
mod config;
mod error;
mod handle;
mod pool;
mod retry;
mod sqlite;
mod transaction;

// Re-export public types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PoolConfig, RetryPolicy};
pub use error::{Error, Result};
pub use handle::{Connector, Row, Statement, StorageHandle, WriteResult, fetch_optional};
pub use pool::{Pool, PoolStatus, PooledHandle};
pub use retry::RetryExecutor;
pub use sqlite::{SqliteConnector, SqliteHandle, bind_value, decode_rows};
pub use transaction::execute_transaction;

pub use futures::future::BoxFuture;

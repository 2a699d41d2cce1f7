//! # sqlx-sqlite-coordinator
//!
//! Coordinates access to an embedded SQLite store: a bounded connection pool,
//! busy-retry with exponential backoff, versioned migrations and a
//! scope-invalidated read cache, all owned by one [`Coordinator`].
//!
//! ## Usage
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_sqlite_coordinator::{Coordinator, CoordinatorConfig, Migration, Statement};
//!
//! # async fn example() -> Result<(), sqlx_sqlite_coordinator::Error> {
//! let coordinator = Coordinator::open(
//!     "data/app.db",
//!     vec![
//!         Migration::new(1, "create_items", "CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT)")
//!             .touches("items"),
//!     ],
//!     CoordinatorConfig::default(),
//! )?;
//!
//! coordinator.run_pending_migrations().await?;
//!
//! coordinator
//!     .execute("items", Statement::new("INSERT INTO items (title) VALUES ($1)").bind("first"))
//!     .await?;
//!
//! // Served from the cache until "items" is written again or the TTL passes
//! let rows = coordinator.fetch_all("items", "SELECT id, title FROM items").await?;
//! assert_eq!(rows[0].get("title"), Some(&json!("first")));
//!
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod coordinator;
mod error;

pub use cache::{CacheStats, Fingerprint, QueryCache};
pub use config::{CacheConfig, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use error::{Error, Result};

// Types callers need to build executors, statements and migrations
pub use sqlx_sqlite_conn_mgr::{
   BoxFuture, Clock, ManualClock, PoolConfig, PooledHandle, RetryPolicy, Row, SqliteConnector,
   SqliteHandle, Statement, StorageHandle, SystemClock, WriteResult,
};
pub use sqlx_sqlite_migrator::{
   AppliedMigration, LedgerEntry, Migration, MigrationReport, Migrator, MigratorConfig, RunState,
};

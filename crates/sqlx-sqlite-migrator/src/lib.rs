//! # sqlx-sqlite-migrator
//!
//! Versioned schema migrations for SQLite on top of `sqlx-sqlite-conn-mgr`.
//!
//! ## Core Types
//!
//! - **[`Migration`]**: one versioned change (statements plus the cache scopes
//!   it touches)
//! - **[`Migrator`]**: validates a migration set and applies pending versions
//! - **[`Ledger`]**: the table recording which versions have been applied
//! - **[`MigrationReport`]**: what a run applied
//! - **[`Error`]**: error type for validation and migration runs
//!
//! ## Guarantees
//!
//! - **Atomic per version**: a migration and its ledger entry commit together
//! - **Resumable**: a failed run leaves earlier versions committed, and the
//!   next run starts after the last recorded version
//! - **No skipped versions**: a declared version below the ledger's current
//!   version that was never recorded is reported instead of ignored
//! - **Busy-tolerant**: every transaction is retried on lock contention
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_conn_mgr::{Pool, PoolConfig, RetryExecutor, SqliteConnector};
//! use sqlx_sqlite_migrator::{Migration, Migrator, MigratorConfig};
//!
//! # async fn example() -> Result<(), sqlx_sqlite_migrator::Error> {
//! let pool = Pool::new(SqliteConnector::new("app.db"), PoolConfig::default());
//!
//! let migrator = Migrator::new(
//!     pool.clone(),
//!     RetryExecutor::default(),
//!     vec![
//!         Migration::new(1, "create_collections", "CREATE TABLE collections (id INTEGER PRIMARY KEY, title TEXT)")
//!             .touches("collections"),
//!         Migration::new(2, "create_items", "CREATE TABLE items (id INTEGER PRIMARY KEY, collection_id INTEGER)")
//!             .touches("items"),
//!     ],
//!     &MigratorConfig::default(),
//! )?;
//!
//! let report = migrator.migrate_to_latest().await?;
//! println!("now at version {}", report.to_version);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod ledger;
mod migration;
mod runner;

// Re-export public types
pub use config::MigratorConfig;
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerEntry};
pub use migration::Migration;
pub use runner::{AppliedMigration, MigrationReport, Migrator, RunState};

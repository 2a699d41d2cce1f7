//! Error types for sqlx-sqlite-coordinator

use thiserror::Error;

/// Errors returned by the [`Coordinator`](crate::Coordinator)
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the connection manager (pool, retry, storage)
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Error from the migration runner
   #[error(transparent)]
   Migrator(#[from] sqlx_sqlite_migrator::Error),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::ConnectionManager(e) => e.error_code(),
         Error::Migrator(e) => e.error_code(),
      }
   }

   /// Returns true when the failure is transient lock contention.
   pub fn is_busy(&self) -> bool {
      match self {
         Error::ConnectionManager(e) => e.is_busy(),
         Error::Migrator(sqlx_sqlite_migrator::Error::ConnectionManager(e)) => e.is_busy(),
         Error::Migrator(_) => false,
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for sqlx-sqlite-conn-mgr

use std::time::Duration;

use thiserror::Error;

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: i32 = 5;

/// SQLite primary result code for `SQLITE_LOCKED`.
const SQLITE_LOCKED: i32 = 6;

/// Errors that may occur when working with sqlx-sqlite-conn-mgr
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// The store is locked by another writer. Always retryable.
   ///
   /// Handles that are not backed by SQLx report contention through this
   /// variant so the retry executor can classify it.
   #[error("database is busy: {0}")]
   Busy(String),

   /// A statement failed in a handle that is not backed by SQLx.
   #[error("statement `{statement}` failed: {message}")]
   Storage { statement: String, message: String },

   /// The pool has been shut down and cannot hand out connections
   #[error("connection pool has been closed")]
   PoolClosed,

   /// No connection became available within the caller's timeout
   #[error("timed out after {0:?} waiting for a pooled connection")]
   AcquireTimeout(Duration),

   /// The operation kept failing with a busy error past the retry budget.
   #[error("`{operation}` still busy after {attempts} attempt(s): {source}")]
   RetryExhausted {
      operation: String,
      attempts: u32,
      #[source]
      source: Box<Error>,
   },

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// A query expected to return zero or one row returned more.
   #[error("query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },
}

impl Error {
   /// Returns true when the failure is transient lock contention
   /// (`SQLITE_BUSY`, `SQLITE_LOCKED` or any of their extended codes).
   pub fn is_busy(&self) -> bool {
      match self {
         Error::Busy(_) => true,
         Error::Sqlx(sqlx::Error::Database(db_err)) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
         _ => false,
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Busy(_) => "BUSY".to_string(),
         Error::Storage { .. } => "STORAGE_ERROR".to_string(),
         Error::PoolClosed => "POOL_CLOSED".to_string(),
         Error::AcquireTimeout(_) => "ACQUIRE_TIMEOUT".to_string(),
         Error::RetryExhausted { .. } => "RETRY_EXHAUSTED".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_busy_variant_is_busy() {
      assert!(Error::Busy("locked".into()).is_busy());
      assert!(!Error::PoolClosed.is_busy());
      assert!(
         !Error::Storage {
            statement: "SELECT 1".into(),
            message: "no such table".into(),
         }
         .is_busy()
      );
   }

   #[test]
   fn test_sqlx_non_database_error_is_not_busy() {
      assert!(!Error::Sqlx(sqlx::Error::RowNotFound).is_busy());
      assert_eq!(
         Error::Sqlx(sqlx::Error::RowNotFound).error_code(),
         "SQLX_ERROR"
      );
   }

   #[test]
   fn test_retry_exhausted_keeps_source() {
      let err = Error::RetryExhausted {
         operation: "insert item".into(),
         attempts: 4,
         source: Box::new(Error::Busy("database is locked".into())),
      };

      assert_eq!(err.error_code(), "RETRY_EXHAUSTED");
      assert!(!err.is_busy());
      assert!(err.to_string().contains("insert item"));
      assert!(err.to_string().contains("4 attempt"));
      assert!(err.to_string().contains("database is locked"));
   }

   #[test]
   fn test_acquire_timeout_message() {
      let err = Error::AcquireTimeout(Duration::from_millis(250));
      assert_eq!(err.error_code(), "ACQUIRE_TIMEOUT");
      assert!(err.to_string().contains("250ms"));
   }

   #[test]
   fn test_transaction_rollback_failed() {
      let err = Error::TransactionRollbackFailed {
         transaction_error: "constraint".into(),
         rollback_error: "busy".into(),
      };
      assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");
      assert!(err.to_string().contains("constraint"));
      assert!(err.to_string().contains("busy"));
   }
}

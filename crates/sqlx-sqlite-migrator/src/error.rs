//! Error types for sqlx-sqlite-migrator

use thiserror::Error;

use crate::runner::AppliedMigration;

/// Errors that may occur while validating or running migrations
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the connection manager (pool, retry, storage)
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlite_conn_mgr::Error),

   /// Migration versions start at 1.
   #[error("migration `{name}` has invalid version {version}; versions start at 1")]
   InvalidVersion { version: i64, name: String },

   #[error("migration version {0} is declared more than once")]
   DuplicateVersion(i64),

   #[error("migration name `{0}` is declared more than once")]
   DuplicateName(String),

   /// A migration with no non-blank statements.
   #[error("migration {version} (`{name}`) has no statements")]
   EmptyMigration { version: i64, name: String },

   /// A declared migration at or below the ledger's current version was never
   /// recorded, so running forward would skip it.
   #[error("migration {version} was never applied but the ledger is already at version {current}")]
   VersionGap { version: i64, current: i64 },

   /// The ledger records a version no declared migration has.
   #[error("ledger records version {version} (`{name}`) which is not a declared migration")]
   UnknownAppliedVersion { version: i64, name: String },

   /// The ledger and the declared migration disagree on the name of a version.
   #[error("ledger records version {version} as `{recorded}` but it is declared as `{declared}`")]
   LedgerMismatch {
      version: i64,
      recorded: String,
      declared: String,
   },

   /// Ledger table names are interpolated into SQL and must be plain identifiers.
   #[error("invalid ledger table name `{0}`")]
   InvalidLedgerTable(String),

   #[error("malformed ledger row: {0}")]
   InvalidLedgerRow(String),

   /// A migration failed and was rolled back. Migrations before it stay
   /// committed and are listed in `applied`.
   #[error(
      "migration {version} (`{name}`) failed after {} migration(s) applied, ledger at version {last_applied_version}: {source}",
      .applied.len()
   )]
   MigrationFailed {
      version: i64,
      name: String,
      applied: Vec<AppliedMigration>,
      last_applied_version: i64,
      #[source]
      source: Box<sqlx_sqlite_conn_mgr::Error>,
   },
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// Connection manager errors keep their own codes.
   pub fn error_code(&self) -> String {
      match self {
         Error::ConnectionManager(e) => e.error_code(),
         Error::InvalidVersion { .. } => "INVALID_VERSION".to_string(),
         Error::DuplicateVersion(_) => "DUPLICATE_VERSION".to_string(),
         Error::DuplicateName(_) => "DUPLICATE_NAME".to_string(),
         Error::EmptyMigration { .. } => "EMPTY_MIGRATION".to_string(),
         Error::VersionGap { .. } => "VERSION_GAP".to_string(),
         Error::UnknownAppliedVersion { .. } => "UNKNOWN_APPLIED_VERSION".to_string(),
         Error::LedgerMismatch { .. } => "LEDGER_MISMATCH".to_string(),
         Error::InvalidLedgerTable(_) => "INVALID_LEDGER_TABLE".to_string(),
         Error::InvalidLedgerRow(_) => "INVALID_LEDGER_ROW".to_string(),
         Error::MigrationFailed { .. } => "MIGRATION_FAILED".to_string(),
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

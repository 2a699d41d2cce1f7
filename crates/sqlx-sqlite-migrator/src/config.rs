//! Configuration for the migration runner

use serde::{Deserialize, Serialize};

/// Configuration for [`Migrator`](crate::Migrator)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_migrator::MigratorConfig;
///
/// let config = MigratorConfig {
///     ledger_table: "app_migrations".to_string(),
/// };
/// assert_ne!(config, MigratorConfig::default());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
   /// Table that records applied migrations
   ///
   /// Must be a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
   ///
   /// Default: `_schema_migrations`
   pub ledger_table: String,
}

impl Default for MigratorConfig {
   fn default() -> Self {
      Self {
         ledger_table: "_schema_migrations".to_string(),
      }
   }
}

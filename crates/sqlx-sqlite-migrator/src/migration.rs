//! Migration descriptors

use std::collections::HashSet;

use crate::{Error, Result};

/// One versioned schema change.
///
/// A migration is one or more SQL statements applied together in a single
/// transaction, plus the cache scopes the change affects.
///
/// ```
/// use sqlx_sqlite_migrator::Migration;
///
/// let migration = Migration::new(2, "add_item_tags", "ALTER TABLE items ADD COLUMN tags TEXT")
///    .with_statement("CREATE INDEX idx_items_tags ON items(tags)")
///    .touches("items");
///
/// assert_eq!(migration.statements().len(), 2);
/// assert_eq!(migration.scopes(), ["items"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
   version: i64,
   name: String,
   statements: Vec<String>,
   scopes: Vec<String>,
}

impl Migration {
   pub fn new(version: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
      Self {
         version,
         name: name.into(),
         statements: vec![sql.into()],
         scopes: Vec::new(),
      }
   }

   /// Appends another statement, run after the ones already added.
   pub fn with_statement(mut self, sql: impl Into<String>) -> Self {
      self.statements.push(sql.into());
      self
   }

   /// Declares a cache scope this migration changes.
   ///
   /// A migration that declares no scopes is treated as touching everything.
   pub fn touches(mut self, scope: impl Into<String>) -> Self {
      self.scopes.push(scope.into());
      self
   }

   pub fn version(&self) -> i64 {
      self.version
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn statements(&self) -> &[String] {
      &self.statements
   }

   pub fn scopes(&self) -> &[String] {
      &self.scopes
   }
}

/// Checks a migration set and returns it sorted by version.
///
/// Nothing here touches storage, so a bad set fails before any connection is
/// opened.
pub(crate) fn validate(mut migrations: Vec<Migration>) -> Result<Vec<Migration>> {
   let mut names = HashSet::with_capacity(migrations.len());

   for migration in &migrations {
      if migration.version < 1 {
         return Err(Error::InvalidVersion {
            version: migration.version,
            name: migration.name.clone(),
         });
      }

      if migration.statements.iter().all(|sql| sql.trim().is_empty()) {
         return Err(Error::EmptyMigration {
            version: migration.version,
            name: migration.name.clone(),
         });
      }

      if !names.insert(migration.name.as_str()) {
         return Err(Error::DuplicateName(migration.name.clone()));
      }
   }

   migrations.sort_by_key(Migration::version);

   if let Some(pair) = migrations
      .windows(2)
      .find(|pair| pair[0].version == pair[1].version)
   {
      return Err(Error::DuplicateVersion(pair[0].version));
   }

   Ok(migrations)
}

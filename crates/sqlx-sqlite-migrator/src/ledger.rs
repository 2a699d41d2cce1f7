//! The durable record of applied migrations

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;
use sqlx_sqlite_conn_mgr::{Row, Statement, StorageHandle, fetch_optional};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::migration::Migration;
use crate::{Error, Result};

/// One recorded migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
   pub version: i64,
   pub name: String,
   pub applied_at: OffsetDateTime,
}

/// Reads and writes the ledger table.
///
/// The table name is checked once here; every statement built afterwards can
/// interpolate it safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
   table: String,
}

fn identifier_regex() -> &'static Regex {
   static RE: OnceLock<Regex> = OnceLock::new();
   RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid regex"))
}

impl Ledger {
   pub fn new(table: impl Into<String>) -> Result<Self> {
      let table = table.into();
      if !identifier_regex().is_match(&table) {
         return Err(Error::InvalidLedgerTable(table));
      }
      Ok(Self { table })
   }

   pub fn table(&self) -> &str {
      &self.table
   }

   /// Creates the ledger table if it does not exist yet.
   pub async fn ensure<H: StorageHandle>(&self, handle: &mut H) -> Result<()> {
      let sql = format!(
         "CREATE TABLE IF NOT EXISTS {} (\
            version INTEGER PRIMARY KEY, \
            name TEXT NOT NULL UNIQUE, \
            applied_at TEXT NOT NULL\
         )",
         self.table
      );
      handle.execute(&sql, Vec::new()).await?;
      Ok(())
   }

   /// Highest recorded version, or 0 when nothing has been applied.
   pub async fn current_version<H: StorageHandle>(&self, handle: &mut H) -> Result<i64> {
      let sql = format!(
         "SELECT COALESCE(MAX(version), 0) AS version FROM {}",
         self.table
      );
      let row = fetch_optional(handle, &sql, Vec::new())
         .await?
         .ok_or_else(|| Error::InvalidLedgerRow("MAX(version) returned no row".to_string()))?;
      integer_column(&row, "version")
   }

   /// Every recorded migration, oldest version first.
   pub async fn entries<H: StorageHandle>(&self, handle: &mut H) -> Result<Vec<LedgerEntry>> {
      let sql = format!(
         "SELECT version, name, applied_at FROM {} ORDER BY version",
         self.table
      );
      let rows = handle.query(&sql, Vec::new()).await?;
      rows.iter().map(parse_entry).collect()
   }

   /// Whether `version` is already recorded.
   pub async fn contains<H: StorageHandle>(&self, handle: &mut H, version: i64) -> Result<bool> {
      let sql = format!("SELECT 1 AS present FROM {} WHERE version = $1", self.table);
      let row = fetch_optional(handle, &sql, vec![JsonValue::from(version)]).await?;
      Ok(row.is_some())
   }

   /// The INSERT that records `migration` as applied at `applied_at`.
   pub fn record(&self, migration: &Migration, applied_at: OffsetDateTime) -> Result<Statement> {
      let applied_at = applied_at
         .format(&Rfc3339)
         .map_err(|e| Error::InvalidLedgerRow(format!("cannot format applied_at: {e}")))?;

      Ok(Statement::new(format!(
         "INSERT INTO {} (version, name, applied_at) VALUES ($1, $2, $3)",
         self.table
      ))
      .bind(migration.version())
      .bind(migration.name())
      .bind(applied_at))
   }
}

fn integer_column(row: &Row, column: &str) -> Result<i64> {
   row.get(column)
      .and_then(JsonValue::as_i64)
      .ok_or_else(|| Error::InvalidLedgerRow(format!("`{column}` is not an integer")))
}

fn parse_entry(row: &Row) -> Result<LedgerEntry> {
   let version = integer_column(row, "version")?;

   let name = row
      .get("name")
      .and_then(JsonValue::as_str)
      .ok_or_else(|| Error::InvalidLedgerRow(format!("version {version} has no name")))?
      .to_string();

   let applied_at = row
      .get("applied_at")
      .and_then(JsonValue::as_str)
      .ok_or_else(|| Error::InvalidLedgerRow(format!("version {version} has no applied_at")))?;
   let applied_at = OffsetDateTime::parse(applied_at, &Rfc3339)
      .map_err(|e| Error::InvalidLedgerRow(format!("version {version} applied_at: {e}")))?;

   Ok(LedgerEntry {
      version,
      name,
      applied_at,
   })
}

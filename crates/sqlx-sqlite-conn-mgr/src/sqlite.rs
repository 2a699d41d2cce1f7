//! SQLx-backed SQLite handle and connector

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Row as _, Sqlite, TypeInfo, Value, ValueRef};
use tracing::trace;

use crate::handle::{Connector, Row, StorageHandle, WriteResult};
use crate::{Error, Result};

/// Opens connections to one SQLite database file.
///
/// The file is created if it does not exist. [`SqliteConnector::in_memory`]
/// gives every connection its own private in-memory database, which is only
/// useful with a single-connection pool.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
   options: SqliteConnectOptions,
   path: Option<PathBuf>,
}

impl SqliteConnector {
   pub fn new(path: impl AsRef<Path>) -> Self {
      let path = path.as_ref().to_path_buf();
      let options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true);

      Self {
         options,
         path: Some(path),
      }
   }

   pub fn in_memory() -> Self {
      Self {
         options: SqliteConnectOptions::new().in_memory(true),
         path: None,
      }
   }

   /// Uses caller-supplied SQLx options as-is.
   pub fn with_options(options: SqliteConnectOptions) -> Self {
      Self {
         options,
         path: None,
      }
   }

   /// Database file path, when connecting to a file.
   pub fn path(&self) -> Option<&Path> {
      self.path.as_deref()
   }
}

impl Connector for SqliteConnector {
   type Handle = SqliteHandle;

   async fn connect(&self) -> Result<SqliteHandle> {
      let conn = self.options.connect().await?;
      trace!(path = ?self.path, "Opened SQLite connection");
      Ok(SqliteHandle {
         conn,
         in_transaction: false,
      })
   }
}

/// A single SQLx SQLite connection.
///
/// Transactions must go through [`StorageHandle::begin`] and friends; a
/// `BEGIN` sent through `execute` is not tracked.
#[derive(Debug)]
pub struct SqliteHandle {
   conn: SqliteConnection,
   in_transaction: bool,
}

impl SqliteHandle {
   /// The underlying SQLx connection, for queries outside the handle API.
   pub fn connection(&mut self) -> &mut SqliteConnection {
      &mut self.conn
   }
}

impl StorageHandle for SqliteHandle {
   async fn execute(&mut self, statement: &str, params: Vec<JsonValue>) -> Result<WriteResult> {
      let mut q = sqlx::query(statement);
      for value in params {
         q = bind_value(q, value);
      }

      let result = q.execute(&mut self.conn).await?;
      Ok(WriteResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }

   async fn query(&mut self, statement: &str, params: Vec<JsonValue>) -> Result<Vec<Row>> {
      let mut q = sqlx::query(statement);
      for value in params {
         q = bind_value(q, value);
      }

      let rows = q.fetch_all(&mut self.conn).await?;
      decode_rows(rows)
   }

   async fn begin(&mut self) -> Result<()> {
      // Set before the await so a cancelled BEGIN still counts as open
      let was_open = std::mem::replace(&mut self.in_transaction, true);

      // Take the write lock up front so contention surfaces here, not mid-transaction
      if let Err(e) = sqlx::query("BEGIN IMMEDIATE")
         .execute(&mut self.conn)
         .await
      {
         self.in_transaction = was_open;
         return Err(e.into());
      }
      Ok(())
   }

   async fn commit(&mut self) -> Result<()> {
      sqlx::query("COMMIT").execute(&mut self.conn).await?;
      self.in_transaction = false;
      Ok(())
   }

   async fn rollback(&mut self) -> Result<()> {
      sqlx::query("ROLLBACK").execute(&mut self.conn).await?;
      self.in_transaction = false;
      Ok(())
   }

   fn in_transaction(&self) -> bool {
      self.in_transaction
   }

   async fn configure_pragma(&mut self, name: &str, value: &str) -> Result<()> {
      // Some pragmas (journal_mode) answer with a row, so fetch rather than execute
      sqlx::query(&format!("PRAGMA {name} = {value}"))
         .fetch_all(&mut self.conn)
         .await?;
      Ok(())
   }

   async fn close(self) -> Result<()> {
      self.conn.close().await?;
      Ok(())
   }
}

/// Helper function to bind a JSON value to a SQLx query
pub fn bind_value<'a>(
   query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
   value: JsonValue,
) -> sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // as_i64 failed, so this is above i64::MAX; f64 is the only fit left
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Decode SQLite rows into ordered JSON maps
pub fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>> {
   let mut values = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = Row::default();
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i)?;
         value.insert(column.name().to_string(), to_json(v)?);
      }
      values.push(value);
   }
   Ok(values)
}

/// Map one SQLite value to JSON using its storage class.
fn to_json(value: sqlx::sqlite::SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let owned = ValueRef::to_owned(&value);
   let type_name = owned.type_info().name().to_string();
   let decoded = match type_name.as_str() {
      "INTEGER" | "BOOLEAN" => owned.try_decode::<i64>().map(JsonValue::from),
      "REAL" => owned.try_decode::<f64>().map(|real| {
         serde_json::Number::from_f64(real)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
      }),
      "TEXT" | "DATETIME" | "DATE" | "TIME" => owned.try_decode::<String>().map(JsonValue::String),
      "BLOB" => owned
         .try_decode::<Vec<u8>>()
         .map(|bytes| JsonValue::String(BASE64.encode(bytes))),
      _ => return Err(Error::UnsupportedDatatype(type_name)),
   };

   decoded.map_err(Error::Sqlx)
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::handle::{Statement, fetch_optional};
   use crate::transaction::execute_transaction;
   use serde_json::json;
   use tempfile::TempDir;

   async fn create_test_handle() -> (SqliteHandle, TempDir) {
      let temp_dir = TempDir::new().expect("Failed to create temp directory");
      let connector = SqliteConnector::new(temp_dir.path().join("test.db"));
      let handle = connector
         .connect()
         .await
         .expect("Failed to connect to test database");

      (handle, temp_dir)
   }

   #[tokio::test]
   async fn test_execute_and_write_result() {
      let (mut db, _temp) = create_test_handle().await;

      // DDL returns 0 rows affected
      let result = db
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", vec![])
         .await
         .unwrap();

      assert_eq!(result.rows_affected, 0);

      // INSERT returns rows_affected and last_insert_id
      let result = db
         .execute("INSERT INTO t (name) VALUES ($1)", vec![json!("Alice")])
         .await
         .unwrap();

      assert_eq!((result.rows_affected, result.last_insert_id), (1, 1));

      let result = db
         .execute("INSERT INTO t (name) VALUES ($1)", vec![json!("Bob")])
         .await
         .unwrap();

      assert_eq!((result.rows_affected, result.last_insert_id), (1, 2));

      // UPDATE affects multiple rows
      let result = db
         .execute("UPDATE t SET name = 'X' WHERE id > 0", vec![])
         .await
         .unwrap();

      assert_eq!(result.rows_affected, 2);

      db.close().await.unwrap();
   }

   #[tokio::test]
   async fn test_query_and_fetch_optional() {
      let (mut db, _temp) = create_test_handle().await;
      db.execute(
         "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, active INT)",
         vec![],
      )
      .await
      .unwrap();

      assert!(db.query("SELECT * FROM t", vec![]).await.unwrap().is_empty());

      db.execute(
         "INSERT INTO t (name, active) VALUES ($1,$2), ($3,$4), ($5,$6)",
         vec![
            json!("Alice"),
            json!(1),
            json!("Bob"),
            json!(0),
            json!("Charlie"),
            json!(1),
         ],
      )
      .await
      .unwrap();

      let rows = db
         .query("SELECT name FROM t WHERE active = $1", vec![json!(1)])
         .await
         .unwrap();
      assert_eq!(rows.len(), 2);

      let row = fetch_optional(&mut db, "SELECT * FROM t WHERE id = $1", vec![json!(2)])
         .await
         .unwrap()
         .unwrap();
      assert_eq!(row.get("name"), Some(&json!("Bob")));

      assert!(
         fetch_optional(&mut db, "SELECT * FROM t WHERE id = 99", vec![])
            .await
            .unwrap()
            .is_none()
      );

      let err = fetch_optional(&mut db, "SELECT * FROM t", vec![])
         .await
         .unwrap_err();
      assert!(matches!(err, Error::MultipleRowsReturned(3)));
   }

   #[tokio::test]
   async fn test_type_binding_and_decoding() {
      let (mut db, _temp) = create_test_handle().await;
      db.execute(
         "CREATE TABLE t (id INTEGER PRIMARY KEY, txt TEXT, num REAL, big INTEGER, flag BOOLEAN, data BLOB)",
         vec![],
      )
      .await
      .unwrap();

      let large_int: i64 = 9_007_199_254_740_992; // 2^53

      db.execute("INSERT INTO t (txt) VALUES ($1)", vec![JsonValue::Null])
         .await
         .unwrap();
      db.execute(
         "INSERT INTO t (txt, num) VALUES ($1, $2)",
         vec![json!("hello"), json!(1.23456)],
      )
      .await
      .unwrap();
      db.execute("INSERT INTO t (big) VALUES ($1)", vec![json!(large_int)])
         .await
         .unwrap();
      db.execute("INSERT INTO t (flag) VALUES ($1)", vec![json!(true)])
         .await
         .unwrap();
      // BLOB ("Hello" in hex)
      db.execute("INSERT INTO t (data) VALUES (X'48656C6C6F')", vec![])
         .await
         .unwrap();

      let rows = db.query("SELECT * FROM t ORDER BY id", vec![]).await.unwrap();

      assert_eq!(rows[0].get("txt"), Some(&JsonValue::Null));

      let num = rows[1].get("num").unwrap().as_f64().unwrap();
      assert!((num - 1.23456).abs() < 0.0001);

      assert_eq!(rows[2].get("big"), Some(&json!(large_int)));

      // Boolean stored as integer
      assert_eq!(rows[3].get("flag"), Some(&json!(1)));

      // BLOB as base64
      assert_eq!(rows[4].get("data").unwrap().as_str(), Some("SGVsbG8="));
   }

   #[tokio::test]
   async fn test_column_order_preserved() {
      let (mut db, _temp) = create_test_handle().await;
      db.execute("CREATE TABLE t (z TEXT, a TEXT, m TEXT)", vec![])
         .await
         .unwrap();
      db.execute(
         "INSERT INTO t VALUES ($1, $2, $3)",
         vec![json!("z"), json!("a"), json!("m")],
      )
      .await
      .unwrap();

      let rows = db.query("SELECT z, a, m FROM t", vec![]).await.unwrap();

      let keys: Vec<&String> = rows[0].keys().collect();
      assert_eq!(keys, vec!["z", "a", "m"]);
   }

   #[tokio::test]
   async fn test_transactions() {
      let (mut db, _temp) = create_test_handle().await;
      db.execute(
         "CREATE TABLE t (id INTEGER PRIMARY KEY, val INTEGER NOT NULL)",
         vec![],
      )
      .await
      .unwrap();
      db.execute("INSERT INTO t (id, val) VALUES (1, 100), (2, 50)", vec![])
         .await
         .unwrap();

      // Successful transaction commits
      let results = execute_transaction(
         &mut db,
         &[
            Statement::new("UPDATE t SET val = val - 30 WHERE id = 1"),
            Statement::new("UPDATE t SET val = val + 30 WHERE id = 2"),
         ],
      )
      .await
      .unwrap();
      assert_eq!(results.len(), 2);

      let rows = db
         .query("SELECT val FROM t ORDER BY id", vec![])
         .await
         .unwrap();
      assert_eq!(rows[0].get("val"), Some(&json!(70)));
      assert_eq!(rows[1].get("val"), Some(&json!(80)));

      // Failed transaction rolls back (NULL violates NOT NULL)
      let err = execute_transaction(
         &mut db,
         &[
            Statement::new("UPDATE t SET val = 999 WHERE id = 1"),
            Statement::new("INSERT INTO t (id, val) VALUES (3, NULL)"),
         ],
      )
      .await;
      assert!(err.is_err());

      let row = fetch_optional(&mut db, "SELECT val FROM t WHERE id = 1", vec![])
         .await
         .unwrap()
         .unwrap();
      assert_eq!(row.get("val"), Some(&json!(70)));
   }

   #[tokio::test]
   async fn test_savepoint_rolls_back_inner_work_only() {
      let (mut db, _temp) = create_test_handle().await;
      db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", vec![])
         .await
         .unwrap();

      db.begin().await.unwrap();
      db.execute("INSERT INTO t (id) VALUES (1)", vec![])
         .await
         .unwrap();
      db.savepoint("inner").await.unwrap();
      db.execute("INSERT INTO t (id) VALUES (2)", vec![])
         .await
         .unwrap();
      db.rollback_to_savepoint("inner").await.unwrap();
      db.release_savepoint("inner").await.unwrap();
      db.commit().await.unwrap();

      let rows = db.query("SELECT id FROM t", vec![]).await.unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(rows[0].get("id"), Some(&json!(1)));
   }

   #[tokio::test]
   async fn test_configure_pragma() {
      let (mut db, _temp) = create_test_handle().await;
      db.configure_pragma("journal_mode", "WAL").await.unwrap();
      db.configure_pragma("foreign_keys", "ON").await.unwrap();

      let mode = fetch_optional(&mut db, "PRAGMA journal_mode", vec![])
         .await
         .unwrap()
         .unwrap();
      assert_eq!(mode.get("journal_mode"), Some(&json!("wal")));

      let fk = fetch_optional(&mut db, "PRAGMA foreign_keys", vec![])
         .await
         .unwrap()
         .unwrap();
      assert_eq!(fk.get("foreign_keys"), Some(&json!(1)));
   }

   #[tokio::test]
   async fn test_lock_contention_is_busy() {
      let temp_dir = TempDir::new().unwrap();
      let options = SqliteConnectOptions::new()
         .filename(temp_dir.path().join("busy.db"))
         .create_if_missing(true)
         .busy_timeout(std::time::Duration::ZERO);
      let connector = SqliteConnector::with_options(options);

      let mut first = connector.connect().await.unwrap();
      let mut second = connector.connect().await.unwrap();
      first
         .execute("CREATE TABLE t (id INTEGER)", vec![])
         .await
         .unwrap();

      first.begin().await.unwrap();
      let err = second.begin().await.unwrap_err();
      assert!(err.is_busy(), "expected busy, got {err}");
      assert!(err.error_code().starts_with("SQLITE_"));

      first.rollback().await.unwrap();
      second.begin().await.unwrap();
      second.rollback().await.unwrap();
   }
}

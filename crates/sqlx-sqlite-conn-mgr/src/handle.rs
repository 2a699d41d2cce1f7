//! The narrow interface the pool needs from a physical connection

use std::future::Future;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::Result;

/// A decoded row: column name to value, in select-list order.
pub type Row = IndexMap<String, JsonValue>;

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

/// Statement with query text and bind values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
   pub query: String,
   #[serde(default)]
   pub values: Vec<JsonValue>,
}

impl Statement {
   pub fn new(query: impl Into<String>) -> Self {
      Self {
         query: query.into(),
         values: Vec::new(),
      }
   }

   /// Appends a bind value.
   pub fn bind(mut self, value: impl Into<JsonValue>) -> Self {
      self.values.push(value.into());
      self
   }
}

impl From<&str> for Statement {
   fn from(query: &str) -> Self {
      Statement::new(query)
   }
}

impl From<String> for Statement {
   fn from(query: String) -> Self {
      Statement::new(query)
   }
}

/// One physical connection to the transactional store.
///
/// The pool only ever talks to connections through this trait, which keeps
/// the storage engine opaque. [`SqliteHandle`](crate::SqliteHandle) is the
/// SQLx-backed implementation.
pub trait StorageHandle: Send + 'static {
   /// Runs a statement that does not return rows.
   fn execute(
      &mut self,
      statement: &str,
      params: Vec<JsonValue>,
   ) -> impl Future<Output = Result<WriteResult>> + Send;

   /// Runs a statement and decodes every returned row.
   fn query(
      &mut self,
      statement: &str,
      params: Vec<JsonValue>,
   ) -> impl Future<Output = Result<Vec<Row>>> + Send;

   /// Opens a write transaction.
   fn begin(&mut self) -> impl Future<Output = Result<()>> + Send;

   fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

   fn rollback(&mut self) -> impl Future<Output = Result<()>> + Send;

   /// Whether a transaction opened with [`begin`](Self::begin) may still be
   /// open.
   ///
   /// Must stay `true` from the moment `begin` starts until `commit` or
   /// `rollback` has succeeded, including when one of those calls was
   /// cancelled part way. The pool discards connections released in this
   /// state instead of reusing them.
   fn in_transaction(&self) -> bool;

   /// Sets a connection-level pragma such as `foreign_keys` or `journal_mode`.
   fn configure_pragma(
      &mut self,
      name: &str,
      value: &str,
   ) -> impl Future<Output = Result<()>> + Send;

   /// Closes the connection gracefully.
   fn close(self) -> impl Future<Output = Result<()>> + Send
   where
      Self: Sized;

   fn savepoint(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send {
      let sql = format!("SAVEPOINT {name}");
      async move { self.execute(&sql, Vec::new()).await.map(|_| ()) }
   }

   fn release_savepoint(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send {
      let sql = format!("RELEASE SAVEPOINT {name}");
      async move { self.execute(&sql, Vec::new()).await.map(|_| ()) }
   }

   fn rollback_to_savepoint(&mut self, name: &str) -> impl Future<Output = Result<()>> + Send {
      let sql = format!("ROLLBACK TO SAVEPOINT {name}");
      async move { self.execute(&sql, Vec::new()).await.map(|_| ()) }
   }
}

/// Opens new [`StorageHandle`]s on demand for the pool.
pub trait Connector: Send + Sync + 'static {
   type Handle: StorageHandle;

   fn connect(&self) -> impl Future<Output = Result<Self::Handle>> + Send;
}

/// Fetches at most one row, failing if the statement returns more.
pub async fn fetch_optional<H: StorageHandle>(
   handle: &mut H,
   statement: &str,
   params: Vec<JsonValue>,
) -> Result<Option<Row>> {
   let mut rows = handle.query(statement, params).await?;
   match rows.len() {
      0 => Ok(None),
      1 => Ok(rows.pop()),
      count => Err(crate::Error::MultipleRowsReturned(count)),
   }
}

//! The coordinator: one explicitly constructed owner of pool, retry policy,
//! migration runner and query cache

use std::collections::BTreeSet;
use std::fs::create_dir_all;
use std::path::Path;
use std::sync::Arc;

use sqlx_sqlite_conn_mgr::{
   BoxFuture, Clock, Connector, Pool, PooledHandle, RetryExecutor, Row, SqliteConnector,
   Statement, StorageHandle, SystemClock, WriteResult,
};
use sqlx_sqlite_migrator::{AppliedMigration, Migration, MigrationReport, Migrator};
use tracing::debug;

use crate::cache::{Fingerprint, QueryCache};
use crate::config::CoordinatorConfig;
use crate::{Error, Result};

/// Routes reads through the cache and writes through the pool, retrying both
/// on lock contention, and keeps the cache consistent with writes and
/// migrations.
///
/// Every read names a *scope* (typically the table it reads). A write to a
/// scope drops that scope's cached reads; a migration drops the scopes it
/// declared, or the whole cache if it declared none.
pub struct Coordinator<C: Connector> {
   pool: Pool<C>,
   retry: RetryExecutor,
   migrator: Migrator<C>,
   cache: QueryCache<Vec<Row>>,
}

impl<C: Connector> std::fmt::Debug for Coordinator<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Coordinator")
         .field("pool", &self.pool.status())
         .field("retry", &self.retry)
         .field("migrator", &self.migrator)
         .field("cache", &self.cache)
         .finish()
   }
}

impl Coordinator<SqliteConnector> {
   /// Coordinator for the SQLite database at `path`, created if missing.
   ///
   /// Parent directories are created as needed. No connection is opened and
   /// no migration runs until first use.
   pub fn open(
      path: impl AsRef<Path>,
      migrations: Vec<Migration>,
      config: CoordinatorConfig,
   ) -> Result<Self> {
      let path = path.as_ref();
      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         create_dir_all(parent).map_err(sqlx_sqlite_conn_mgr::Error::from)?;
      }

      Self::new(SqliteConnector::new(path), migrations, config)
   }
}

impl<C: Connector> Coordinator<C> {
   pub fn new(connector: C, migrations: Vec<Migration>, config: CoordinatorConfig) -> Result<Self> {
      Self::with_clock(connector, migrations, config, Arc::new(SystemClock))
   }

   /// Like [`new`](Self::new), with `clock` driving retry backoff and cache
   /// expiry.
   pub fn with_clock(
      connector: C,
      migrations: Vec<Migration>,
      config: CoordinatorConfig,
      clock: Arc<dyn Clock>,
   ) -> Result<Self> {
      let pool = Pool::new(connector, config.pool);
      let retry = RetryExecutor::with_clock(config.retry, Arc::clone(&clock));
      let migrator = Migrator::new(pool.clone(), retry.clone(), migrations, &config.migrator)?;
      let cache = QueryCache::with_clock(config.cache, clock);

      Ok(Self {
         pool,
         retry,
         migrator,
         cache,
      })
   }

   pub fn pool(&self) -> &Pool<C> {
      &self.pool
   }

   pub fn retry(&self) -> &RetryExecutor {
      &self.retry
   }

   pub fn migrator(&self) -> &Migrator<C> {
      &self.migrator
   }

   pub fn cache(&self) -> &QueryCache<Vec<Row>> {
      &self.cache
   }

   /// Cached read.
   ///
   /// Returns the cached rows for `(scope, fingerprint)` if fresh. Otherwise
   /// runs `executor` on a pooled connection (retried while busy) and caches
   /// its rows for the default TTL.
   pub async fn query<F>(&self, scope: &str, fingerprint: &Fingerprint, executor: F) -> Result<Vec<Row>>
   where
      F: for<'h> FnMut(&'h mut C::Handle) -> BoxFuture<'h, sqlx_sqlite_conn_mgr::Result<Vec<Row>>>,
   {
      if let Some(rows) = self.cache.get(scope, fingerprint) {
         return Ok(rows);
      }

      let rows = {
         let mut conn = self.pool.acquire().await?;
         let operation = format!("read {scope}");
         self.retry.run_on(&mut *conn, &operation, executor).await?
      };

      self.cache.insert(scope, fingerprint.clone(), rows.clone());
      Ok(rows)
   }

   /// Cached read of a single statement, fingerprinted by its text and
   /// bind values.
   pub async fn fetch_all(&self, scope: &str, statement: impl Into<Statement>) -> Result<Vec<Row>> {
      let statement = statement.into();
      let fingerprint = Fingerprint::of(&statement.query, &statement.values);

      self
         .query(scope, &fingerprint, |handle| {
            let statement = statement.clone();
            Box::pin(async move { handle.query(&statement.query, statement.values).await })
         })
         .await
   }

   /// Write through a pooled connection, retried while busy.
   ///
   /// `scope` is invalidated once the executor has run, whether it
   /// succeeded or not.
   pub async fn write<T, F>(&self, scope: &str, executor: F) -> Result<T>
   where
      F: for<'h> FnMut(&'h mut C::Handle) -> BoxFuture<'h, sqlx_sqlite_conn_mgr::Result<T>>,
   {
      let result = {
         let mut conn = self.pool.acquire().await?;
         let operation = format!("write {scope}");
         self.retry.run_on(&mut *conn, &operation, executor).await
      };

      self.cache.invalidate_scope(scope);
      Ok(result?)
   }

   /// Runs one write statement.
   pub async fn execute(&self, scope: &str, statement: impl Into<Statement>) -> Result<WriteResult> {
      let statement = statement.into();

      self
         .write(scope, |handle| {
            let statement = statement.clone();
            Box::pin(async move { handle.execute(&statement.query, statement.values).await })
         })
         .await
   }

   /// Runs `statements` in one transaction, retrying the whole transaction
   /// while busy.
   pub async fn execute_transaction(
      &self,
      scope: &str,
      statements: Vec<Statement>,
   ) -> Result<Vec<WriteResult>> {
      let statements: Arc<[Statement]> = statements.into();

      self
         .write(scope, |handle| {
            let statements = Arc::clone(&statements);
            Box::pin(async move { sqlx_sqlite_conn_mgr::execute_transaction(handle, &statements).await })
         })
         .await
   }

   /// A pooled connection for work the other methods do not cover.
   ///
   /// The cache knows nothing about writes made through it; call
   /// [`invalidate`](Self::invalidate) afterwards.
   pub async fn acquire(&self) -> Result<PooledHandle<C>> {
      Ok(self.pool.acquire().await?)
   }

   /// Drops every cached read of `scope`, returning how many were removed.
   pub fn invalidate(&self, scope: &str) -> usize {
      self.cache.invalidate_scope(scope)
   }

   /// Applies pending migrations up to `target`, then drops the cache scopes
   /// they touched.
   ///
   /// Scopes are dropped for the migrations that committed even when a later
   /// one fails.
   pub async fn run_migrations(&self, target: i64) -> Result<MigrationReport> {
      let outcome = self.migrator.migrate(target).await;
      self.after_migrations(outcome)
   }

   /// Applies every declared migration not yet recorded.
   pub async fn run_pending_migrations(&self) -> Result<MigrationReport> {
      let outcome = self.migrator.migrate_to_latest().await;
      self.after_migrations(outcome)
   }

   fn after_migrations(
      &self,
      outcome: sqlx_sqlite_migrator::Result<MigrationReport>,
   ) -> Result<MigrationReport> {
      match &outcome {
         Ok(report) => self.invalidate_migrated(&report.applied),
         Err(sqlx_sqlite_migrator::Error::MigrationFailed { applied, .. }) => {
            self.invalidate_migrated(applied)
         }
         Err(_) => {}
      }
      Ok(outcome?)
   }

   fn invalidate_migrated(&self, applied: &[AppliedMigration]) {
      if applied.is_empty() {
         return;
      }

      if applied.iter().any(|migration| migration.scopes.is_empty()) {
         let removed = self.cache.clear();
         debug!(removed, "Migration declared no scopes, cleared the whole cache");
         return;
      }

      let scopes: BTreeSet<&str> = applied
         .iter()
         .flat_map(|migration| migration.scopes.iter().map(String::as_str))
         .collect();
      for scope in scopes {
         self.cache.invalidate_scope(scope);
      }
   }

   /// Closes every pooled connection, fails blocked acquirers and empties
   /// the cache.
   ///
   /// The cache is emptied even if closing a connection fails; the first
   /// close error is returned.
   pub async fn shutdown(&self) -> Result<()> {
      let closed = self.pool.shutdown().await;
      self.cache.clear();
      Ok(closed?)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx_sqlite_conn_mgr::ManualClock;
   use std::sync::atomic::{AtomicU32, Ordering};

   /// In-memory store: `query` returns one row per recorded write.
   struct FakeHandle {
      writes: Arc<AtomicU32>,
      reads: Arc<AtomicU32>,
   }

   impl StorageHandle for FakeHandle {
      async fn execute(
         &mut self,
         _statement: &str,
         _params: Vec<serde_json::Value>,
      ) -> sqlx_sqlite_conn_mgr::Result<WriteResult> {
         let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
         Ok(WriteResult {
            rows_affected: 1,
            last_insert_id: n as i64,
         })
      }

      async fn query(
         &mut self,
         _statement: &str,
         _params: Vec<serde_json::Value>,
      ) -> sqlx_sqlite_conn_mgr::Result<Vec<Row>> {
         self.reads.fetch_add(1, Ordering::SeqCst);
         let count = self.writes.load(Ordering::SeqCst);
         Ok((0..count)
            .map(|i| Row::from([("n".to_string(), serde_json::json!(i))]))
            .collect())
      }

      async fn begin(&mut self) -> sqlx_sqlite_conn_mgr::Result<()> {
         Ok(())
      }

      async fn commit(&mut self) -> sqlx_sqlite_conn_mgr::Result<()> {
         Ok(())
      }

      async fn rollback(&mut self) -> sqlx_sqlite_conn_mgr::Result<()> {
         Ok(())
      }

      // Writes apply immediately, so there is never anything to roll back
      fn in_transaction(&self) -> bool {
         false
      }

      async fn configure_pragma(&mut self, _name: &str, _value: &str) -> sqlx_sqlite_conn_mgr::Result<()> {
         Ok(())
      }

      async fn close(self) -> sqlx_sqlite_conn_mgr::Result<()> {
         Ok(())
      }
   }

   #[derive(Default)]
   struct FakeConnector {
      writes: Arc<AtomicU32>,
      reads: Arc<AtomicU32>,
   }

   impl Connector for FakeConnector {
      type Handle = FakeHandle;

      async fn connect(&self) -> sqlx_sqlite_conn_mgr::Result<FakeHandle> {
         Ok(FakeHandle {
            writes: Arc::clone(&self.writes),
            reads: Arc::clone(&self.reads),
         })
      }
   }

   fn coordinator() -> (Coordinator<FakeConnector>, Arc<AtomicU32>, ManualClock) {
      let connector = FakeConnector::default();
      let reads = Arc::clone(&connector.reads);
      let clock = ManualClock::new();
      let coordinator = Coordinator::with_clock(
         connector,
         Vec::new(),
         CoordinatorConfig::default(),
         Arc::new(clock.clone()),
      )
      .unwrap();
      (coordinator, reads, clock)
   }

   #[tokio::test]
   async fn test_repeated_read_is_served_from_cache() {
      let (coordinator, reads, _clock) = coordinator();

      let first = coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();
      let second = coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();

      assert_eq!(first, second);
      assert_eq!(reads.load(Ordering::SeqCst), 1);
      assert_eq!(coordinator.cache().stats().hits, 1);
      assert_eq!(coordinator.cache().stats().misses, 1);
   }

   #[tokio::test]
   async fn test_write_makes_next_read_fresh() {
      let (coordinator, reads, _clock) = coordinator();

      assert!(coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap().is_empty());

      coordinator
         .execute("items", Statement::new("INSERT INTO items DEFAULT VALUES"))
         .await
         .unwrap();

      let rows = coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(reads.load(Ordering::SeqCst), 2);
   }

   #[tokio::test]
   async fn test_cached_read_expires_with_clock() {
      let (coordinator, reads, clock) = coordinator();

      coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();
      clock.advance(coordinator.cache().config().default_ttl);
      coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();

      assert_eq!(reads.load(Ordering::SeqCst), 2);
   }

   #[tokio::test]
   async fn test_failed_write_still_invalidates() {
      let (coordinator, _reads, _clock) = coordinator();
      coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();
      assert_eq!(coordinator.cache().len(), 1);

      let err = coordinator
         .write("items", |_handle| {
            Box::pin(async {
               Err::<(), _>(sqlx_sqlite_conn_mgr::Error::Storage {
                  statement: "UPDATE items".into(),
                  message: "constraint failed".into(),
               })
            })
         })
         .await
         .unwrap_err();

      assert_eq!(err.error_code(), "STORAGE_ERROR");
      assert!(coordinator.cache().is_empty());
   }

   #[tokio::test]
   async fn test_shutdown_clears_cache_and_closes_pool() {
      let (coordinator, _reads, _clock) = coordinator();
      coordinator.fetch_all("items", "SELECT n FROM items").await.unwrap();

      coordinator.shutdown().await.unwrap();

      assert!(coordinator.cache().is_empty());
      let err = coordinator.acquire().await.unwrap_err();
      assert_eq!(err.error_code(), "POOL_CLOSED");
   }

   #[test]
   fn test_migration_without_scopes_clears_everything() {
      let (coordinator, _reads, _clock) = coordinator();
      coordinator.cache().insert("items", Fingerprint::new("a"), Vec::new());
      coordinator.cache().insert("collections", Fingerprint::new("b"), Vec::new());

      coordinator.invalidate_migrated(&[AppliedMigration {
         version: 1,
         name: "rebuild".into(),
         scopes: Vec::new(),
      }]);

      assert!(coordinator.cache().is_empty());
   }

   #[test]
   fn test_migration_scopes_are_invalidated() {
      let (coordinator, _reads, _clock) = coordinator();
      coordinator.cache().insert("items", Fingerprint::new("a"), Vec::new());
      coordinator.cache().insert("tags", Fingerprint::new("b"), Vec::new());
      coordinator.cache().insert("collections", Fingerprint::new("c"), Vec::new());

      coordinator.invalidate_migrated(&[
         AppliedMigration {
            version: 2,
            name: "add_tags".into(),
            scopes: vec!["items".into(), "tags".into()],
         },
         AppliedMigration {
            version: 3,
            name: "tag_index".into(),
            scopes: vec!["tags".into()],
         },
      ]);

      assert_eq!(coordinator.cache().len(), 1);
      assert!(coordinator.cache().get("collections", &Fingerprint::new("c")).is_some());
   }
}

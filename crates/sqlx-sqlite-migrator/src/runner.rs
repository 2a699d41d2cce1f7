//! Applies pending migrations in version order

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx_sqlite_conn_mgr::{
   Connector, Pool, PooledHandle, RetryExecutor, Statement, StorageHandle,
};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::MigratorConfig;
use crate::ledger::{Ledger, LedgerEntry};
use crate::migration::{self, Migration};
use crate::{Error, Result};

/// Phase of the current (or most recent) migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
   Idle,
   LedgerEnsured,
   Planning,
   /// Running the statements of this version.
   Applying(i64),
   /// Writing the ledger entry for this version.
   Recording(i64),
   Done,
   /// This version failed and its transaction was rolled back.
   RolledBack(i64),
}

/// A migration committed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
   pub version: i64,
   pub name: String,
   /// Cache scopes the migration declared. Empty means "everything".
   pub scopes: Vec<String>,
}

impl From<&Migration> for AppliedMigration {
   fn from(migration: &Migration) -> Self {
      Self {
         version: migration.version(),
         name: migration.name().to_string(),
         scopes: migration.scopes().to_vec(),
      }
   }
}

/// Outcome of a successful [`Migrator::migrate`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
   /// Ledger version before the run.
   pub from_version: i64,
   /// Ledger version after the run.
   pub to_version: i64,
   pub applied: Vec<AppliedMigration>,
}

/// Brings a database's schema up to a target version.
///
/// Each migration runs in its own transaction together with its ledger
/// entry, so a version is either fully applied and recorded or not at all.
/// A failure stops the run; earlier migrations of the same run stay
/// committed and the next run resumes after the last recorded version.
///
/// Calls to [`migrate`](Self::migrate) on one `Migrator` are serialized. A
/// version found in the ledger once its transaction has started is skipped,
/// so separate migrators on the same database never apply a version twice.
pub struct Migrator<C: Connector> {
   pool: Pool<C>,
   retry: RetryExecutor,
   ledger: Ledger,
   migrations: Arc<[Migration]>,
   state: Arc<Mutex<RunState>>,
   run_lock: tokio::sync::Mutex<()>,
}

impl<C: Connector> std::fmt::Debug for Migrator<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Migrator")
         .field("ledger", &self.ledger)
         .field("migrations", &self.migrations.len())
         .field("state", &*self.state.lock())
         .finish_non_exhaustive()
   }
}

impl<C: Connector> Migrator<C> {
   /// Validates `migrations` without touching storage.
   ///
   /// # Errors
   ///
   /// `InvalidVersion`, `DuplicateVersion`, `DuplicateName` or
   /// `EmptyMigration` for a bad migration set, and `InvalidLedgerTable` for a
   /// ledger table name that is not a plain identifier.
   pub fn new(
      pool: Pool<C>,
      retry: RetryExecutor,
      migrations: Vec<Migration>,
      config: &MigratorConfig,
   ) -> Result<Self> {
      let ledger = Ledger::new(config.ledger_table.as_str())?;
      let migrations = migration::validate(migrations)?;

      Ok(Self {
         pool,
         retry,
         ledger,
         migrations: migrations.into(),
         state: Arc::new(Mutex::new(RunState::Idle)),
         run_lock: tokio::sync::Mutex::new(()),
      })
   }

   /// Declared migrations, sorted by version.
   pub fn migrations(&self) -> &[Migration] {
      &self.migrations
   }

   /// Highest declared version, or 0 with no migrations.
   pub fn latest_version(&self) -> i64 {
      self.migrations.last().map_or(0, Migration::version)
   }

   pub fn ledger(&self) -> &Ledger {
      &self.ledger
   }

   pub fn state(&self) -> RunState {
      *self.state.lock()
   }

   /// Creates the ledger table if needed.
   pub async fn ensure_ledger(&self) -> Result<()> {
      let mut conn = self.pool.acquire().await?;
      self.ensure_ledger_on(&mut *conn).await
   }

   /// Highest recorded version, or 0 when nothing has been applied.
   pub async fn current_version(&self) -> Result<i64> {
      let mut conn = self.pool.acquire().await?;
      self.ensure_ledger_on(&mut *conn).await?;
      self.current_version_on(&mut *conn).await
   }

   /// Every recorded migration, oldest first.
   pub async fn applied(&self) -> Result<Vec<LedgerEntry>> {
      let mut conn = self.pool.acquire().await?;
      self.ensure_ledger_on(&mut *conn).await?;
      self.entries_on(&mut *conn).await
   }

   /// Migrations `migrate(target)` would apply, in order.
   ///
   /// # Errors
   ///
   /// Fails if the ledger disagrees with the declared migrations
   /// (`UnknownAppliedVersion`, `LedgerMismatch`, `VersionGap`).
   pub async fn plan(&self, target: i64) -> Result<Vec<Migration>> {
      let mut conn = self.pool.acquire().await?;
      self.ensure_ledger_on(&mut *conn).await?;
      let entries = self.entries_on(&mut *conn).await?;
      let (_, pending) = plan_against(&self.migrations, &entries, target)?;
      Ok(pending.into_iter().cloned().collect())
   }

   /// Applies every declared migration not yet recorded.
   pub async fn migrate_to_latest(&self) -> Result<MigrationReport> {
      self.migrate(self.latest_version()).await
   }

   /// Applies pending migrations up to and including `target`.
   ///
   /// A `target` at or below the current version is a no-op.
   ///
   /// # Errors
   ///
   /// Planning errors are returned before anything is applied. A migration
   /// that fails is rolled back and reported as `MigrationFailed`, carrying
   /// the migrations this run already committed.
   /// Failing to get a connection for a migration is returned as a plain
   /// `ConnectionManager` error, since no transaction was started.
   pub async fn migrate(&self, target: i64) -> Result<MigrationReport> {
      let _run = self.run_lock.lock().await;
      self.set_state(RunState::Idle);

      let (from_version, pending) = {
         let mut conn = self.pool.acquire().await?;
         self.ensure_ledger_on(&mut *conn).await?;
         self.set_state(RunState::LedgerEnsured);

         self.set_state(RunState::Planning);
         let entries = self.entries_on(&mut *conn).await?;
         let (current, pending) = plan_against(&self.migrations, &entries, target)?;
         let pending: Vec<Migration> = pending.into_iter().cloned().collect();
         (current, pending)
      };

      debug!(
         from_version,
         target,
         pending = pending.len(),
         "Planned migration run"
      );

      let mut applied = Vec::with_capacity(pending.len());
      let mut last_applied_version = from_version;

      for migration in &pending {
         let record = self.ledger.record(migration, OffsetDateTime::now_utc())?;
         // Nothing is opened yet, so a pool failure is not a rolled-back migration
         let mut conn = self.pool.acquire().await?;
         self.set_state(RunState::Applying(migration.version()));

         match self.apply(&mut conn, migration, &record).await {
            Ok(true) => {
               debug!(
                  version = migration.version(),
                  name = migration.name(),
                  "Applied migration"
               );
               applied.push(AppliedMigration::from(migration));
               last_applied_version = migration.version();
            }
            Ok(false) => {
               debug!(
                  version = migration.version(),
                  "Migration already recorded, skipping"
               );
               last_applied_version = migration.version();
            }
            Err(source) => {
               self.set_state(RunState::RolledBack(migration.version()));
               warn!(
                  version = migration.version(),
                  name = migration.name(),
                  error = %source,
                  "Migration failed and was rolled back"
               );
               return Err(Error::MigrationFailed {
                  version: migration.version(),
                  name: migration.name().to_string(),
                  applied,
                  last_applied_version,
                  source: Box::new(source),
               });
            }
         }
      }

      self.set_state(RunState::Done);

      Ok(MigrationReport {
         from_version,
         to_version: last_applied_version,
         applied,
      })
   }

   /// Runs one migration and its ledger entry in a single transaction,
   /// retrying the whole transaction while the database is busy.
   ///
   /// Returns `false` if the version turned out to be recorded already.
   async fn apply(
      &self,
      conn: &mut PooledHandle<C>,
      migration: &Migration,
      record: &Statement,
   ) -> sqlx_sqlite_conn_mgr::Result<bool> {
      let operation = format!("apply migration {}", migration.version());

      self
         .retry
         .run_on(&mut **conn, &operation, |handle| {
            let migration = migration.clone();
            let ledger = self.ledger.clone();
            let record = record.clone();
            let state = Arc::clone(&self.state);
            Box::pin(async move {
               apply_in_transaction(handle, &ledger, &migration, &record, &state).await
            })
         })
         .await
   }

   async fn ensure_ledger_on(&self, handle: &mut C::Handle) -> Result<()> {
      self
         .retry
         .run_on(handle, "ensure migration ledger", |handle| {
            let ledger = self.ledger.clone();
            Box::pin(async move { ledger.ensure(handle).await.map_err(into_conn_mgr) })
         })
         .await?;
      Ok(())
   }

   async fn current_version_on(&self, handle: &mut C::Handle) -> Result<i64> {
      self.ledger.current_version(handle).await
   }

   async fn entries_on(&self, handle: &mut C::Handle) -> Result<Vec<LedgerEntry>> {
      self.ledger.entries(handle).await
   }

   fn set_state(&self, state: RunState) {
      debug!(?state, "Migration phase");
      *self.state.lock() = state;
   }
}

/// Body of one migration attempt. Rolls back on any failure.
async fn apply_in_transaction<H: StorageHandle>(
   handle: &mut H,
   ledger: &Ledger,
   migration: &Migration,
   record: &Statement,
   state: &Mutex<RunState>,
) -> sqlx_sqlite_conn_mgr::Result<bool> {
   handle.begin().await?;

   let outcome = async {
      if ledger
         .contains(&mut *handle, migration.version())
         .await
         .map_err(into_conn_mgr)?
      {
         return Ok(false);
      }

      for sql in migration.statements() {
         if sql.trim().is_empty() {
            continue;
         }
         handle.execute(sql, Vec::new()).await?;
      }

      *state.lock() = RunState::Recording(migration.version());
      handle.execute(&record.query, record.values.clone()).await?;
      Ok(true)
   }
   .await;

   match outcome {
      Ok(applied) => match handle.commit().await {
         Ok(()) => Ok(applied),
         Err(commit_err) => Err(rollback_after(handle, commit_err).await),
      },
      Err(e) => Err(rollback_after(handle, e).await),
   }
}

async fn rollback_after<H: StorageHandle>(
   handle: &mut H,
   cause: sqlx_sqlite_conn_mgr::Error,
) -> sqlx_sqlite_conn_mgr::Error {
   match handle.rollback().await {
      Ok(()) => cause,
      Err(rollback_err) => sqlx_sqlite_conn_mgr::Error::TransactionRollbackFailed {
         transaction_error: cause.to_string(),
         rollback_error: rollback_err.to_string(),
      },
   }
}

/// Ledger helpers report storage failures as migrator errors; inside a retried
/// transaction they have to be connection manager errors again so busy
/// failures stay retryable.
fn into_conn_mgr(error: Error) -> sqlx_sqlite_conn_mgr::Error {
   match error {
      Error::ConnectionManager(e) => e,
      other => sqlx_sqlite_conn_mgr::Error::Storage {
         statement: "migration ledger".to_string(),
         message: other.to_string(),
      },
   }
}

/// Checks the ledger against the declared migrations and picks the ones with
/// `current < version <= target`. Returns the current version alongside.
fn plan_against<'m>(
   migrations: &'m [Migration],
   entries: &[LedgerEntry],
   target: i64,
) -> Result<(i64, Vec<&'m Migration>)> {
   let declared: HashMap<i64, &Migration> = migrations
      .iter()
      .map(|migration| (migration.version(), migration))
      .collect();

   for entry in entries {
      match declared.get(&entry.version) {
         None => {
            return Err(Error::UnknownAppliedVersion {
               version: entry.version,
               name: entry.name.clone(),
            });
         }
         Some(migration) if migration.name() != entry.name => {
            return Err(Error::LedgerMismatch {
               version: entry.version,
               recorded: entry.name.clone(),
               declared: migration.name().to_string(),
            });
         }
         Some(_) => {}
      }
   }

   let current = entries.iter().map(|entry| entry.version).max().unwrap_or(0);
   let recorded: HashSet<i64> = entries.iter().map(|entry| entry.version).collect();

   if let Some(missing) = migrations
      .iter()
      .find(|m| m.version() <= current.min(target) && !recorded.contains(&m.version()))
   {
      return Err(Error::VersionGap {
         version: missing.version(),
         current,
      });
   }

   let pending = migrations
      .iter()
      .filter(|m| m.version() > current && m.version() <= target)
      .collect();

   Ok((current, pending))
}

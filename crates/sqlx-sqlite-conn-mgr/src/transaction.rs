//! Atomic multi-statement execution on a single handle

use tracing::debug;

use crate::handle::{Statement, StorageHandle, WriteResult};
use crate::{Error, Result};

/// Execute multiple write statements atomically within a transaction.
///
/// This function:
/// 1. Begins a transaction
/// 2. Executes all statements in order
/// 3. Commits on success
/// 4. Rolls back on any error
///
/// The handle is held for the entire transaction, ensuring atomicity.
/// Returns the result of each statement execution.
pub async fn execute_transaction<H: StorageHandle>(
   handle: &mut H,
   statements: &[Statement],
) -> Result<Vec<WriteResult>> {
   handle.begin().await?;

   // Execute all statements, collecting results and rolling back on error
   let result = async {
      let mut results = Vec::with_capacity(statements.len());
      for statement in statements {
         let exec_result = handle
            .execute(&statement.query, statement.values.clone())
            .await?;
         results.push(exec_result);
      }
      Ok::<Vec<WriteResult>, Error>(results)
   }
   .await;

   // Commit or rollback based on result
   match result {
      Ok(results) => {
         if let Err(commit_err) = handle.commit().await {
            return Err(rollback_after(handle, commit_err).await);
         }
         Ok(results)
      }
      Err(e) => Err(rollback_after(handle, e).await),
   }
}

/// Rolls back after `cause`, returning the error the caller should surface.
///
/// A busy `cause` stays intact after a clean rollback so the retry executor
/// can still classify it.
async fn rollback_after<H: StorageHandle>(handle: &mut H, cause: Error) -> Error {
   match handle.rollback().await {
      // Rollback succeeded, return original error
      Ok(()) => {
         debug!(error = %cause, "Transaction rolled back");
         cause
      }

      // Rollback also failed, return the rollback error and the original error
      Err(rollback_err) => Error::TransactionRollbackFailed {
         transaction_error: cause.to_string(),
         rollback_error: rollback_err.to_string(),
      },
   }
}

//! Busy-retry with exponential backoff

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::RetryPolicy;
use crate::{Error, Result};

/// Re-runs operations that fail with lock contention.
///
/// Only errors for which [`Error::is_busy`] is true are retried; anything else
/// is returned on the spot. Before retry `n` the executor sleeps
/// `base_delay * 2^n` on its [`Clock`].
#[derive(Clone)]
pub struct RetryExecutor {
   policy: RetryPolicy,
   clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryExecutor {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("RetryExecutor")
         .field("policy", &self.policy)
         .finish_non_exhaustive()
   }
}

impl RetryExecutor {
   pub fn new(policy: RetryPolicy) -> Self {
      Self::with_clock(policy, Arc::new(SystemClock))
   }

   pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
      Self { policy, clock }
   }

   pub fn policy(&self) -> &RetryPolicy {
      &self.policy
   }

   pub fn clock(&self) -> &Arc<dyn Clock> {
      &self.clock
   }

   /// Run `op` until it succeeds, fails with a non-busy error, or the retry
   /// budget is spent.
   ///
   /// `operation` names the work in logs and in [`Error::RetryExhausted`].
   pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
   where
      F: FnMut() -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      let mut retries = 0u32;
      loop {
         match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
               let delay = self.next_delay(operation, retries, e)?;
               self.clock.sleep(delay).await;
               retries += 1;
            }
         }
      }
   }

   /// Like [`run`](Self::run), but each attempt borrows the same `target`
   /// (typically a pooled connection).
   pub async fn run_on<H, T, F>(&self, target: &mut H, operation: &str, mut op: F) -> Result<T>
   where
      H: ?Sized,
      F: for<'h> FnMut(&'h mut H) -> BoxFuture<'h, Result<T>>,
   {
      let mut retries = 0u32;
      loop {
         match op(&mut *target).await {
            Ok(value) => return Ok(value),
            Err(e) => {
               let delay = self.next_delay(operation, retries, e)?;
               self.clock.sleep(delay).await;
               retries += 1;
            }
         }
      }
   }

   /// The backoff before the next attempt, or the error to give up with.
   fn next_delay(&self, operation: &str, retries: u32, error: Error) -> Result<Duration> {
      if !error.is_busy() {
         return Err(error);
      }

      if retries >= self.policy.max_retries {
         warn!(operation, attempts = retries + 1, error = %error, "Retry budget exhausted");
         return Err(Error::RetryExhausted {
            operation: operation.to_string(),
            attempts: retries + 1,
            source: Box::new(error),
         });
      }

      let delay = self.policy.delay_for(retries);
      warn!(
         operation,
         attempt = retries + 1,
         delay = ?delay,
         "Database busy, backing off"
      );
      Ok(delay)
   }
}

impl Default for RetryExecutor {
   fn default() -> Self {
      Self::new(RetryPolicy::default())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::clock::ManualClock;
   use std::sync::atomic::{AtomicU32, Ordering};

   fn executor(max_retries: u32, base_ms: u64) -> (RetryExecutor, ManualClock) {
      let clock = ManualClock::new();
      let policy = RetryPolicy {
         max_retries,
         base_delay: Duration::from_millis(base_ms),
      };
      (
         RetryExecutor::with_clock(policy, Arc::new(clock.clone())),
         clock,
      )
   }

   #[tokio::test]
   async fn test_always_busy_exhausts_with_doubling_delays() {
      let (retry, clock) = executor(4, 10);
      let calls = &AtomicU32::new(0);

      let err = retry
         .run("always busy", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Busy("database is locked".into()))
         })
         .await
         .unwrap_err();

      // One initial attempt plus exactly max_retries retries
      assert_eq!(calls.load(Ordering::SeqCst), 5);
      assert_eq!(
         clock.sleeps(),
         vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80),
         ]
      );

      match err {
         Error::RetryExhausted {
            operation,
            attempts,
            source,
         } => {
            assert_eq!(operation, "always busy");
            assert_eq!(attempts, 5);
            assert!(source.is_busy());
         }
         other => panic!("expected RetryExhausted, got {other:?}"),
      }
   }

   #[tokio::test]
   async fn test_non_busy_error_is_not_retried() {
      let (retry, clock) = executor(4, 10);
      let calls = &AtomicU32::new(0);

      let err = retry
         .run("bad statement", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Storage {
               statement: "SELEC 1".into(),
               message: "syntax error".into(),
            })
         })
         .await
         .unwrap_err();

      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert!(clock.sleeps().is_empty());
      assert_eq!(err.error_code(), "STORAGE_ERROR");
   }

   #[tokio::test]
   async fn test_recovers_after_transient_busy() {
      let (retry, clock) = executor(5, 1);
      let calls = &AtomicU32::new(0);

      let value = retry
         .run("flaky", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
               Err(Error::Busy("locked".into()))
            } else {
               Ok(42)
            }
         })
         .await
         .unwrap();

      assert_eq!(value, 42);
      assert_eq!(
         clock.sleeps(),
         vec![Duration::from_millis(1), Duration::from_millis(2)]
      );
   }

   #[tokio::test]
   async fn test_zero_retries_fails_on_first_busy() {
      let (retry, clock) = executor(0, 10);

      let err = retry
         .run("no budget", || async {
            Err::<(), _>(Error::Busy("locked".into()))
         })
         .await
         .unwrap_err();

      assert!(matches!(err, Error::RetryExhausted { attempts: 1, .. }));
      assert!(clock.sleeps().is_empty());
   }

   #[tokio::test]
   async fn test_run_on_reuses_target() {
      let (retry, clock) = executor(3, 5);
      let mut attempts: Vec<u32> = Vec::new();

      let result = retry
         .run_on(&mut attempts, "collect", |log| {
            Box::pin(async move {
               log.push(log.len() as u32);
               if log.len() < 3 {
                  Err(Error::Busy("locked".into()))
               } else {
                  Ok(log.len())
               }
            })
         })
         .await
         .unwrap();

      assert_eq!(result, 3);
      assert_eq!(attempts, vec![0, 1, 2]);
      assert_eq!(clock.sleeps().len(), 2);
   }
}

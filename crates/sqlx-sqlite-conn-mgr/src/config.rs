//! Configuration for SQLite connection pools and busy-retry

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`Pool`](crate::Pool)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_mgr::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just one field
/// let config = PoolConfig {
///     max_connections: 2,
///     ..Default::default()
/// };
///
/// // Wait forever for a free connection
/// let config = PoolConfig {
///     acquire_timeout: None,
///     idle_timeout: Some(Duration::from_secs(60)),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
   /// Hard ceiling on the number of open connections
   ///
   /// Callers that find every connection checked out queue up (FIFO) until
   /// one is released.
   ///
   /// Default: 4
   pub max_connections: usize,

   /// How long [`Pool::acquire`](crate::Pool::acquire) waits for a free
   /// connection before failing with `AcquireTimeout`
   ///
   /// `None` waits until a connection is released or the pool shuts down.
   ///
   /// Default: 30 seconds
   pub acquire_timeout: Option<Duration>,

   /// Idle connections unused for this long are closed on the next acquire
   ///
   /// Default: 5 minutes
   pub idle_timeout: Option<Duration>,

   /// Pragmas applied once to every new connection, in order
   ///
   /// Default: `foreign_keys = ON`, `journal_mode = WAL`
   pub pragmas: Vec<(String, String)>,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_connections: 4,
         acquire_timeout: Some(Duration::from_secs(30)),
         idle_timeout: Some(Duration::from_secs(300)),
         pragmas: vec![
            ("foreign_keys".to_string(), "ON".to_string()),
            ("journal_mode".to_string(), "WAL".to_string()),
         ],
      }
   }
}

/// Busy-retry policy for [`RetryExecutor`](crate::RetryExecutor)
///
/// The delay before retry `n` (0-based) is `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
   /// Retries after the first attempt. Zero disables retrying.
   ///
   /// Default: 5
   pub max_retries: u32,

   /// Delay before the first retry
   ///
   /// Default: 50 milliseconds
   pub base_delay: Duration,
}

impl RetryPolicy {
   /// Delay before the given retry, saturating instead of overflowing.
   pub fn delay_for(&self, retry: u32) -> Duration {
      2u32
         .checked_pow(retry)
         .and_then(|factor| self.base_delay.checked_mul(factor))
         .unwrap_or(Duration::MAX)
   }
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_retries: 5,
         base_delay: Duration::from_millis(50),
      }
   }
}

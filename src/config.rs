//! Top-level configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx_sqlite_conn_mgr::{PoolConfig, RetryPolicy};
use sqlx_sqlite_migrator::MigratorConfig;

/// Configuration for [`QueryCache`](crate::QueryCache)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
   /// Entries kept before the oldest-inserted one is evicted
   ///
   /// Default: 1024
   pub max_entries: usize,

   /// Lifetime of an entry cached by a read
   ///
   /// Default: 60 seconds
   pub default_ttl: Duration,
}

impl Default for CacheConfig {
   fn default() -> Self {
      Self {
         max_entries: 1024,
         default_ttl: Duration::from_secs(60),
      }
   }
}

/// Configuration for [`Coordinator`](crate::Coordinator)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_coordinator::{CacheConfig, CoordinatorConfig};
/// use std::time::Duration;
///
/// let config = CoordinatorConfig {
///     cache: CacheConfig {
///         default_ttl: Duration::from_secs(5),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert_eq!(config.pool.max_connections, 4);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
   pub pool: PoolConfig,
   pub retry: RetryPolicy,
   pub migrator: MigratorConfig,
   pub cache: CacheConfig,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_partial_config_keeps_other_defaults() {
      let config: CoordinatorConfig = serde_json::from_str(
         r#"{ "pool": { "max_connections": 2 }, "cache": { "max_entries": 10 } }"#,
      )
      .unwrap();

      assert_eq!(config.pool.max_connections, 2);
      assert_eq!(config.pool.acquire_timeout, PoolConfig::default().acquire_timeout);
      assert_eq!(config.cache.max_entries, 10);
      assert_eq!(config.cache.default_ttl, Duration::from_secs(60));
      assert_eq!(config.retry, RetryPolicy::default());
      assert_eq!(config.migrator.ledger_table, "_schema_migrations");
   }
}

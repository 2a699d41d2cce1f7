//! Scope-invalidated query cache with TTL expiry

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx_sqlite_conn_mgr::{Clock, SystemClock};
use tracing::{debug, trace};

use crate::config::CacheConfig;

/// TTLs too large to add to an `Instant` are clamped to this.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deterministic key for one read: statement text plus its bind values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
   /// Fingerprint of `statement` with `params`.
   ///
   /// Equal statements with equal parameters always produce equal
   /// fingerprints; the parameters are compared by their JSON encoding.
   pub fn of(statement: &str, params: &[JsonValue]) -> Self {
      let params = JsonValue::Array(params.to_vec());
      Self(format!("{statement}\u{1f}{params}"))
   }

   /// A caller-chosen fingerprint, for reads that are not a single statement.
   pub fn new(raw: impl Into<String>) -> Self {
      Self(raw.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for Fingerprint {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
   scope: String,
   fingerprint: Fingerprint,
}

#[derive(Debug)]
struct CacheEntry<V> {
   value: V,
   expires_at: Instant,
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
   pub hits: u64,
   pub misses: u64,
   /// Entries dropped to stay within `max_entries`.
   pub evictions: u64,
   /// Entries dropped because their TTL ran out.
   pub expirations: u64,
   /// Entries dropped by scope invalidation or `clear`.
   pub invalidations: u64,
}

struct CacheState<V> {
   entries: IndexMap<CacheKey, CacheEntry<V>>,
   stats: CacheStats,
}

/// Read-through cache keyed by `(scope, fingerprint)`.
///
/// Entries are kept in insertion order; when the cache is full the oldest
/// insertion is evicted. Writes never populate the cache, they only drop
/// every entry of the scope they touched.
///
/// # Staleness
///
/// A read that started before an invalidation of its scope can still store
/// its result afterwards. Such an entry reflects the pre-write state and
/// lives at most one TTL.
pub struct QueryCache<V> {
   config: CacheConfig,
   clock: Arc<dyn Clock>,
   state: Mutex<CacheState<V>>,
}

impl<V> fmt::Debug for QueryCache<V> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let state = self.state.lock();
      f.debug_struct("QueryCache")
         .field("config", &self.config)
         .field("len", &state.entries.len())
         .field("stats", &state.stats)
         .finish_non_exhaustive()
   }
}

impl<V: Clone> QueryCache<V> {
   pub fn new(config: CacheConfig) -> Self {
      Self::with_clock(config, Arc::new(SystemClock))
   }

   pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
      Self {
         config,
         clock,
         state: Mutex::new(CacheState {
            entries: IndexMap::new(),
            stats: CacheStats::default(),
         }),
      }
   }

   pub fn config(&self) -> &CacheConfig {
      &self.config
   }

   /// The cached value, if present and not yet expired.
   ///
   /// An expired entry is dropped and counted as a miss.
   pub fn get(&self, scope: &str, fingerprint: &Fingerprint) -> Option<V> {
      let key = CacheKey {
         scope: scope.to_string(),
         fingerprint: fingerprint.clone(),
      };
      let now = self.clock.now();
      let mut state = self.state.lock();

      match state.entries.get(&key) {
         Some(entry) if now < entry.expires_at => {
            let value = entry.value.clone();
            state.stats.hits += 1;
            trace!(scope, fingerprint = %fingerprint, "Cache hit");
            Some(value)
         }
         Some(_) => {
            state.entries.shift_remove(&key);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            trace!(scope, fingerprint = %fingerprint, "Cache entry expired");
            None
         }
         None => {
            state.stats.misses += 1;
            None
         }
      }
   }

   /// Stores `value` for the default TTL.
   pub fn insert(&self, scope: &str, fingerprint: Fingerprint, value: V) {
      self.set(scope, fingerprint, value, self.config.default_ttl);
   }

   /// Stores `value` until `ttl` has passed.
   ///
   /// Overwriting a key moves it to the back of the eviction order.
   pub fn set(&self, scope: &str, fingerprint: Fingerprint, value: V, ttl: Duration) {
      let key = CacheKey {
         scope: scope.to_string(),
         fingerprint,
      };
      let now = self.clock.now();
      let expires_at = now.checked_add(ttl).unwrap_or(now + MAX_TTL);

      let mut state = self.state.lock();
      state.entries.shift_remove(&key);
      state.entries.insert(key, CacheEntry { value, expires_at });

      while state.entries.len() > self.config.max_entries {
         if let Some((evicted, _)) = state.entries.shift_remove_index(0) {
            state.stats.evictions += 1;
            trace!(scope = %evicted.scope, "Evicted oldest cache entry");
         }
      }
   }

   /// Drops every entry of `scope`, returning how many were removed.
   pub fn invalidate_scope(&self, scope: &str) -> usize {
      let mut state = self.state.lock();
      let before = state.entries.len();
      state.entries.retain(|key, _| key.scope != scope);
      let removed = before - state.entries.len();
      state.stats.invalidations += removed as u64;
      drop(state);

      debug!(scope, removed, "Invalidated cache scope");
      removed
   }

   /// Drops every entry, returning how many were removed.
   pub fn clear(&self) -> usize {
      let mut state = self.state.lock();
      let removed = state.entries.len();
      state.entries.clear();
      state.stats.invalidations += removed as u64;
      drop(state);

      debug!(removed, "Cleared query cache");
      removed
   }

   /// Drops every expired entry, returning how many were removed.
   pub fn purge_expired(&self) -> usize {
      let now = self.clock.now();
      let mut state = self.state.lock();
      let before = state.entries.len();
      state.entries.retain(|_, entry| now < entry.expires_at);
      let removed = before - state.entries.len();
      state.stats.expirations += removed as u64;
      removed
   }

   /// Number of stored entries, including expired ones not yet purged.
   pub fn len(&self) -> usize {
      self.state.lock().entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   pub fn stats(&self) -> CacheStats {
      self.state.lock().stats
   }
}

//! Time source used for backoff sleeps and cache expiry

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Source of "now" and of sleeping.
///
/// Production code uses [`SystemClock`]. Tests inject a [`ManualClock`] so
/// backoff delays and TTL expiry are reproducible without waiting.
pub trait Clock: Send + Sync + 'static {
   fn now(&self) -> Instant;

   fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
   fn now(&self) -> Instant {
      Instant::now()
   }

   fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
      Box::pin(tokio::time::sleep(duration))
   }
}

/// Deterministic clock that only moves when told to.
///
/// `sleep` returns immediately, advances the clock by the requested duration
/// and records it, so a test can assert the exact backoff sequence.
#[derive(Debug, Clone)]
pub struct ManualClock {
   inner: Arc<Mutex<ManualClockState>>,
}

#[derive(Debug)]
struct ManualClockState {
   now: Instant,
   sleeps: Vec<Duration>,
}

impl ManualClock {
   pub fn new() -> Self {
      Self {
         inner: Arc::new(Mutex::new(ManualClockState {
            now: Instant::now(),
            sleeps: Vec::new(),
         })),
      }
   }

   /// Moves the clock forward.
   pub fn advance(&self, duration: Duration) {
      self.inner.lock().now += duration;
   }

   /// Every duration passed to `sleep`, oldest first.
   pub fn sleeps(&self) -> Vec<Duration> {
      self.inner.lock().sleeps.clone()
   }
}

impl Default for ManualClock {
   fn default() -> Self {
      Self::new()
   }
}

impl Clock for ManualClock {
   fn now(&self) -> Instant {
      self.inner.lock().now
   }

   fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
      {
         let mut state = self.inner.lock();
         state.now += duration;
         state.sleeps.push(duration);
      }
      Box::pin(tokio::task::yield_now())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_manual_clock_sleep_advances_and_records() {
      let clock = ManualClock::new();
      let start = clock.now();

      clock.sleep(Duration::from_millis(30)).await;
      clock.advance(Duration::from_millis(5));

      assert_eq!(clock.now() - start, Duration::from_millis(35));
      assert_eq!(clock.sleeps(), vec![Duration::from_millis(30)]);
   }
}

//! Bounded connection pool with FIFO hand-off to waiting callers
//!
//! ## Design
//!
//! All bookkeeping (idle slots, slot count, wait queue, closed flag) lives in
//! one `parking_lot::Mutex` that is never held across an `.await`. Callers
//! that find the pool exhausted enqueue a wait ticket holding the sending half
//! of a `oneshot` channel and suspend on the receiving half.
//!
//! Releasing a slot never makes it idle while a ticket is queued: the slot is
//! handed directly to the oldest live ticket under the lock, so there is no
//! window in which a newcomer can grab it ahead of a waiter.
//!
//! When opening a new connection fails or is cancelled, the capacity reserved
//! for it is passed to the oldest ticket as a [`Grant::Open`] permit instead
//! of being dropped, so waiters never stall behind a failed open.
//!
//! A connection released while [`StorageHandle::in_transaction`] is set (its
//! holder was cancelled between `begin` and `commit`) is never reused: it is
//! closed in the background, which rolls the transaction back, and its
//! capacity is passed on like a failed open.
//!
//! Connections closed outside of an `.await` (expired idle connections,
//! discarded ones, and ones released after shutdown) are closed on a spawned
//! task.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::handle::{Connector, StorageHandle};
use crate::{Error, Result};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
   /// Open connections, checked out or idle, plus opens in flight
   pub size: usize,
   pub idle: usize,
   /// Callers suspended in `acquire`
   pub waiting: usize,
   pub closed: bool,
}

/// A pooled connection and its bookkeeping.
struct Slot<H> {
   id: u64,
   handle: H,
   created_at: Instant,
   last_used: Instant,
}

/// What a waiting caller receives when it is its turn.
enum Grant<H> {
   /// A live connection released by another caller.
   Slot(Slot<H>),
   /// Reserved capacity: the caller opens a connection itself.
   Open,
}

struct WaitTicket<H> {
   id: u64,
   sender: oneshot::Sender<Grant<H>>,
   enqueued_at: Instant,
}

struct PoolState<H> {
   idle: VecDeque<Slot<H>>,
   /// Slots in existence or being opened. Never exceeds `max_connections`.
   size: usize,
   waiters: VecDeque<WaitTicket<H>>,
   closed: bool,
   next_slot_id: u64,
   next_ticket_id: u64,
}

impl<H> PoolState<H> {
   /// Hands `grant` to the oldest ticket whose caller is still waiting.
   ///
   /// Tickets whose receiver was dropped are discarded along the way. Returns
   /// the grant if nobody took it.
   fn hand_off(&mut self, mut grant: Grant<H>) -> Option<Grant<H>> {
      while let Some(ticket) = self.waiters.pop_front() {
         match ticket.sender.send(grant) {
            Ok(()) => {
               trace!(
                  ticket = ticket.id,
                  waited = ?ticket.enqueued_at.elapsed(),
                  "Handed grant to waiting caller"
               );
               return None;
            }
            Err(returned) => grant = returned,
         }
      }
      Some(grant)
   }
}

struct PoolInner<C: Connector> {
   connector: C,
   config: PoolConfig,
   state: Mutex<PoolState<C::Handle>>,
}

/// Bounded pool of [`StorageHandle`]s.
///
/// Cloning a `Pool` is cheap; clones share the same connections.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_conn_mgr::{Pool, PoolConfig, SqliteConnector, StorageHandle};
///
/// # async fn example() -> sqlx_sqlite_conn_mgr::Result<()> {
/// let pool = Pool::new(SqliteConnector::new("app.db"), PoolConfig::default());
///
/// let mut conn = pool.acquire().await?;
/// conn.execute("CREATE TABLE IF NOT EXISTS items (id INTEGER PRIMARY KEY)", vec![])
///    .await?;
/// drop(conn); // back to the pool
///
/// pool.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pool<C: Connector> {
   inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

/// Outcome of the synchronous part of `acquire`.
enum Admission<H> {
   Ready(Slot<H>),
   Open,
   Wait(u64, oneshot::Receiver<Grant<H>>),
}

impl<C: Connector> Pool<C> {
   /// Create a pool. No connection is opened until the first `acquire`.
   pub fn new(connector: C, config: PoolConfig) -> Self {
      Self {
         inner: Arc::new(PoolInner {
            connector,
            config,
            state: Mutex::new(PoolState {
               idle: VecDeque::new(),
               size: 0,
               waiters: VecDeque::new(),
               closed: false,
               next_slot_id: 0,
               next_ticket_id: 0,
            }),
         }),
      }
   }

   pub fn config(&self) -> &PoolConfig {
      &self.inner.config
   }

   pub fn connector(&self) -> &C {
      &self.inner.connector
   }

   pub fn status(&self) -> PoolStatus {
      let state = self.inner.state.lock();
      PoolStatus {
         size: state.size,
         idle: state.idle.len(),
         waiting: state.waiters.len(),
         closed: state.closed,
      }
   }

   pub fn is_closed(&self) -> bool {
      self.inner.state.lock().closed
   }

   /// Acquire a connection, waiting at most the configured `acquire_timeout`.
   pub async fn acquire(&self) -> Result<PooledHandle<C>> {
      self.acquire_inner(self.inner.config.acquire_timeout).await
   }

   /// Acquire a connection, waiting at most `timeout` for one to free up.
   ///
   /// On timeout the caller's place in the queue is given up and the call
   /// fails with [`Error::AcquireTimeout`].
   pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledHandle<C>> {
      self.acquire_inner(Some(timeout)).await
   }

   async fn acquire_inner(&self, timeout: Option<Duration>) -> Result<PooledHandle<C>> {
      let mut expired = Vec::new();
      let admission = {
         let mut state = self.inner.state.lock();
         if state.closed {
            return Err(Error::PoolClosed);
         }

         if let Some(idle_timeout) = self.inner.config.idle_timeout {
            // Idle slots are pushed at the back, so the stalest sit at the front
            while state
               .idle
               .front()
               .is_some_and(|slot| slot.last_used.elapsed() >= idle_timeout)
            {
               if let Some(slot) = state.idle.pop_front() {
                  state.size -= 1;
                  expired.push(slot);
               }
            }
         }

         if let Some(slot) = state.idle.pop_back() {
            Admission::Ready(slot)
         } else if state.size < self.inner.config.max_connections {
            state.size += 1;
            Admission::Open
         } else {
            let id = state.next_ticket_id;
            state.next_ticket_id += 1;
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(WaitTicket {
               id,
               sender,
               enqueued_at: Instant::now(),
            });
            trace!(ticket = id, waiting = state.waiters.len(), "Pool exhausted, queued");
            Admission::Wait(id, receiver)
         }
      };

      for slot in expired {
         debug!(slot = slot.id, "Closing connection idle past idle_timeout");
         close_detached(slot);
      }

      match admission {
         Admission::Ready(slot) => {
            trace!(slot = slot.id, "Reusing idle connection");
            Ok(self.guard(slot))
         }
         Admission::Open => self.open_slot(Reservation::new(&self.inner)).await,
         Admission::Wait(ticket, receiver) => {
            let mut waiter = Waiter {
               pool: self.inner.as_ref(),
               ticket,
               receiver,
               settled: false,
            };

            let grant = match timeout {
               Some(limit) => match tokio::time::timeout(limit, waiter.recv()).await {
                  Ok(grant) => grant?,
                  Err(_) => {
                     debug!(ticket, timeout = ?limit, "Timed out waiting for a connection");
                     return Err(Error::AcquireTimeout(limit));
                  }
               },
               None => waiter.recv().await?,
            };

            match grant {
               Grant::Slot(slot) => Ok(self.guard(slot)),
               Grant::Open => self.open_slot(Reservation::new(&self.inner)).await,
            }
         }
      }
   }

   /// Opens a connection for capacity already reserved by the caller.
   async fn open_slot(&self, reservation: Reservation<'_, C>) -> Result<PooledHandle<C>> {
      let handle = self
         .connect()
         .await
         .inspect_err(|e| warn!(error = %e, "Failed to open pooled connection"))?;

      // From here the capacity belongs to the guard
      reservation.disarm();

      let now = Instant::now();
      let id = {
         let mut state = self.inner.state.lock();
         let id = state.next_slot_id;
         state.next_slot_id += 1;
         id
      };
      debug!(slot = id, "Opened new pooled connection");
      Ok(self.guard(Slot {
         id,
         handle,
         created_at: now,
         last_used: now,
      }))
   }

   /// Connects and applies the configured pragmas, once per connection.
   async fn connect(&self) -> Result<C::Handle> {
      let mut handle = self.inner.connector.connect().await?;
      for (name, value) in &self.inner.config.pragmas {
         if let Err(e) = handle.configure_pragma(name, value).await {
            let _ = handle.close().await;
            return Err(e);
         }
      }
      Ok(handle)
   }

   fn guard(&self, slot: Slot<C::Handle>) -> PooledHandle<C> {
      PooledHandle {
         slot: Some(slot),
         pool: Arc::clone(&self.inner),
      }
   }

   /// Close the pool.
   ///
   /// Every queued caller fails with [`Error::PoolClosed`], idle connections
   /// are closed now, and connections still checked out are closed on a
   /// background task as they are released. Later `acquire` calls fail
   /// immediately.
   pub async fn shutdown(&self) -> Result<()> {
      let (idle, waiting) = {
         let mut state = self.inner.state.lock();
         if state.closed {
            return Ok(());
         }
         state.closed = true;

         // Dropping the senders wakes every waiter with PoolClosed
         let waiting = state.waiters.len();
         state.waiters.clear();

         let idle: Vec<_> = state.idle.drain(..).collect();
         state.size -= idle.len();
         (idle, waiting)
      };

      debug!(
         idle = idle.len(),
         waiting, "Shutting down pool, closing idle connections"
      );

      let results =
         futures::future::join_all(idle.into_iter().map(|slot| slot.handle.close())).await;

      let mut first_err = None;
      for result in results {
         if let Err(e) = result {
            warn!(error = %e, "Failed to close connection during shutdown");
            first_err.get_or_insert(e);
         }
      }

      match first_err {
         Some(e) => Err(e),
         None => Ok(()),
      }
   }
}

impl<C: Connector> PoolInner<C> {
   fn release_slot(&self, mut slot: Slot<C::Handle>) {
      if slot.handle.in_transaction() {
         warn!(
            slot = slot.id,
            "Connection released inside a transaction, discarding it"
         );
         close_detached(slot);
         self.release_permit();
         return;
      }

      let mut state = self.state.lock();
      if state.closed {
         state.size -= 1;
         drop(state);
         trace!(slot = slot.id, "Pool closed, closing released connection");
         close_detached(slot);
         return;
      }

      slot.last_used = Instant::now();
      if let Some(Grant::Slot(slot)) = state.hand_off(Grant::Slot(slot)) {
         trace!(slot = slot.id, "Connection returned to idle set");
         state.idle.push_back(slot);
      }
   }

   /// Returns reserved-but-unused capacity.
   fn release_permit(&self) {
      let mut state = self.state.lock();
      if state.closed {
         state.size -= 1;
         return;
      }
      if state.hand_off(Grant::Open).is_some() {
         state.size -= 1;
      }
   }
}

/// Closes a connection on a background task.
///
/// Outside a tokio runtime the connection is dropped instead, which still
/// releases it but skips the graceful close.
fn close_detached<H: StorageHandle>(slot: Slot<H>) {
   let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      trace!(slot = slot.id, "No runtime to close connection on, dropping it");
      return;
   };

   runtime.spawn(async move {
      let id = slot.id;
      if let Err(e) = slot.handle.close().await {
         warn!(slot = id, error = %e, "Failed to close connection");
      }
   });
}

/// Capacity counted in `size` for a connection that is still being opened.
///
/// Dropping it without [`disarm`](Self::disarm) (a failed open, a timeout or
/// a cancelled task) returns the capacity to the pool.
struct Reservation<'a, C: Connector> {
   pool: &'a PoolInner<C>,
   armed: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
   fn new(pool: &'a PoolInner<C>) -> Self {
      Self { pool, armed: true }
   }

   fn disarm(mut self) {
      self.armed = false;
   }
}

impl<C: Connector> Drop for Reservation<'_, C> {
   fn drop(&mut self) {
      if self.armed {
         trace!("Releasing capacity reserved for an unopened connection");
         self.pool.release_permit();
      }
   }
}

/// A caller's place in the wait queue.
///
/// Dropping it before a grant is received (timeout or cancellation) removes
/// the ticket; a grant that raced in is given back to the pool.
struct Waiter<'a, C: Connector> {
   pool: &'a PoolInner<C>,
   ticket: u64,
   receiver: oneshot::Receiver<Grant<C::Handle>>,
   settled: bool,
}

impl<C: Connector> Waiter<'_, C> {
   async fn recv(&mut self) -> Result<Grant<C::Handle>> {
      let result = (&mut self.receiver).await;
      self.settled = true;
      // The sender is only dropped without sending on shutdown
      result.map_err(|_| Error::PoolClosed)
   }
}

impl<C: Connector> Drop for Waiter<'_, C> {
   fn drop(&mut self) {
      if self.settled {
         return;
      }

      {
         let mut state = self.pool.state.lock();
         if let Some(pos) = state.waiters.iter().position(|t| t.id == self.ticket) {
            state.waiters.remove(pos);
            return;
         }
      }

      // Hand-offs happen under the lock, so a missing ticket means the grant
      // (if any) is already sitting in the channel
      match self.receiver.try_recv() {
         Ok(Grant::Slot(slot)) => self.pool.release_slot(slot),
         Ok(Grant::Open) => self.pool.release_permit(),
         Err(_) => {}
      }
   }
}

/// RAII guard for a pooled connection.
///
/// Derefs to the underlying handle. The connection goes back to the pool
/// (or to the oldest waiting caller) when the guard is dropped.
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledHandle<C: Connector> {
   slot: Option<Slot<C::Handle>>,
   pool: Arc<PoolInner<C>>,
}

impl<C: Connector> PooledHandle<C> {
   /// Identifier of the underlying pooled connection, stable for its lifetime.
   pub fn slot_id(&self) -> u64 {
      self.slot.as_ref().map_or(0, |slot| slot.id)
   }

   /// When the underlying connection was opened.
   pub fn created_at(&self) -> Option<Instant> {
      self.slot.as_ref().map(|slot| slot.created_at)
   }

   /// Return the connection to the pool now.
   pub fn release(self) {
      drop(self);
   }
}

impl<C: Connector> std::fmt::Debug for PooledHandle<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PooledHandle")
         .field("slot_id", &self.slot_id())
         .finish_non_exhaustive()
   }
}

impl<C: Connector> Deref for PooledHandle<C> {
   type Target = C::Handle;

   fn deref(&self) -> &Self::Target {
      match &self.slot {
         Some(slot) => &slot.handle,
         None => unreachable!("slot is only taken in Drop"),
      }
   }
}

impl<C: Connector> DerefMut for PooledHandle<C> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      match &mut self.slot {
         Some(slot) => &mut slot.handle,
         None => unreachable!("slot is only taken in Drop"),
      }
   }
}

impl<C: Connector> Drop for PooledHandle<C> {
   fn drop(&mut self) {
      if let Some(slot) = self.slot.take() {
         self.pool.release_slot(slot);
      }
   }
}

//! Bounded asynchronous connection pool.
//!
//! ## Capacity accounting
//!
//! `live` counts every connection the pool is responsible for: leased ones,
//! idle ones, and ones currently being opened. It never exceeds the
//! configured capacity. `leased` counts only connections currently out on a
//! [`Lease`]. Both are plain atomics; the idle stack sits behind its own
//! small mutex, so there is no pool-wide lock for the hot path to contend
//! on.
//!
//! ## Reuse and eviction
//!
//! Idle connections are reused most-recent-first, which keeps a small
//! working set warm and lets the rest age out. A background sweeper wakes at
//! half the idle timeout and closes connections that have sat unused for the
//! full timeout. Only idle connections are ever swept; leases are untouched.
//!
//! ## Reservation
//!
//! `acquire` takes the number of slots the caller must leave for other
//! caller classes. Bulk consumers pass the configured reservation so
//! latency-sensitive probes always find headroom; privileged callers pass 0.
//! At least one slot is always admissible, whatever the reservation says.
//!
//! ## Lease discipline
//!
//! A lease is released exactly once: `release` returns the connection for
//! reuse, `replace` destroys it while freeing its capacity. Dropping a lease
//! without either counts as `replace`, because a connection abandoned
//! mid-operation is in an unknown protocol state.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use newsreel_core::{Error, Result};

/// Capability the pool needs from a connection factory.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open a fresh connection. Failures propagate to the acquiring caller
    /// and never consume pool capacity.
    async fn open(&self) -> Result<Self::Conn>;

    /// Liveness check on an idle connection the pool owns exclusively.
    fn is_open(&self, conn: &Self::Conn) -> bool;

    /// Graceful teardown. Used for idle connections by the sweeper and by
    /// `dispose`, and for healthy leases released after dispose; replaced
    /// connections are simply dropped, since their protocol state cannot be
    /// trusted with a farewell exchange.
    async fn close(&self, conn: Self::Conn);
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub capacity: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Upper bound on `Transport::open`, enforced by transports that dial.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: 4,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Point-in-time counters, embedded in health snapshots.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub leased: usize,
    pub idle: usize,
}

struct IdleConn<C> {
    conn: C,
    since: Instant,
}

struct Shared<T: Transport> {
    transport: T,
    cfg: PoolConfig,
    name: String,
    /// leased + idle + currently opening.
    live: AtomicUsize,
    leased: AtomicUsize,
    /// Push/pop at the back for LIFO reuse; the front is the oldest.
    idle: Mutex<VecDeque<IdleConn<T::Conn>>>,
    free: Notify,
    disposed: AtomicBool,
}

impl<T: Transport> Shared<T> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConn<T::Conn>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim_leased(&self, admit: usize) -> bool {
        self.leased
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < admit).then_some(n + 1)
            })
            .is_ok()
    }

    fn try_claim_live(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.cfg.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Healthy lease coming home.
    fn reinsert(self: &Arc<Self>, conn: T::Conn) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        if self.disposed.load(Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            // The pool is retired but the connection is still healthy; it
            // gets the same graceful close the idle ones got at dispose,
            // off the caller's path.
            if self.transport.is_open(&conn) {
                let shared = Arc::clone(self);
                tokio::spawn(async move { shared.transport.close(conn).await });
            }
        } else if !self.transport.is_open(&conn) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            drop(conn);
        } else {
            self.lock_idle().push_back(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
        self.free.notify_one();
    }

    /// Lease destroyed; capacity freed, connection dropped.
    fn discard(&self, conn: T::Conn) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        drop(conn);
        self.free.notify_one();
    }

    /// Stale idle connection dropped during acquire.
    fn forget_idle(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.free.notify_one();
    }
}

/// Undoes slot claims if the acquire future is cancelled or errors while a
/// connection is being opened.
struct SlotClaim<'a, T: Transport> {
    shared: &'a Shared<T>,
    live: bool,
    armed: bool,
}

impl<'a, T: Transport> SlotClaim<'a, T> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<'a, T: Transport> Drop for SlotClaim<'a, T> {
    fn drop(&mut self) {
        if self.armed {
            if self.live {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
            }
            self.shared.leased.fetch_sub(1, Ordering::SeqCst);
            self.shared.free.notify_one();
        }
    }
}

pub struct ConnectionPool<T: Transport> {
    shared: Arc<Shared<T>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Transport> ConnectionPool<T> {
    /// Must be created inside a tokio runtime; the idle sweeper is spawned
    /// here and aborted on `dispose` or drop.
    pub fn new(name: &str, cfg: PoolConfig, transport: T) -> Self {
        let cfg = PoolConfig {
            capacity: cfg.capacity.max(1),
            ..cfg
        };
        let shared = Arc::new(Shared {
            transport,
            cfg,
            name: name.to_string(),
            live: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            idle: Mutex::new(VecDeque::new()),
            free: Notify::new(),
            disposed: AtomicBool::new(false),
        });
        let sweeper = spawn_sweeper(shared.clone());
        ConnectionPool {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Borrow a connection, reusing the most recently returned idle one or
    /// opening a fresh one while capacity allows.
    ///
    /// `reserved_for_others` is the slot count this acquisition must leave
    /// for other caller classes; see the module docs. Saturation waits up to
    /// the configured acquire timeout and then fails with
    /// [`Error::AcquireTimeout`], which is distinct from cancellation:
    /// dropping the returned future at any point leaks nothing.
    pub async fn acquire(&self, reserved_for_others: usize) -> Result<Lease<T>> {
        let shared = &self.shared;
        let capacity = shared.cfg.capacity;
        let admit = capacity - reserved_for_others.min(capacity - 1);
        let deadline = Instant::now() + shared.cfg.acquire_timeout;

        loop {
            if shared.disposed.load(Ordering::SeqCst) {
                return Err(Error::Disposed("connection pool"));
            }
            if shared.try_claim_leased(admit) {
                let mut claim = SlotClaim {
                    shared: shared.as_ref(),
                    live: false,
                    armed: true,
                };

                // Most recently used idle connection first.
                loop {
                    let candidate = shared.lock_idle().pop_back();
                    match candidate {
                        Some(idle) if shared.transport.is_open(&idle.conn) => {
                            claim.defuse();
                            return Ok(Lease {
                                conn: Some(idle.conn),
                                shared: shared.clone(),
                            });
                        }
                        Some(idle) => {
                            drop(idle.conn);
                            shared.forget_idle();
                        }
                        None => break,
                    }
                }

                // Nothing idle; open fresh if a live slot is free.
                if shared.try_claim_live() {
                    claim.live = true;
                    match shared.transport.open().await {
                        Ok(conn) => {
                            claim.defuse();
                            return Ok(Lease {
                                conn: Some(conn),
                                shared: shared.clone(),
                            });
                        }
                        Err(e) => {
                            drop(claim);
                            return Err(e);
                        }
                    }
                }

                // All capacity is leased out; give the claim back and wait.
                drop(claim);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::AcquireTimeout {
                    server: shared.name.clone(),
                    waited: shared.cfg.acquire_timeout,
                });
            }
            let _ = tokio::time::timeout_at(deadline, shared.free.notified()).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.shared.cfg.capacity,
            live: self.shared.live.load(Ordering::SeqCst),
            leased: self.shared.leased.load(Ordering::SeqCst),
            idle: self.shared.lock_idle().len(),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Close every idle connection and fail all current and future
    /// acquisitions. Idempotent. Outstanding leases keep working; healthy
    /// connections released after this are closed gracefully rather than
    /// pooled.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        let drained: Vec<IdleConn<T::Conn>> = self.shared.lock_idle().drain(..).collect();
        let count = drained.len();
        for idle in drained {
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
            self.shared.transport.close(idle.conn).await;
        }
        self.shared.free.notify_waiters();
        tracing::debug!(pool = %self.shared.name, closed = count, "pool disposed");
    }
}

impl<T: Transport> Drop for ConnectionPool<T> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn spawn_sweeper<T: Transport>(shared: Arc<Shared<T>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = (shared.cfg.idle_timeout / 2).max(Duration::from_millis(50));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if shared.disposed.load(Ordering::SeqCst) {
                return;
            }
            let mut expired = Vec::new();
            {
                let mut idle = shared.lock_idle();
                while idle
                    .front()
                    .map_or(false, |i| i.since.elapsed() >= shared.cfg.idle_timeout)
                {
                    if let Some(aged) = idle.pop_front() {
                        expired.push(aged);
                    }
                }
            }
            if expired.is_empty() {
                continue;
            }
            let count = expired.len();
            for aged in expired {
                shared.live.fetch_sub(1, Ordering::SeqCst);
                shared.transport.close(aged.conn).await;
                shared.free.notify_one();
            }
            tracing::debug!(pool = %shared.name, closed = count, "swept idle connections");
        }
    })
}

/// Exclusive use of one pooled connection.
pub struct Lease<T: Transport> {
    conn: Option<T::Conn>,
    shared: Arc<Shared<T>>,
}

impl<T: Transport> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl<T: Transport> Lease<T> {
    /// Return a healthy connection for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.reinsert(conn);
        }
    }

    /// Destroy the connection. Its capacity frees immediately, but the
    /// connection itself is never handed out again.
    pub fn replace(mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.discard(conn);
        }
    }
}

impl<T: Transport> Deref for Lease<T> {
    type Target = T::Conn;

    fn deref(&self) -> &T::Conn {
        self.conn.as_ref().expect("lease already surrendered")
    }
}

impl<T: Transport> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T::Conn {
        self.conn.as_mut().expect("lease already surrendered")
    }
}

impl<T: Transport> Drop for Lease<T> {
    fn drop(&mut self) {
        // No explicit verdict means the connection state is unknown.
        if let Some(conn) = self.conn.take() {
            self.shared.discard(conn);
        }
    }
}

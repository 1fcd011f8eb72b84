//! Resilience engine for multi-server article access.
//!
//! The layering, leaf to root:
//!
//! ```text
//!                     ServerRouter
//!          (failover, hot reload, metadata caches)
//!               |                         |
//!          HealthTracker            ServerMux (per server)
//!       (circuit breakers)       (borrow + retry-once)
//!                                         |
//!                                  ConnectionPool
//!                              (bounded, LIFO, sweeper)
//!                                         |
//!                                  NntpSession
//!                        (serialized commands, deferred
//!                          release into body streams)
//! ```
//!
//! Everything above the pool deals in [`newsreel_core::Error`] families:
//! connection and protocol failures feed circuit breakers and trigger
//! failover, authoritative not-found answers do not, and caller-side
//! interruptions pass through untouched.

pub mod cache;
pub mod health;
pub mod mux;
pub mod pool;
pub mod router;
pub mod session;

pub use cache::{CacheConfig, CacheStats, HeaderCache, MissingCache};
pub use health::{CircuitConfig, HealthTracker, ServerHealth};
pub use mux::{NntpTransport, SegmentBody, ServerMux};
pub use pool::{ConnectionPool, Lease, PoolConfig, PoolStats, Transport};
pub use router::{RouterConfig, ServerRouter};
pub use session::NntpSession;

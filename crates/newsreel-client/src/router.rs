//! Failover across the server fleet.
//!
//! ## Candidate order
//!
//! The fleet is the enabled servers sorted by `(priority, id)`. An operation
//! first tries the servers whose circuits admit traffic; when every circuit
//! is open it falls back to the full fleet, so a total outage still probes
//! rather than failing from memory alone.
//!
//! ## Outcome accounting
//!
//! Per candidate: success returns immediately and closes the circuit. A
//! definitive not-found also counts as a *success* for health purposes (the
//! server answered authoritatively) and either surfaces at once or moves on,
//! depending on whether the operation opted into cross-server retries.
//! Server faults are charged to the circuit and the next candidate runs.
//! Acquire timeouts and cancellations say nothing about any server and
//! propagate unchanged.
//!
//! On exhaustion the caller gets the story of the *first* candidate: if any
//! server actually faulted, [`Error::AllServersFailed`] wrapping the first
//! fault; if every candidate answered not-found, that first not-found
//! itself.
//!
//! ## Hot reload
//!
//! `update_servers` builds the replacement fleet off to the side, swaps it
//! in under a short write lock, and disposes the old pools outside the lock.
//! Operations that raced the swap hold the old snapshot and see `Disposed`
//! from its pools, which is retryable and never charged to health.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use newsreel_core::{
    ByteStream, DeclaredRange, Error, Result, SegmentCodec, SegmentId, ServerConfig,
};

use crate::cache::{CacheConfig, CacheStats, HeaderCache, MissingCache};
use crate::health::{CircuitConfig, HealthTracker, ServerHealth};
use crate::mux::ServerMux;
use crate::pool::PoolConfig;

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub pool: PoolConfig,
    pub circuit: CircuitConfig,
    pub cache: CacheConfig,
    /// Slots per server that header and body operations leave free, so
    /// existence probes always find a connection promptly. Probes themselves
    /// acquire with no reservation.
    pub probe_reserved: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            pool: PoolConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            probe_reserved: 1,
        }
    }
}

type Fleet = Arc<Vec<Arc<ServerMux>>>;

/// Owns the per-server multiplexers and routes every article operation to
/// the best server currently worth talking to.
pub struct ServerRouter {
    fleet: RwLock<Fleet>,
    health: HealthTracker,
    headers: HeaderCache,
    missing: MissingCache,
    cfg: RouterConfig,
    disposed: AtomicBool,
}

impl ServerRouter {
    pub fn new(servers: Vec<ServerConfig>, cfg: RouterConfig) -> Result<Self> {
        let fleet = build_fleet(&servers, &cfg.pool)?;
        tracing::info!(servers = fleet.len(), "router started");
        Ok(ServerRouter {
            fleet: RwLock::new(Arc::new(fleet)),
            health: HealthTracker::new(cfg.circuit.clone()),
            headers: HeaderCache::new(cfg.cache.capacity, cfg.cache.ttl),
            missing: MissingCache::new(cfg.cache.missing_capacity, cfg.cache.missing_ttl),
            cfg,
            disposed: AtomicBool::new(false),
        })
    }

    /// Existence probe. Does not retry across servers on not-found: one
    /// authoritative "no" is the answer the integrity checker wants, and a
    /// fresh verdict lands in the known-missing cache.
    pub async fn check_available(&self, id: &SegmentId) -> Result<()> {
        if self.missing.is_known_missing(id).await {
            return Err(Error::not_found(id.as_str()));
        }
        let result = self
            .execute(false, |mux| {
                let id = id.clone();
                async move { mux.check_available(&id, 0).await }
            })
            .await;
        if let Err(e) = &result {
            if e.is_not_found() {
                self.missing.note(id).await;
            }
        }
        result
    }

    /// Declared placement of one segment, from cache or by fetching its
    /// header. Retries across servers on not-found, because retention
    /// differs per provider. A header the codec cannot place is treated as a
    /// protocol fault of the serving server, so the next candidate gets its
    /// chance at a usable copy.
    pub async fn segment_range(
        &self,
        id: &SegmentId,
        codec: &dyn SegmentCodec,
    ) -> Result<DeclaredRange> {
        if let Some(range) = self.headers.get(id).await {
            return Ok(range);
        }
        let reserved = self.cfg.probe_reserved;
        let range = self
            .execute(true, |mux| {
                let id = id.clone();
                async move {
                    let header = mux.fetch_header(&id, reserved).await?;
                    match codec.parse_header(&header) {
                        Some(range) => Ok(range),
                        None => Err(Error::protocol(
                            mux.id(),
                            format!("article <{id}>: header declares no byte range"),
                        )),
                    }
                }
            })
            .await?;
        self.headers.insert(id.clone(), range).await;
        Ok(range)
    }

    /// Open one segment's decoded payload stream. The underlying connection
    /// rides inside the stream and returns to its pool only when the body is
    /// drained or dropped.
    pub async fn open_segment(
        &self,
        id: &SegmentId,
        codec: &dyn SegmentCodec,
    ) -> Result<ByteStream> {
        let reserved = self.cfg.probe_reserved;
        let body = self
            .execute(true, |mux| {
                let id = id.clone();
                async move { mux.open_segment(&id, reserved).await }
            })
            .await?;
        Ok(codec.decode(Box::pin(body)))
    }

    /// Replace the server set atomically. In-flight operations finish
    /// against the fleet they started with; new operations see the new one.
    /// Health state is keyed by server id and deliberately survives.
    pub async fn update_servers(&self, servers: Vec<ServerConfig>) -> Result<()> {
        self.ensure_live()?;
        let fresh = build_fleet(&servers, &self.cfg.pool)?;
        tracing::info!(servers = fresh.len(), "replacing server fleet");
        let stale = {
            let mut fleet = self.fleet.write().await;
            // Disposal may have finished while the fleet was being built;
            // swapping live pools into a disposed router would leak them.
            if self.disposed.load(Ordering::SeqCst) {
                drop(fleet);
                for mux in &fresh {
                    mux.dispose().await;
                }
                return Err(Error::Disposed("server router"));
            }
            std::mem::replace(&mut *fleet, Arc::new(fresh))
        };
        // Old pools are torn down outside the lock; teardown is best-effort
        // per server and one server cannot block the rest from draining.
        for mux in stale.iter() {
            mux.dispose().await;
        }
        Ok(())
    }

    /// Health rows in fleet order, pool counters included.
    pub async fn server_health(&self) -> Vec<ServerHealth> {
        let fleet = self.fleet.read().await.clone();
        fleet
            .iter()
            .map(|mux| {
                let mut row = self.health.health_of(mux.id());
                row.connections = Some(mux.stats());
                row
            })
            .collect()
    }

    /// Clear one server's circuit without waiting out the cooldown.
    pub fn reset_health(&self, server: &str) {
        self.health.reset(server);
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.headers.stats().await
    }

    /// Drain every pool. Idempotent; operations after this fail fast.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let stale = {
            let mut fleet = self.fleet.write().await;
            std::mem::replace(&mut *fleet, Arc::new(Vec::new()))
        };
        for mux in stale.iter() {
            mux.dispose().await;
        }
        tracing::debug!("router disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed("server router"));
        }
        Ok(())
    }

    /// The failover driver. Runs `op` against candidates in order and does
    /// all health bookkeeping; every typed operation above is one closure
    /// handed to this.
    async fn execute<R, F, Fut>(&self, retry_on_not_found: bool, op: F) -> Result<R>
    where
        F: Fn(Arc<ServerMux>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.ensure_live()?;
        let fleet = self.fleet.read().await.clone();
        let candidates = pick_candidates(&fleet, &self.health);

        let mut attempts = 0usize;
        let mut first_fault: Option<Error> = None;
        let mut first_missing: Option<Error> = None;

        for mux in &candidates {
            attempts += 1;
            match op(mux.clone()).await {
                Ok(value) => {
                    self.health.record_success(mux.id());
                    return Ok(value);
                }
                Err(e) if e.is_not_found() => {
                    // An authoritative answer; the server held up its end.
                    self.health.record_success(mux.id());
                    if !retry_on_not_found {
                        return Err(e);
                    }
                    tracing::debug!(server = %mux.id(), "article not present, trying next server");
                    first_missing.get_or_insert(e);
                }
                Err(e) if e.is_retryable_on_next_server() => {
                    self.health.record_failure(mux.id(), &e);
                    tracing::debug!(server = %mux.id(), error = %e, "server failed, trying next");
                    first_fault.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match (first_fault, first_missing) {
            (Some(first), _) => {
                tracing::warn!(attempts, error = %first, "all servers failed");
                Err(Error::AllServersFailed {
                    attempts,
                    first: Box::new(first),
                })
            }
            (None, Some(missing)) => Err(missing),
            // Construction and reload both reject configurations that leave
            // the fleet empty, so candidates always has at least one entry.
            (None, None) => Err(Error::Config("no enabled servers".into())),
        }
    }
}

/// Servers whose circuits admit traffic, or the whole fleet when none do.
fn pick_candidates(fleet: &Fleet, health: &HealthTracker) -> Vec<Arc<ServerMux>> {
    let available: Vec<Arc<ServerMux>> = fleet
        .iter()
        .filter(|mux| health.is_available(mux.id()))
        .cloned()
        .collect();
    if available.is_empty() {
        fleet.as_ref().clone()
    } else {
        available
    }
}

fn build_fleet(servers: &[ServerConfig], pool_cfg: &PoolConfig) -> Result<Vec<Arc<ServerMux>>> {
    let mut seen = HashSet::new();
    for server in servers {
        server.validate()?;
        if !seen.insert(server.id.as_str()) {
            return Err(Error::Config(format!("duplicate server id {}", server.id)));
        }
    }
    let mut fleet: Vec<Arc<ServerMux>> = servers
        .iter()
        .filter(|server| server.enabled)
        .map(|server| Arc::new(ServerMux::new(server.clone(), pool_cfg)))
        .collect();
    if fleet.is_empty() {
        return Err(Error::Config("no enabled servers".into()));
    }
    fleet.sort_by(|a, b| {
        (a.config().priority, &a.config().id).cmp(&(b.config().priority, &b.config().id))
    });
    Ok(fleet)
}

// ============================================================================
// Tests. Fleets here are built from descriptors that never get dialed;
// cross-server behavior against a live wire lives in tests/failover.rs.
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, priority: u8) -> ServerConfig {
        let mut cfg = ServerConfig::new(id, "news.invalid", 119);
        cfg.priority = priority;
        cfg
    }

    fn fleet_ids(fleet: &[Arc<ServerMux>]) -> Vec<&str> {
        fleet.iter().map(|mux| mux.id()).collect()
    }

    #[tokio::test]
    async fn fleet_orders_by_priority_then_id() {
        let fleet = build_fleet(
            &[server("zeta", 0), server("beta", 1), server("alpha", 0)],
            &PoolConfig::default(),
        )
        .unwrap();
        assert_eq!(fleet_ids(&fleet), ["alpha", "zeta", "beta"]);
    }

    #[tokio::test]
    async fn fleet_skips_disabled_servers() {
        let mut off = server("off", 0);
        off.enabled = false;
        let fleet = build_fleet(&[off, server("on", 1)], &PoolConfig::default()).unwrap();
        assert_eq!(fleet_ids(&fleet), ["on"]);
    }

    #[tokio::test]
    async fn fleet_rejects_duplicates_and_empty_sets() {
        let dup = build_fleet(
            &[server("s1", 0), server("s1", 1)],
            &PoolConfig::default(),
        );
        assert!(matches!(dup, Err(Error::Config(_))));

        assert!(matches!(
            build_fleet(&[], &PoolConfig::default()),
            Err(Error::Config(_))
        ));

        let mut off = server("s1", 0);
        off.enabled = false;
        assert!(matches!(
            build_fleet(&[off], &PoolConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn open_circuits_are_skipped_until_none_remain() {
        let fleet = Arc::new(
            build_fleet(
                &[server("s1", 0), server("s2", 1)],
                &PoolConfig::default(),
            )
            .unwrap(),
        );
        let health = HealthTracker::new(CircuitConfig {
            failure_threshold: 1,
            cooldown: std::time::Duration::from_secs(60),
        });

        health.record_failure("s1", &Error::connect("s1", "refused"));
        assert_eq!(
            fleet_ids(&pick_candidates(&fleet, &health)),
            ["s2"],
            "open circuit must be routed around"
        );

        health.record_failure("s2", &Error::connect("s2", "refused"));
        assert_eq!(
            fleet_ids(&pick_candidates(&fleet, &health)),
            ["s1", "s2"],
            "with every circuit open the full fleet is probed"
        );
    }

    #[tokio::test]
    async fn reload_swaps_the_visible_fleet() {
        let router =
            ServerRouter::new(vec![server("s1", 0)], RouterConfig::default()).unwrap();
        router
            .update_servers(vec![server("s2", 0), server("s3", 1)])
            .await
            .unwrap();

        let rows = router.server_health().await;
        let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, ["s2", "s3"]);
        assert!(rows[0].connections.is_some());
    }

    #[tokio::test]
    async fn reload_rejects_bad_configs_and_keeps_the_old_fleet() {
        let router =
            ServerRouter::new(vec![server("s1", 0)], RouterConfig::default()).unwrap();
        let err = router.update_servers(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let rows = router.server_health().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "s1");
    }

    #[tokio::test]
    async fn disposed_router_fails_fast() {
        let router =
            ServerRouter::new(vec![server("s1", 0)], RouterConfig::default()).unwrap();
        router.dispose().await;
        router.dispose().await; // idempotent

        let err = router
            .check_available(&SegmentId::new("x@test"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disposed(_)));

        let err = router.update_servers(vec![server("s2", 0)]).await.unwrap_err();
        assert!(matches!(err, Error::Disposed(_)));
        assert!(router.server_health().await.is_empty());
    }

    #[tokio::test]
    async fn health_survives_reload_for_matching_ids() {
        let router =
            ServerRouter::new(vec![server("s1", 0)], RouterConfig::default()).unwrap();
        router
            .health
            .record_failure("s1", &Error::connect("s1", "refused"));

        router
            .update_servers(vec![server("s1", 0), server("s2", 1)])
            .await
            .unwrap();

        let rows = router.server_health().await;
        assert_eq!(rows[0].total_failures, 1, "s1 keeps its record");
        assert_eq!(rows[1].total_failures, 0);
    }
}

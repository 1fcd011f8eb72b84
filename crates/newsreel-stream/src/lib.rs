//! Seekable file access over segmented Usenet content.
//!
//! Binary content on Usenet arrives as ordered articles, each carrying one
//! slice of the original file. This crate turns such a catalog back into a
//! byte-addressable file:
//!
//! ```text
//!                        Newsreel (facade)
//!         /                    |                    \
//!   SegmentedStream      IntegrityChecker      health / reload
//!   (AsyncRead + Seek)   (sampled presence)         |
//!         |                    |                    |
//!   SegmentLocator  ----  SegmentStore  ----  ServerRouter
//!   (offset -> id)        (trait seam)     (newsreel-client)
//! ```
//!
//! The [`SegmentStore`] trait is the seam between byte-level logic and the
//! server fleet: production routes through [`newsreel_client::ServerRouter`]
//! with failover and caching, while tests drive the same stream and locator
//! code over in-memory fixtures.
//!
//! # Example
//!
//! ```no_run
//! use newsreel_stream::{catalog, Newsreel, RawCodec, ServerConfig};
//! use tokio::io::{AsyncReadExt, AsyncSeekExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Newsreel::builder()
//!         .server(ServerConfig::new("primary", "news.example.com", 119))
//!         .codec(RawCodec)
//!         .build()
//!         .await?;
//!
//!     let segments = catalog(["part1@example", "part2@example"]);
//!     let mut stream = client.open_stream(segments, None);
//!     stream.seek(std::io::SeekFrom::Start(1 << 20)).await?;
//!     let mut chunk = vec![0u8; 4096];
//!     stream.read_exact(&mut chunk).await?;
//!     Ok(())
//! }
//! ```

pub mod integrity;
pub mod locate;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;

use newsreel_client::ServerRouter;

pub use integrity::{IntegrityChecker, IntegrityReport, IntegrityRequest};
pub use locate::{Located, SegmentLocator, SegmentStore};
pub use stream::SegmentedStream;

pub use newsreel_client::{
    CacheConfig, CacheStats, CircuitConfig, PoolConfig, RouterConfig, ServerHealth,
};
pub use newsreel_core::{
    byte_stream_from, catalog, ByteStream, Credentials, DeclaredRange, Error, RawCodec, Result,
    Segment, SegmentCodec, SegmentId, ServerConfig,
};

/// [`SegmentStore`] backed by the server fleet: placements come from header
/// probes (cached by the router) and bodies are decoded by the configured
/// codec.
struct RoutedStore {
    router: Arc<ServerRouter>,
    codec: Arc<dyn SegmentCodec>,
}

#[async_trait]
impl SegmentStore for RoutedStore {
    async fn range_of(&self, id: &SegmentId) -> Result<DeclaredRange> {
        self.router.segment_range(id, self.codec.as_ref()).await
    }

    async fn open(&self, id: &SegmentId) -> Result<ByteStream> {
        self.router.open_segment(id, self.codec.as_ref()).await
    }
}

/// Handle to the whole client: streams, integrity checks, fleet health and
/// zero-downtime reconfiguration. Cheap to clone; all clones share the same
/// pools and caches.
#[derive(Clone)]
pub struct Newsreel {
    router: Arc<ServerRouter>,
    store: Arc<dyn SegmentStore>,
    checker: IntegrityChecker,
}

impl std::fmt::Debug for Newsreel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Newsreel").finish_non_exhaustive()
    }
}

impl Newsreel {
    pub fn builder() -> NewsreelBuilder {
        NewsreelBuilder::default()
    }

    /// Open the catalog as one seekable byte stream. Nothing is fetched
    /// until the first read; pass `total_length` when the catalog knows it
    /// to spare the end-of-file probe.
    pub fn open_stream(&self, segments: Vec<Segment>, total_length: Option<u64>) -> SegmentedStream {
        let locator = SegmentLocator::new(Arc::clone(&self.store), segments, total_length);
        SegmentedStream::new(Arc::new(locator))
    }

    /// Byte length of the file: the last segment's declared offset plus
    /// size, one header probe when not already cached.
    pub async fn file_size(&self, segments: &[Segment]) -> Result<u64> {
        match segments.last() {
            None => Ok(0),
            Some(last) => Ok(self.store.range_of(&last.id).await?.end()),
        }
    }

    /// Verify a file's presence by sampled existence checks. See
    /// [`IntegrityChecker::check`] for the outcome contract.
    pub async fn check_integrity(&self, request: IntegrityRequest) -> Result<IntegrityReport> {
        self.checker.check(request).await
    }

    /// Per-server health rows in failover order.
    pub async fn server_health(&self) -> Vec<ServerHealth> {
        self.router.server_health().await
    }

    /// Clear one server's circuit without waiting out the cooldown.
    pub fn reset_health(&self, server: &str) {
        self.router.reset_health(server);
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.router.cache_stats().await
    }

    /// Replace the server fleet with zero downtime. In-flight operations
    /// finish on the fleet they started with.
    pub async fn update_servers(&self, servers: Vec<ServerConfig>) -> Result<()> {
        self.router.update_servers(servers).await
    }

    /// Tear down every pool. Streams already open fail their next read.
    pub async fn dispose(&self) {
        self.router.dispose().await;
    }
}

/// Configuration for [`Newsreel`]. A codec and at least one enabled server
/// are required; everything else has defaults.
pub struct NewsreelBuilder {
    servers: Vec<ServerConfig>,
    codec: Option<Arc<dyn SegmentCodec>>,
    config: RouterConfig,
}

impl Default for NewsreelBuilder {
    fn default() -> Self {
        NewsreelBuilder {
            servers: Vec::new(),
            codec: None,
            config: RouterConfig::default(),
        }
    }
}

impl NewsreelBuilder {
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    pub fn servers(mut self, servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        self.servers.extend(servers);
        self
    }

    /// Codec that places and decodes article payloads (yEnc in production,
    /// [`RawCodec`] in tests and demos).
    pub fn codec(mut self, codec: impl SegmentCodec + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Connection slots per server reserved for existence probes.
    pub fn probe_reserved(mut self, slots: usize) -> Self {
        self.config.probe_reserved = slots;
        self
    }

    /// Must run inside a tokio runtime; each server's pool spawns its idle
    /// sweeper on construction.
    pub async fn build(self) -> Result<Newsreel> {
        let codec = self
            .codec
            .ok_or_else(|| Error::Config("a segment codec is required".into()))?;
        let router = Arc::new(ServerRouter::new(self.servers, self.config)?);
        let store: Arc<dyn SegmentStore> = Arc::new(RoutedStore {
            router: Arc::clone(&router),
            codec,
        });
        let checker = IntegrityChecker::new(Arc::clone(&router));
        Ok(Newsreel {
            router,
            store,
            checker,
        })
    }
}

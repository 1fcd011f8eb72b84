//! One server's multiplexer: pooled connections plus a single local retry.
//!
//! A protocol fault means the connection is desynced, not necessarily that
//! the server is down, so the multiplexer replaces the connection and tries
//! the operation once more on a fresh one. A second failure, and every
//! non-protocol failure, propagates to the failover layer. For body fetches
//! the retry window covers only the command exchange: once payload bytes
//! have flowed, recovery belongs to the caller, who knows what offset it
//! already consumed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

use newsreel_core::{Error, Result, SegmentId, ServerConfig};
use newsreel_nntp::NntpConnection;

use crate::pool::{ConnectionPool, Lease, PoolConfig, PoolStats, Transport};
use crate::session::{NntpSession, OwnedBody};

/// Dials one configured server and wraps connections for serialized use.
pub struct NntpTransport {
    config: ServerConfig,
    connect_timeout: Duration,
}

#[async_trait]
impl Transport for NntpTransport {
    type Conn = NntpSession;

    async fn open(&self) -> Result<NntpSession> {
        let conn = NntpConnection::connect(&self.config, self.connect_timeout).await?;
        Ok(NntpSession::new(conn))
    }

    fn is_open(&self, conn: &NntpSession) -> bool {
        conn.is_open()
    }

    async fn close(&self, conn: NntpSession) {
        conn.close().await;
    }
}

pub struct ServerMux {
    config: ServerConfig,
    pool: ConnectionPool<NntpTransport>,
}

impl ServerMux {
    pub fn new(config: ServerConfig, pool_cfg: &PoolConfig) -> Self {
        let cfg = PoolConfig {
            capacity: config.max_connections,
            ..pool_cfg.clone()
        };
        let transport = NntpTransport {
            config: config.clone(),
            connect_timeout: pool_cfg.connect_timeout,
        };
        let pool = ConnectionPool::new(&config.id, cfg, transport);
        ServerMux { config, pool }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn dispose(&self) {
        self.pool.dispose().await;
    }

    /// Existence probe on this server.
    pub async fn check_available(&self, id: &SegmentId, reserved: usize) -> Result<()> {
        self.with_command(reserved, |session| {
            let id = id.clone();
            async move { session.stat(&id).await }
        })
        .await
    }

    /// Header block fetch on this server.
    pub async fn fetch_header(&self, id: &SegmentId, reserved: usize) -> Result<Vec<u8>> {
        self.with_command(reserved, |session| {
            let id = id.clone();
            async move { session.head(&id).await }
        })
        .await
    }

    /// Open a body stream. The pooled connection travels inside the returned
    /// [`SegmentBody`] and only returns to the pool when the stream is fully
    /// drained (release) or abandoned (replace).
    pub async fn open_segment(&self, id: &SegmentId, reserved: usize) -> Result<SegmentBody> {
        let lease = self.pool.acquire(reserved).await?;
        let session = (*lease).clone();
        match session.open_body(id).await {
            Ok(body) => Ok(SegmentBody::new(body, lease)),
            Err(first) if matches!(first, Error::Protocol { .. }) => {
                lease.replace();
                tracing::debug!(
                    server = %self.config.id,
                    article = %id,
                    error = %first,
                    "protocol fault opening body, retrying on a fresh connection"
                );
                let retry_lease = self.pool.acquire(reserved).await?;
                let retry_session = (*retry_lease).clone();
                match retry_session.open_body(id).await {
                    Ok(body) => Ok(SegmentBody::new(body, retry_lease)),
                    Err(second) => {
                        settle(retry_lease, &second);
                        Err(second)
                    }
                }
            }
            Err(e) => {
                settle(lease, &e);
                Err(e)
            }
        }
    }

    /// Borrow a connection, run one command, and retry exactly once on a
    /// protocol fault after replacing the connection.
    async fn with_command<R, F, Fut>(&self, reserved: usize, op: F) -> Result<R>
    where
        F: Fn(NntpSession) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lease = self.pool.acquire(reserved).await?;
        match op((*lease).clone()).await {
            Ok(value) => {
                lease.release();
                Ok(value)
            }
            Err(first) if matches!(first, Error::Protocol { .. }) => {
                lease.replace();
                tracing::debug!(
                    server = %self.config.id,
                    error = %first,
                    "protocol fault, retrying once on a fresh connection"
                );
                let retry_lease = self.pool.acquire(reserved).await?;
                match op((*retry_lease).clone()).await {
                    Ok(value) => {
                        retry_lease.release();
                        Ok(value)
                    }
                    Err(second) => {
                        settle(retry_lease, &second);
                        Err(second)
                    }
                }
            }
            Err(e) => {
                settle(lease, &e);
                Err(e)
            }
        }
    }
}

/// Give the lease the verdict its error deserves.
fn settle(lease: Lease<NntpTransport>, err: &Error) {
    if err.poisons_connection() {
        lease.replace();
    } else {
        lease.release();
    }
}

enum BodyState {
    Streaming {
        body: OwnedBody,
        lease: Lease<NntpTransport>,
    },
    Done,
}

type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

fn chunk_stream(body: OwnedBody, lease: Lease<NntpTransport>) -> ChunkStream {
    let initial = BodyState::Streaming { body, lease };
    Box::pin(futures::stream::unfold(initial, |state| async move {
        match state {
            BodyState::Streaming { mut body, lease } => match body.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), BodyState::Streaming { body, lease })),
                Ok(None) => {
                    // Terminator consumed: the connection is back in command
                    // state and safe to reuse.
                    drop(body);
                    lease.release();
                    None
                }
                Err(e) => {
                    drop(body);
                    lease.replace();
                    Some((Err(e.into_io()), BodyState::Done))
                }
            },
            BodyState::Done => None,
        }
    }))
}

/// Raw (dot-destuffed, still encoded) article body as an `AsyncRead`.
///
/// Dropping it mid-stream counts as abandoning the connection: the lease is
/// replaced, never reused. Reading to EOF releases the connection for reuse.
pub struct SegmentBody {
    inner: StreamReader<ChunkStream, Bytes>,
}

impl SegmentBody {
    fn new(body: OwnedBody, lease: Lease<NntpTransport>) -> Self {
        SegmentBody {
            inner: StreamReader::new(chunk_stream(body, lease)),
        }
    }
}

impl AsyncRead for SegmentBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

//! Serialized access to one NNTP connection.
//!
//! NNTP is strictly one command in flight per connection. `NntpSession`
//! enforces that with an internal async mutex: plain commands hold it for
//! the duration of the exchange, and `open_body` moves an owned guard into
//! the returned [`OwnedBody`], so the connection stays locked until the
//! multiline payload has been drained past its terminator. That handoff is
//! what makes deferred pool release sound: whoever holds the body holds the
//! connection.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, OwnedMutexGuard};

use newsreel_core::{Result, SegmentId};
use newsreel_nntp::NntpConnection;

/// Cloneable handle; clones share one underlying connection and serialize
/// against each other.
#[derive(Clone)]
pub struct NntpSession {
    conn: Arc<Mutex<NntpConnection>>,
}

impl NntpSession {
    pub fn new(conn: NntpConnection) -> Self {
        NntpSession {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Existence probe.
    pub async fn stat(&self, id: &SegmentId) -> Result<()> {
        self.conn.lock().await.stat(id).await
    }

    /// Complete header block.
    pub async fn head(&self, id: &SegmentId) -> Result<Vec<u8>> {
        self.conn.lock().await.head(id).await
    }

    /// Start a body fetch. On success the session's lock travels inside the
    /// returned [`OwnedBody`] and is only released when it is dropped.
    pub async fn open_body(&self, id: &SegmentId) -> Result<OwnedBody> {
        let mut guard = self.conn.clone().lock_owned().await;
        guard.begin_body(id).await?;
        Ok(OwnedBody { guard })
    }

    /// Best-effort QUIT.
    pub async fn close(&self) {
        self.conn.lock().await.close().await;
    }

    /// Liveness as far as the pool is concerned. A locked session is by
    /// definition in use and therefore alive.
    pub fn is_open(&self) -> bool {
        self.conn.try_lock().map(|conn| conn.is_open()).unwrap_or(true)
    }
}

/// In-flight body payload holding the connection lock.
pub struct OwnedBody {
    guard: OwnedMutexGuard<NntpConnection>,
}

impl OwnedBody {
    /// Next dot-destuffed chunk; `Ok(None)` means the terminator was
    /// consumed and the connection is reusable again.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.guard.read_body_chunk().await
    }
}

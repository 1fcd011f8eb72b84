//! Seekable reads over segmented content.
//!
//! `SegmentedStream` presents the concatenated payloads of a segment
//! catalog as one logical file implementing `AsyncRead + AsyncSeek`. The
//! reader never sees article boundaries: reads that exhaust one segment
//! roll over to the next, and seeks resolve through the locator so only
//! the covering segment is fetched.
//!
//! ## Segment transitions
//!
//! At most one segment body is open at a time. A read is served from the
//! open body up to its declared end; crossing the end verifies the body is
//! exactly spent, drops it (returning the connection), and opens the next
//! segment on the following poll. Bodies that end early or run past their
//! declared range surface as I/O errors rather than silent corruption.
//!
//! ## Seek handling
//!
//! A forward seek that stays inside the open segment discards bytes from
//! the live body instead of reopening, so small skips keep their
//! connection. Every other seek drops the body and re-locates lazily on
//! the next read. `SeekFrom::End` may need a header probe to learn the
//! total length when the catalog did not declare one.

use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, ReadBuf};

use newsreel_core::{ByteStream, Error, Result};

use crate::locate::SegmentLocator;

type OpenFuture = BoxFuture<'static, Result<Option<(ByteStream, u64)>>>;
type LenFuture = BoxFuture<'static, Result<u64>>;

const SKIP_CHUNK: usize = 8192;

enum State {
    /// Nothing open; the next read locates the segment covering `pos`.
    Idle,
    /// Locating and opening the covering segment.
    Opening(OpenFuture),
    /// Serving from an open body that covers bytes up to `seg_end`.
    Reading { body: ByteStream, seg_end: u64 },
    /// Resolving the total length for a `SeekFrom::End`.
    Resolving { fut: LenFuture, delta: i64 },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Opening(_) => "opening",
            State::Reading { .. } => "reading",
            State::Resolving { .. } => "resolving",
        }
    }
}

/// One logical file assembled from a segment catalog.
pub struct SegmentedStream {
    locator: Arc<SegmentLocator>,
    pos: u64,
    /// Bytes still to discard from the open body before serving reads.
    pending_skip: u64,
    state: State,
    disposed: bool,
}

impl SegmentedStream {
    pub fn new(locator: Arc<SegmentLocator>) -> Self {
        SegmentedStream {
            locator,
            pos: 0,
            pending_skip: 0,
            state: State::Idle,
            disposed: false,
        }
    }

    /// Current read position in file bytes.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn locator(&self) -> &Arc<SegmentLocator> {
        &self.locator
    }

    /// Total byte length of the file, probing the last segment if the
    /// catalog did not declare one.
    pub async fn total_len(&self) -> Result<u64> {
        self.locator.total_len().await
    }

    /// Drop any open body and fail all further reads and seeks. Safe to
    /// call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.pending_skip = 0;
        self.state = State::Idle;
        tracing::debug!(pos = self.pos, "segmented stream disposed");
    }

    /// Move the read position, keeping the open body when the target lies
    /// ahead of `pos` but within the same segment.
    fn apply_seek(&mut self, target: u64) {
        if target == self.pos {
            return;
        }
        if let State::Reading { seg_end, .. } = &self.state {
            if target > self.pos && target <= *seg_end {
                self.pending_skip += target - self.pos;
                self.pos = target;
                return;
            }
        }
        self.pending_skip = 0;
        self.pos = target;
        self.state = State::Idle;
    }
}

/// Locate and open the segment covering `pos`, discarding any leading
/// bytes so the returned body starts exactly at the target. `None` means
/// `pos` is at or past the end of the file.
async fn open_at(locator: Arc<SegmentLocator>, pos: u64) -> Result<Option<(ByteStream, u64)>> {
    let Some(located) = locator.locate(pos).await? else {
        return Ok(None);
    };
    let segment = locator.segment(located.index);
    let mut body = locator.store().open(&segment.id).await?;

    let intra = pos - located.range.file_offset;
    if intra > 0 {
        tracing::trace!(segment = %segment.id, skip = intra, "discarding to the seek target");
        let mut limited = body.take(intra);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped < intra {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "article <{}> body ended {} bytes before the seek target",
                    segment.id,
                    intra - skipped
                ),
            )));
        }
        body = limited.into_inner();
    }
    Ok(Some((body, located.range.end())))
}

fn short_body() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "segment body ended before its declared range",
    )
}

fn overlong_body() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "segment body ran past its declared range",
    )
}

impl AsyncRead for SegmentedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.disposed {
            return Poll::Ready(Err(Error::Disposed("segmented stream").into_io()));
        }

        loop {
            match &mut this.state {
                State::Idle => {
                    this.pending_skip = 0;
                    let locator = Arc::clone(&this.locator);
                    let pos = this.pos;
                    this.state = State::Opening(Box::pin(open_at(locator, pos)));
                }

                State::Opening(fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(Some((body, seg_end))) => {
                        this.state = State::Reading { body, seg_end };
                    }
                    Ok(None) => {
                        // End of file: leave nothing filled.
                        this.state = State::Idle;
                        return Poll::Ready(Ok(()));
                    }
                    Err(err) => {
                        this.state = State::Idle;
                        return Poll::Ready(Err(err.into_io()));
                    }
                },

                State::Reading { body, seg_end } => {
                    let seg_end = *seg_end;

                    if this.pending_skip > 0 {
                        let mut scratch = [0u8; SKIP_CHUNK];
                        let want = this.pending_skip.min(SKIP_CHUNK as u64) as usize;
                        let mut limited = ReadBuf::new(&mut scratch[..want]);
                        match ready!(body.as_mut().poll_read(cx, &mut limited)) {
                            Ok(()) => {
                                let n = limited.filled().len();
                                if n == 0 {
                                    this.state = State::Idle;
                                    return Poll::Ready(Err(short_body()));
                                }
                                this.pending_skip -= n as u64;
                                continue;
                            }
                            Err(err) => {
                                this.state = State::Idle;
                                return Poll::Ready(Err(err));
                            }
                        }
                    }

                    let remaining = seg_end - this.pos;
                    if remaining == 0 {
                        // The declared range is spent; the body must be too.
                        let mut scratch = [0u8; 32];
                        let mut probe = ReadBuf::new(&mut scratch);
                        match ready!(body.as_mut().poll_read(cx, &mut probe)) {
                            Ok(()) if probe.filled().is_empty() => {
                                this.state = State::Idle;
                                continue;
                            }
                            Ok(()) => {
                                this.state = State::Idle;
                                return Poll::Ready(Err(overlong_body()));
                            }
                            Err(err) => {
                                this.state = State::Idle;
                                return Poll::Ready(Err(err));
                            }
                        }
                    }

                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }

                    let want = remaining.min(buf.remaining() as u64) as usize;
                    let n = {
                        let dst = buf.initialize_unfilled_to(want);
                        let mut limited = ReadBuf::new(dst);
                        match ready!(body.as_mut().poll_read(cx, &mut limited)) {
                            Ok(()) => limited.filled().len(),
                            Err(err) => {
                                this.state = State::Idle;
                                return Poll::Ready(Err(err));
                            }
                        }
                    };
                    if n == 0 {
                        this.state = State::Idle;
                        return Poll::Ready(Err(short_body()));
                    }
                    buf.advance(n);
                    this.pos += n as u64;
                    return Poll::Ready(Ok(()));
                }

                // A read issued between start_seek and poll_complete; finish
                // the pending seek resolution first.
                State::Resolving { .. } => {
                    ready!(Pin::new(&mut *this).poll_complete(cx))?;
                }
            }
        }
    }
}

impl AsyncSeek for SegmentedStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if this.disposed {
            return Err(Error::Disposed("segmented stream").into_io());
        }
        match position {
            SeekFrom::Start(offset) => {
                this.apply_seek(offset);
                Ok(())
            }
            SeekFrom::Current(delta) => {
                let target = this.pos.checked_add_signed(delta).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek before byte 0")
                })?;
                this.apply_seek(target);
                Ok(())
            }
            SeekFrom::End(delta) => {
                let locator = Arc::clone(&this.locator);
                this.state = State::Resolving {
                    fut: Box::pin(async move { locator.total_len().await }),
                    delta,
                };
                Ok(())
            }
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        if let State::Resolving { fut, delta } = &mut this.state {
            let delta = *delta;
            match ready!(fut.as_mut().poll(cx)) {
                Ok(total) => match total.checked_add_signed(delta) {
                    Some(target) => {
                        this.state = State::Idle;
                        this.apply_seek(target);
                    }
                    None => {
                        this.state = State::Idle;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "seek before byte 0",
                        )));
                    }
                },
                Err(err) => {
                    this.state = State::Idle;
                    return Poll::Ready(Err(err.into_io()));
                }
            }
        }
        Poll::Ready(Ok(this.pos))
    }
}

impl fmt::Debug for SegmentedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedStream")
            .field("pos", &self.pos)
            .field("segments", &self.locator.segment_count())
            .field("state", &self.state.name())
            .field("disposed", &self.disposed)
            .finish()
    }
}

// ============================================================================
// Tests. The store serves in-memory payloads, so every byte the stream
// returns can be checked against the flat reference buffer.
// ============================================================================

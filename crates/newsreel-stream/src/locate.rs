//! Byte-offset to segment resolution.
//!
//! The catalog gives segment *order* but not placement: each article's
//! byte range is declared in its own header and only learned by probing.
//! Resolving "which segment holds byte X" cheaply is what makes seeks
//! affordable.
//!
//! ## Search strategy
//!
//! Segment sizes within one file are roughly uniform, so instead of binary
//! search the locator interpolates: estimate the index from the byte offset
//! and the average segment size observed so far, probe that segment's
//! header, and narrow the bounds with its true range. On uniform sizes this
//! lands in one or two probes; on irregular sizes it degrades toward binary
//! search cost, never worse than a probe per remaining candidate.
//!
//! ## Result cache
//!
//! Probed placements land in a `BTreeMap` keyed by file offset, so a lookup
//! is one range query (largest start ≤ target). Re-seeking into a resolved
//! segment never probes again. The map is capped; when full it sheds the
//! lowest offset, which sequential readers have already passed.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};

use newsreel_core::{ByteStream, DeclaredRange, Error, Result, Segment, SegmentId};

/// Article access the stream layer needs from the resilience engine.
///
/// The production implementation routes through the server fleet with
/// failover; tests and benches substitute in-memory fixtures.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Declared placement of one article's payload.
    async fn range_of(&self, id: &SegmentId) -> Result<DeclaredRange>;

    /// Open one article's decoded payload stream.
    async fn open(&self, id: &SegmentId) -> Result<ByteStream>;
}

/// Resolved placement of the segment covering one byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Located {
    pub index: usize,
    pub range: DeclaredRange,
}

const DEFAULT_RANGE_CACHE: usize = 4096;

/// Maps byte offsets to segments for one logical file.
pub struct SegmentLocator {
    store: Arc<dyn SegmentStore>,
    segments: Vec<Segment>,
    /// Probed placements keyed by `file_offset`.
    resolved: RwLock<BTreeMap<u64, Located>>,
    cache_cap: usize,
    /// Total byte length, supplied up front or resolved from the last
    /// segment on first need.
    total: OnceCell<u64>,
    /// Header probes issued; cache hits do not count.
    probes: AtomicU64,
    probed_bytes: AtomicU64,
    probed_count: AtomicU64,
}

impl SegmentLocator {
    pub fn new(
        store: Arc<dyn SegmentStore>,
        segments: Vec<Segment>,
        total_length: Option<u64>,
    ) -> Self {
        SegmentLocator {
            store,
            segments,
            resolved: RwLock::new(BTreeMap::new()),
            cache_cap: DEFAULT_RANGE_CACHE,
            total: OnceCell::new_with(total_length),
            probes: AtomicU64::new(0),
            probed_bytes: AtomicU64::new(0),
            probed_count: AtomicU64::new(0),
        }
    }

    pub fn with_range_cache(mut self, cap: usize) -> Self {
        self.cache_cap = cap.max(1);
        self
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    /// Header probes issued so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Total byte length of the file. Probes the last segment once when the
    /// catalog did not come with a length.
    pub async fn total_len(&self) -> Result<u64> {
        self.total
            .get_or_try_init(|| async {
                match self.segments.len().checked_sub(1) {
                    None => Ok(0),
                    Some(last) => Ok(self.probe(last).await?.end()),
                }
            })
            .await
            .map(|len| *len)
    }

    /// Resolve the segment covering `offset`. `None` means the offset is at
    /// or past the end of the file.
    pub async fn locate(&self, offset: u64) -> Result<Option<Located>> {
        let count = self.segments.len();
        if count == 0 {
            return Ok(None);
        }
        if let Some(total) = self.total.get() {
            if offset >= *total {
                return Ok(None);
            }
        }

        // Tightest known bounds around the target. Between the two nearest
        // cached neighbors there are, by construction, no other cached
        // entries, so every probe below learns something new.
        let (mut lo, mut lo_off, mut hi, mut hi_off) = {
            let resolved = self.resolved.read().await;
            let below = resolved.range(..=offset).next_back().map(|(_, l)| *l);
            if let Some(hit) = below {
                if hit.range.contains(offset) {
                    return Ok(Some(hit));
                }
            }
            let above = resolved
                .range((Bound::Excluded(offset), Bound::Unbounded))
                .next()
                .map(|(_, l)| *l);
            (
                below.map_or(0, |l| l.index + 1),
                below.map_or(0, |l| l.range.end()),
                above.map_or(count, |l| l.index),
                above
                    .map(|l| l.range.file_offset)
                    .or_else(|| self.total.get().copied()),
            )
        };

        loop {
            if lo >= hi {
                if lo >= count {
                    return Ok(None);
                }
                return Err(Error::PlacementGap { offset });
            }

            let guess = match hi_off {
                Some(hi_off) if hi_off > lo_off => {
                    let rel = (offset - lo_off) as u128;
                    let span = (hi - lo) as u128;
                    lo + ((rel * span) / (hi_off - lo_off) as u128) as usize
                }
                _ => match self.average_size() {
                    Some(avg) => (offset / avg) as usize,
                    // Nothing probed yet and no length known: start at the
                    // lower bound and let the first probe seed the average.
                    None => lo,
                },
            }
            .clamp(lo, hi - 1);

            let range = self.probe(guess).await?;
            if range.contains(offset) {
                return Ok(Some(Located {
                    index: guess,
                    range,
                }));
            }
            if range.end() <= offset {
                lo = guess + 1;
                lo_off = range.end();
            } else {
                hi = guess;
                hi_off = Some(range.file_offset);
            }
        }
    }

    async fn probe(&self, index: usize) -> Result<DeclaredRange> {
        let range = self.store.range_of(&self.segments[index].id).await?;
        self.probes.fetch_add(1, Ordering::Relaxed);
        self.probed_bytes.fetch_add(range.size, Ordering::Relaxed);
        self.probed_count.fetch_add(1, Ordering::Relaxed);

        let mut resolved = self.resolved.write().await;
        if resolved.len() >= self.cache_cap && !resolved.contains_key(&range.file_offset) {
            resolved.pop_first();
        }
        resolved.insert(range.file_offset, Located { index, range });
        Ok(range)
    }

    fn average_size(&self) -> Option<u64> {
        let count = self.probed_count.load(Ordering::Relaxed);
        if count == 0 {
            return None;
        }
        Some((self.probed_bytes.load(Ordering::Relaxed) / count).max(1))
    }
}

// ============================================================================
// Tests. The store is an in-memory catalog; probe counts come straight off
// the locator, so search cost assertions are exact, not statistical.
// ============================================================================

//! Offset Resolution Benchmarks
//!
//! Measures how quickly `SegmentLocator` maps a byte offset to its segment,
//! the operation behind every seek.
//!
//! ## What We Benchmark
//!
//! ### 1. Cold Resolution (`bench_cold_locate`)
//! - Fresh locator, empty result cache, one seek
//! - Compares interpolation search against plain binary search
//! - Offsets at 10%, 50%, 90% of a uniform 1000-segment file
//! - Interpolation should land in 1-2 probes where binary needs ~10
//!
//! ### 2. Warm Resolution (`bench_warm_locate`)
//! - Locator with every placement already cached
//! - Measures the pure cache-lookup path a sequential reader sees
//!
//! The store here answers probes from memory, so the numbers isolate search
//! cost; on a real fleet each probe is a network round-trip and the probe
//! count dominates.
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench -p newsreel-stream
//! cargo bench -p newsreel-stream -- --save-baseline main
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use newsreel_core::{byte_stream_from, ByteStream, DeclaredRange, Error, Result, Segment, SegmentId};
use newsreel_stream::{catalog, SegmentLocator, SegmentStore};

const SEGMENTS: usize = 1000;
const SEGMENT_SIZE: u64 = 750_000;

/// Uniformly tiled placements, answered from arithmetic: `part{i}@bench`
/// covers `[i * SEGMENT_SIZE, (i + 1) * SEGMENT_SIZE)`.
struct UniformStore;

impl UniformStore {
    fn index_of(id: &SegmentId) -> Result<u64> {
        id.as_str()
            .strip_prefix("part")
            .and_then(|rest| rest.strip_suffix("@bench"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::not_found(id.as_str()))
    }
}

#[async_trait]
impl SegmentStore for UniformStore {
    async fn range_of(&self, id: &SegmentId) -> Result<DeclaredRange> {
        let index = Self::index_of(id)?;
        Ok(DeclaredRange::new(index * SEGMENT_SIZE, SEGMENT_SIZE))
    }

    async fn open(&self, _id: &SegmentId) -> Result<ByteStream> {
        Ok(byte_stream_from(Vec::new()))
    }
}

fn fixture() -> (Arc<UniformStore>, Vec<Segment>, u64) {
    let segments = catalog((0..SEGMENTS).map(|i| format!("part{i}@bench")));
    (Arc::new(UniformStore), segments, SEGMENTS as u64 * SEGMENT_SIZE)
}

/// Baseline: classic binary search probing the midpoint's header each step.
async fn binary_locate(
    store: &Arc<UniformStore>,
    segments: &[Segment],
    offset: u64,
) -> Option<usize> {
    let mut lo = 0usize;
    let mut hi = segments.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let range = store.range_of(&segments[mid].id).await.ok()?;
        if range.contains(offset) {
            return Some(mid);
        }
        if range.end() <= offset {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    None
}

fn bench_cold_locate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, segments, total) = fixture();
    let mut group = c.benchmark_group("cold_locate");

    for offset_pct in [10u64, 50, 90] {
        let offset = total * offset_pct / 100 + 12_345;

        group.bench_with_input(
            BenchmarkId::new("interpolation", offset_pct),
            &offset,
            |b, &offset| {
                b.to_async(&rt).iter_batched(
                    || {
                        Arc::new(SegmentLocator::new(
                            store.clone(),
                            segments.clone(),
                            Some(total),
                        ))
                    },
                    |locator| async move { black_box(locator.locate(offset).await.unwrap()) },
                    BatchSize::SmallInput,
                );
            },
        );

        group.bench_with_input(
            BenchmarkId::new("binary", offset_pct),
            &offset,
            |b, &offset| {
                let store = store.clone();
                let segments = segments.clone();
                b.to_async(&rt).iter(|| {
                    let store = store.clone();
                    let segments = segments.clone();
                    async move { black_box(binary_locate(&store, &segments, offset).await) }
                });
            },
        );
    }

    group.finish();
}

fn bench_warm_locate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, segments, total) = fixture();

    let locator = Arc::new(SegmentLocator::new(store, segments, Some(total)));
    rt.block_on(async {
        for index in 0..SEGMENTS as u64 {
            locator.locate(index * SEGMENT_SIZE).await.unwrap();
        }
    });

    let mut group = c.benchmark_group("warm_locate");
    group.bench_function("cached", |b| {
        let locator = locator.clone();
        let mut offset = 0u64;
        b.to_async(&rt).iter(|| {
            offset = (offset + 37 * SEGMENT_SIZE + 511) % total;
            let locator = locator.clone();
            let offset = offset;
            async move { black_box(locator.locate(offset).await.unwrap()) }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_cold_locate, bench_warm_locate);
criterion_main!(benches);

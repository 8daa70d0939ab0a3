//! Benchmarks for the pixpipe image pipeline.
//!
//! Run with: cargo bench -p pixpipe-core

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pixpipe_core::decoder::{read_metadata, DefaultImageDecoder, ImageDecoder, ProgressiveJpegParser};
use pixpipe_core::producers::DiskCachePartitions;
use pixpipe_core::testing::{
    jpeg_bytes, png_bytes, synthetic_progressive_jpeg, FakeNetworkFetcher, InMemoryDiskCache,
    InlineExecutorSupplier,
};
use pixpipe_core::{Capabilities, Config, ImagePipeline, ImageRequest, QualityInfo};

fn benchmark_decode(c: &mut Criterion) {
    let decoder = DefaultImageDecoder::default();
    let bytes = jpeg_bytes(640, 480);

    c.bench_function("decode_jpeg_640x480", |b| {
        b.iter(|| {
            let _ = decoder.decode("bench", black_box(&bytes), QualityInfo::FULL);
        })
    });
}

fn benchmark_progressive_parse(c: &mut Criterion) {
    let (bytes, _) = synthetic_progressive_jpeg(10);

    c.bench_function("progressive_parse_10_scans", |b| {
        b.iter(|| {
            let mut parser = ProgressiveJpegParser::new();
            for end in (64..bytes.len()).step_by(64).chain([bytes.len()]) {
                parser.parse_more_data(black_box(&bytes[..end]));
            }
            parser.best_scan_number()
        })
    });
}

fn benchmark_metadata(c: &mut Criterion) {
    let bytes = png_bytes(256, 256);

    c.bench_function("metadata_read", |b| {
        b.iter(|| read_metadata(black_box(&bytes)))
    });
}

fn benchmark_memory_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let uri = "https://example.com/bench.png";

    let pipeline = rt.block_on(async {
        let config = Config::default();
        let fetcher = Arc::new(FakeNetworkFetcher::new());
        fetcher.respond(uri, vec![png_bytes(128, 128)]);
        let mut caps =
            Capabilities::from_config(&config, tokio::runtime::Handle::current()).unwrap();
        caps.executors = Arc::new(InlineExecutorSupplier::new(tokio::runtime::Handle::current()));
        caps.network = fetcher;
        caps.disk_caches = DiskCachePartitions {
            main: Arc::new(InMemoryDiskCache::new("main")),
            small: Arc::new(InMemoryDiskCache::new("small")),
            small_image_threshold_px: 0,
        };
        let pipeline = ImagePipeline::new(config, caps);
        pipeline
            .fetch_decoded_image(ImageRequest::from_uri(uri).unwrap())
            .await
            .unwrap();
        pipeline
    });

    c.bench_function("bitmap_cache_hit", |b| {
        b.iter(|| {
            rt.block_on(pipeline.fetch_decoded_image(ImageRequest::from_uri(uri).unwrap()))
        })
    });
}

criterion_group!(
    benches,
    benchmark_decode,
    benchmark_progressive_parse,
    benchmark_metadata,
    benchmark_memory_cache_hit,
);
criterion_main!(benches);

//! Benchmarks for lanealloc.
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lanealloc::{HeapHighway, HeapLane, HighwaySettings, Tesseract};

fn bench_lane_carve(c: &mut Criterion) {
    let mut group = c.benchmark_group("lane_carve");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("carve_dispose_64b_1000x", |b| {
        let lane = HeapLane::new(1 << 20).unwrap();
        b.iter(|| {
            for _ in 0..1000 {
                let mut fragment = lane.alloc(64, 4, 0).unwrap();
                black_box(&mut fragment);
                fragment.dispose().unwrap();
            }
        })
    });

    group.bench_function("carve_batch_then_dispose_64b_1000x", |b| {
        let lane = HeapLane::new(1 << 20).unwrap();
        b.iter(|| {
            let mut fragments = Vec::with_capacity(1000);
            for _ in 0..1000 {
                fragments.push(lane.alloc(64, 4, 0).unwrap());
            }
            black_box(&fragments);
            // Dropping disposes; the last one resets the lane.
            fragments.clear();
        })
    });

    group.finish();
}

fn bench_highway_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("highway_dispatch");

    group.bench_function("alloc_fragment_1kb", |b| {
        let highway = HeapHighway::new(HighwaySettings::default()).unwrap();
        b.iter(|| {
            let mut fragment = highway.alloc_fragment(1024).unwrap().unwrap();
            black_box(&mut fragment);
            fragment.dispose().unwrap();
        })
    });

    group.bench_function("write_read_4kb", |b| {
        let highway = HeapHighway::new(HighwaySettings::default()).unwrap();
        let payload = vec![0xABu8; 4096];
        let mut out = vec![0u8; 4096];
        b.iter(|| {
            let mut fragment = highway.alloc_fragment(4096).unwrap().unwrap();
            fragment.write(&payload, 0, 4096).unwrap();
            fragment.read(&mut out, 0, 0).unwrap();
            black_box(&out);
            fragment.dispose().unwrap();
        })
    });

    group.finish();
}

fn bench_tesseract(c: &mut Criterion) {
    let mut group = c.benchmark_group("tesseract");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("append_1000x", |b| {
        b.iter(|| {
            let tesseract = Tesseract::new();
            for i in 0..1000u64 {
                black_box(tesseract.append(Arc::new(i)).unwrap());
            }
        })
    });

    group.bench_function("get_1000x", |b| {
        let tesseract = Tesseract::new();
        for i in 0..1000u64 {
            tesseract.append(Arc::new(i)).unwrap();
        }
        b.iter(|| {
            for i in 0..1000 {
                black_box(tesseract.get(i).unwrap());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_lane_carve, bench_highway_dispatch, bench_tesseract);
criterion_main!(benches);

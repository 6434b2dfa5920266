//! Codec Benchmarks
//!
//! Measures encode throughput and the cost of full, regional and
//! progressive decodes.
//!
//! Run with:
//!   cargo bench --bench codec

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use glam::IVec3;
use std::hint::black_box;
use wavezip::{
    encode, types::Extent, DataType, DecodeQuery, DecodeSession, FormatBuilder, MemoryStorage,
    Volume, VolumeFormat,
};

fn test_volume(dims: IVec3) -> Volume {
    let mut v = Volume::new(dims, DataType::I16);
    let mut seed = 17u64;
    for z in 0..dims.z {
        for y in 0..dims.y {
            for x in 0..dims.x {
                seed = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let wave = 3000.0 * ((x as f64 / 11.0).sin() + (y as f64 / 7.0).cos());
                v.set(IVec3::new(x, y, z), wave + (seed >> 56) as f64 + 10.0 * z as f64);
            }
        }
    }
    v
}

fn test_format(dims: IVec3, iterations: u8) -> VolumeFormat {
    FormatBuilder::new()
        .with_name("bench")
        .with_dimensions(dims)
        .with_data_type(DataType::I16)
        .with_brick_size(IVec3::splat(16))
        .with_num_iterations(iterations)
        .with_bricks_per_chunk(16)
        .with_chunks_per_file(16)
        .with_quality_levels(&[16, 4, 1])
        .finalize()
        .unwrap()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.sample_size(10);

    for size in [32, 64] {
        let dims = IVec3::splat(size);
        let volume = test_volume(dims);
        group.throughput(Throughput::Bytes(volume.as_bytes().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &volume, |b, volume| {
            b.iter(|| {
                let storage = MemoryStorage::new();
                let mut format = test_format(dims, 2);
                black_box(encode(&mut format, volume, &storage).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.sample_size(10);

    let dims = IVec3::splat(64);
    let volume = test_volume(dims);
    let storage = MemoryStorage::new();
    let mut format = test_format(dims, 2);
    encode(&mut format, &volume, &storage).unwrap();

    let queries = [
        ("full", DecodeQuery::new()),
        ("level_1", DecodeQuery::new().with_iteration(1)),
        (
            "region",
            DecodeQuery::new().with_extent(Extent::new(IVec3::splat(20), IVec3::splat(16))),
        ),
        ("planes_6", DecodeQuery::new().with_bit_planes(6)),
        ("quality_0", DecodeQuery::new().with_quality(0)),
    ];

    for (name, query) in queries {
        group.bench_with_input(BenchmarkId::new("cold", name), &query, |b, query| {
            b.iter(|| {
                let mut session = DecodeSession::new(&format, &storage).unwrap();
                black_box(session.decode(query).unwrap());
            });
        });
    }

    let query = DecodeQuery::new().with_extent(Extent::new(IVec3::splat(20), IVec3::splat(16)));
    let mut session = DecodeSession::new(&format, &storage).unwrap();
    group.bench_function("warm/region", |b| {
        b.iter(|| black_box(session.decode(&query).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);

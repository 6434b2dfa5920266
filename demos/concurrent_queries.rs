//! Example: many region queries against one dataset at once
//!
//! Run with: cargo run --example concurrent_queries
//!
//! Each query runs in its own decode session on tokio's blocking pool; the
//! sessions share only the format and the storage.

use glam::IVec3;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use wavezip::{
    connect, types::Extent, DataType, Dataset, DecodeQuery, FormatBuilder, Volume,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("wavezip concurrent queries");
    println!("==========================\n");

    let dims = IVec3::new(128, 128, 64);
    let mut volume = Volume::new(dims, DataType::U16);
    for z in 0..dims.z {
        for y in 0..dims.y {
            for x in 0..dims.x {
                let v = 30000.0 + 20000.0 * ((x as f64 / 17.0).sin() * (y as f64 / 23.0).cos())
                    + 50.0 * z as f64;
                volume.set(IVec3::new(x, y, z), v);
            }
        }
    }

    let builder = FormatBuilder::new()
        .with_name("waves")
        .with_dimensions(dims)
        .with_data_type(DataType::U16)
        .with_brick_size(IVec3::splat(16))
        .with_num_iterations(2)
        .with_bricks_per_chunk(8)
        .with_chunks_per_file(8)
        .with_quality_levels(&[8, 1]);

    let storage = connect("mem://")?;
    let start = Instant::now();
    let (dataset, summary) = Dataset::create(storage, builder, volume.clone()).await?;
    println!(
        "Encoded {} bricks in {:.2?}\n{}\n",
        summary.bricks,
        start.elapsed(),
        dataset.stats().summary()
    );

    // 16 time-slice style windows, alternating full and preview quality
    let queries: Vec<DecodeQuery> = (0..16)
        .map(|i| {
            let from = IVec3::new((i % 4) * 32, (i / 4) * 32, 0);
            let query = DecodeQuery::new().with_extent(Extent::new(from, IVec3::new(32, 32, 64)));
            if i % 2 == 0 {
                query
            } else {
                query.with_quality(0)
            }
        })
        .collect();

    let start = Instant::now();
    let results = dataset.decode_many(queries.clone()).await?;
    println!("Decoded {} regions concurrently in {:.2?}", results.len(), start.elapsed());

    let start = Instant::now();
    for query in queries {
        dataset.decode(query).await?;
    }
    println!("Decoded the same regions one by one in {:.2?}\n", start.elapsed());

    for (i, out) in results.iter().enumerate().take(4) {
        let region = Extent::new(IVec3::new((i as i32 % 4) * 32, 0, 0), IVec3::new(32, 32, 64));
        let reference = volume.crop(&region)?;
        println!(
            "  region {}: max error {:.1}",
            i,
            wavezip::volume::max_abs_error(&reference, out)?
        );
    }

    let stats = dataset.stats();
    println!(
        "\n{} queries, {} cache hits, {} misses",
        stats.queries, stats.cache.hits, stats.cache.misses
    );
    Ok(())
}

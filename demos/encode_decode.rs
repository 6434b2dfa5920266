//! Example: encode a volume, then decode it progressively
//!
//! Run with: WAVEZIP_DIMS=96x96x48 WAVEZIP_ITERATIONS=2 cargo run --example encode_decode
//!
//! Reads `WAVEZIP_INPUT` as a raw little-endian file when set, otherwise
//! synthesizes a test field. Output goes to `WAVEZIP_DIR` (default `data`).

use anyhow::Context;
use glam::IVec3;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use wavezip::{
    encode, read_meta_file,
    utils::format_bytes,
    volume::{max_abs_error, psnr},
    DataType, DecodeQuery, DecodeSession, EncodeParams, FileSystemStorage, Volume,
};

fn synthesize(dims: IVec3, data_type: DataType) -> Volume {
    let mut volume = Volume::new(dims, data_type);
    let (lo, hi) = if data_type.is_float() {
        (-1.0, 1.0)
    } else {
        let (lo, hi) = data_type.limits();
        (lo.max(-30000.0), hi.min(60000.0))
    };
    let c = dims.as_vec3() / 2.0;
    for z in 0..dims.z {
        for y in 0..dims.y {
            for x in 0..dims.x {
                let p = IVec3::new(x, y, z);
                let r = (p.as_vec3() - c).length() / c.length().max(1.0);
                let t = 0.5 + 0.5 * (12.0 * r).cos() * (1.0 - r);
                volume.set(p, lo + t as f64 * (hi - lo));
            }
        }
    }
    volume
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let params = EncodeParams::from_env()?;
    let dims = IVec3::from_array(params.dims);
    let volume = match &params.input {
        Some(path) => Volume::read_raw(path, dims, params.data_type)
            .with_context(|| format!("loading {}", path.display()))?,
        None => synthesize(dims, params.data_type),
    };

    println!("wavezip encode/decode");
    println!("=====================\n");
    println!(
        "Volume: {}x{}x{} {} ({})",
        dims.x,
        dims.y,
        dims.z,
        params.data_type,
        format_bytes(volume.as_bytes().len() as u64)
    );

    let storage = FileSystemStorage::new(&params.dir);
    let mut format = params.to_builder().finalize()?;
    println!("Format: {}\n", format.summary());

    let start = Instant::now();
    let summary = encode(&mut format, &volume, &storage)?;
    println!(
        "Encoded {} bricks into {} files, {} in {:.2?}",
        summary.bricks,
        summary.files,
        format_bytes(summary.total_bytes),
        start.elapsed()
    );
    println!(
        "Compression ratio: {:.2}x\n",
        volume.as_bytes().len() as f64 / summary.total_bytes.max(1) as f64
    );

    // decode from what is on disk, as a reader would
    let format = read_meta_file(&storage, &params.name)?;
    let mut session = DecodeSession::new(&format, &storage)?;

    println!("Resolution levels:");
    for level in (0..format.n_iterations()).rev() {
        let start = Instant::now();
        let out = session.decode(&DecodeQuery::new().with_iteration(level))?;
        let d = out.dims();
        println!("  level {}: {}x{}x{} in {:.2?}", level, d.x, d.y, d.z, start.elapsed());
    }

    println!("\nBit-plane refinement (full resolution):");
    let top = format
        .encode_stats()
        .bit_plane_range
        .map(|r| r.max as u32 + 1)
        .unwrap_or(0);
    for planes in (2..=top).step_by(4).chain(std::iter::once(top)) {
        let out = session.decode(&DecodeQuery::new().with_bit_planes(planes))?;
        println!(
            "  {:>2} planes: max error {:>12.4}, PSNR {:>7.2} dB",
            planes,
            max_abs_error(&volume, &out)?,
            psnr(&volume, &out)?
        );
    }

    if !format.quality_levels().is_empty() {
        println!("\nQuality levels:");
        for (level, budget) in format.encode_stats().rdo_levels.iter().enumerate() {
            let out = session.decode(&DecodeQuery::new().with_quality(level))?;
            println!(
                "  level {} ({}): PSNR {:.2} dB",
                level,
                format_bytes(*budget),
                psnr(&volume, &out)?
            );
        }
    }

    let stats = session.cache_stats();
    println!(
        "\nCache: {} files, {} read, {} hits / {} misses",
        stats.files_loaded,
        format_bytes(stats.bytes_read),
        stats.hits,
        stats.misses
    );
    Ok(())
}

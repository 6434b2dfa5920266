//! Progressive decoding: resolution levels, precision and quality levels

use glam::IVec3;
use wavezip::{
    address::ChunkAddress,
    encode,
    rdo::RdoFile,
    types::Extent,
    volume::{max_abs_error, rms_error},
    DataType, DecodeQuery, DecodeSession, FileKind, FormatBuilder, MemoryStorage, Storage, Volume,
    VolumeFormat,
};

fn terrain(dims: IVec3) -> Volume {
    let mut seed = 0x5eed_u64;
    let mut v = Volume::new(dims, DataType::U16);
    for z in 0..dims.z {
        for y in 0..dims.y {
            for x in 0..dims.x {
                seed = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let noise = (seed >> 54) as f64;
                let base = 20000.0
                    + 8000.0 * (x as f64 / 9.0).sin() * (y as f64 / 13.0).cos()
                    + 300.0 * z as f64;
                v.set(IVec3::new(x, y, z), base + noise);
            }
        }
    }
    v
}

fn encoded(dims: IVec3, iterations: u8, quality: &[u32]) -> (VolumeFormat, MemoryStorage, Volume) {
    let storage = MemoryStorage::new();
    let mut format = FormatBuilder::new()
        .with_name("terrain")
        .with_dimensions(dims)
        .with_data_type(DataType::U16)
        .with_brick_size(IVec3::new(8, 8, 4))
        .with_num_iterations(iterations)
        .with_bricks_per_chunk(4)
        .with_chunks_per_file(4)
        .with_quality_levels(quality)
        .finalize()
        .unwrap();
    let volume = terrain(dims);
    encode(&mut format, &volume, &storage).unwrap();
    (format, storage, volume)
}

#[test]
fn test_resolution_pyramid() {
    let dims = IVec3::new(50, 36, 12);
    let (format, storage, volume) = encoded(dims, 3, &[]);
    let mut session = DecodeSession::new(&format, &storage).unwrap();
    assert_eq!(session.decode(&DecodeQuery::new()).unwrap(), volume);
    for level in 1..3 {
        let out = session
            .decode(&DecodeQuery::new().with_iteration(level))
            .unwrap();
        assert_eq!(out.dims(), format.level_dims(level));
        assert!(out.dims().cmplt(dims).any());
    }
    assert_eq!(format.level_dims(1), IVec3::new(25, 18, 6));
}

#[test]
fn test_region_at_coarse_level() {
    let dims = IVec3::new(48, 48, 8);
    let (format, storage, _) = encoded(dims, 2, &[]);
    let mut session = DecodeSession::new(&format, &storage).unwrap();
    let coarse = session
        .decode(&DecodeQuery::new().with_iteration(1))
        .unwrap();
    let region = Extent::new(IVec3::new(10, 6, 2), IVec3::new(20, 30, 4));
    let part = session
        .decode(&DecodeQuery::new().with_iteration(1).with_extent(region))
        .unwrap();
    let mapped = region.coarsen(format.iteration(1).scale3);
    assert_eq!(part, coarse.crop(&mapped).unwrap());
}

#[test]
fn test_more_bit_planes_never_hurt() {
    let (format, storage, volume) = encoded(IVec3::new(32, 24, 8), 2, &[]);
    let mut session = DecodeSession::new(&format, &storage).unwrap();
    let top = format.encode_stats().bit_plane_range.unwrap().max as u32 + 1;
    let mut last = f64::INFINITY;
    for planes in 1..=top {
        let out = session
            .decode(&DecodeQuery::new().with_bit_planes(planes))
            .unwrap();
        let err = rms_error(&volume, &out).unwrap();
        assert!(err <= last, "{} planes: {} > {}", planes, err, last);
        last = err;
    }
    assert_eq!(last, 0.0);
}

#[test]
fn test_accuracy_threshold_on_integers() {
    let (format, storage, volume) = encoded(IVec3::new(32, 24, 8), 1, &[]);
    let mut session = DecodeSession::new(&format, &storage).unwrap();
    let coarse = session
        .decode(&DecodeQuery::new().with_accuracy(512.0))
        .unwrap();
    let fine = session
        .decode(&DecodeQuery::new().with_accuracy(1.0))
        .unwrap();
    let coarse_err = rms_error(&volume, &coarse).unwrap();
    let fine_err = rms_error(&volume, &fine).unwrap();
    assert!(coarse_err > 0.0);
    assert!(fine_err <= coarse_err);

    // a bit-plane count stricter than the accuracy wins
    let strict = session
        .decode(&DecodeQuery::new().with_accuracy(1.0).with_bit_planes(2))
        .unwrap();
    assert!(rms_error(&volume, &strict).unwrap() >= fine_err);
}

#[test]
fn test_accuracy_is_an_upper_bound() {
    let (format, storage, volume) = encoded(IVec3::new(40, 32, 16), 3, &[]);
    let mut session = DecodeSession::new(&format, &storage).unwrap();
    for accuracy in [4.0, 64.0, 1024.0, 16384.0] {
        let out = session
            .decode(&DecodeQuery::new().with_accuracy(accuracy))
            .unwrap();
        let err = max_abs_error(&volume, &out).unwrap();
        assert!(err <= accuracy, "accuracy {}: error {}", accuracy, err);
    }
}

#[test]
fn test_quality_levels_are_nested() {
    let (format, storage, volume) = encoded(IVec3::new(40, 32, 8), 2, &[32, 8, 2, 1]);
    let budgets = &format.encode_stats().rdo_levels;
    assert_eq!(budgets.len(), 4);
    assert!(budgets.windows(2).all(|w| w[0] <= w[1]));

    for iteration in 0..format.n_iterations() {
        let layout = format.iteration(iteration);
        for file in 0..layout.files_per_volume() {
            let address = ChunkAddress::new(iteration, 0, 0, file << layout.chunk_bits);
            let path = format.chunk_file_path(address, FileKind::Rdo);
            if !storage.exists(&path).unwrap() {
                continue;
            }
            let table: RdoFile = bincode::deserialize(&storage.read(&path).unwrap()).unwrap();
            for entry in &table.entries {
                assert_eq!(entry.min_bit_plane.len(), 4);
                assert!(
                    entry.min_bit_plane.windows(2).all(|w| w[1] <= w[0]),
                    "planes {:?} grow with the budget",
                    entry.min_bit_plane
                );
            }
        }
    }

    let mut session = DecodeSession::new(&format, &storage).unwrap();
    let errors: Vec<f64> = (0..4)
        .map(|q| {
            let out = session.decode(&DecodeQuery::new().with_quality(q)).unwrap();
            rms_error(&volume, &out).unwrap()
        })
        .collect();
    assert!(errors[0] > 0.0);
    assert!(errors[0] >= errors[3]);
    // the full budget keeps every chunk
    assert_eq!(errors[3], 0.0);
}

#[test]
fn test_cold_and_warm_sessions_agree() {
    let (format, storage, _) = encoded(IVec3::new(40, 32, 8), 2, &[4, 1]);
    let query = DecodeQuery::new()
        .with_extent(Extent::new(IVec3::new(7, 3, 1), IVec3::new(25, 20, 6)))
        .with_quality(0);

    let mut warm = DecodeSession::new(&format, &storage).unwrap();
    let first = warm.decode(&query).unwrap();
    let second = warm.decode(&query).unwrap();
    assert_eq!(first, second);
    assert!(warm.cache().size_bytes() > 0);

    let mut cold = DecodeSession::new(&format, &storage).unwrap();
    assert_eq!(cold.decode(&query).unwrap(), first);
    cold.clear_cache();
    assert_eq!(cold.cache().num_files(), 0);
    assert_eq!(cold.decode(&query).unwrap(), first);
}

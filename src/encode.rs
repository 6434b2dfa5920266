//! Encoder driver
//!
//! Iteration-0 bricks are visited in increasing ordinal order. Each brick is
//! quantized, transformed once, and its detail subbands are bit-plane coded
//! into the channels; its low-pass band is parked in the parent brick of the
//! next iteration. A parent is transformed and coded as soon as its last
//! child arrives, so the brick pool only ever holds partially filled parents.
//! The low-pass band of the last iteration is coded like a detail subband.

use crate::address::{BrickLocation, ChunkAddress, FileKind};
use crate::channel::{
    encode_block_plane, BlockLayout, BlockState, Channel, FileFooter, FinishedChunk, SubChannel,
    BRICK_EXPONENT_BITS,
};
use crate::compression;
use crate::error::{Result, WzError};
use crate::io::Storage;
use crate::layout::{EncodeStats, Subband, VolumeFormat};
use crate::metadata::write_meta_file;
use crate::rdo::{self, RdoChunk};
use crate::transform::{Cdf53Lifting, Quantizer, WaveletTransform};
use crate::types::{prod, BitPlaneRange};
use crate::volume::Volume;
use glam::IVec3;
use ndarray::Array3;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace};

/// What an encode run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeSummary {
    /// Bricks transformed, all iterations together
    pub bricks: u64,
    pub data_chunks: u64,
    pub exponent_chunks: u64,
    /// Data, exponent and truncation files written
    pub files: usize,
    /// Chunk payload bytes, exponent chunks included
    pub total_bytes: u64,
    pub bit_plane_range: BitPlaneRange,
    /// Byte budget per quality level, ascending
    pub rdo_levels: Vec<u64>,
}

/// A parent brick waiting for the low-pass bands of its children
struct PendingBrick {
    data: Array3<i64>,
    n_children: i64,
    n_children_max: i64,
    /// Children present along each axis
    n_present3: IVec3,
}

/// Transient state of one encode run
struct EncodeData<'a> {
    format: &'a VolumeFormat,
    storage: &'a dyn Storage,
    quantizer: Quantizer,
    transform: Cdf53Lifting,
    brick_pool: HashMap<(u8, u64), PendingBrick>,
    /// Ordinal of the last brick coded per iteration; channels need them increasing
    last_ordinal: Vec<Option<u64>>,
    channels: BTreeMap<(u8, u8, u16), Channel>,
    sub_channels: BTreeMap<(u8, u8), SubChannel>,
    /// Footer of every file touched so far, keyed by path
    files: BTreeMap<String, FileFooter>,
    rdo_chunks: Vec<RdoChunk>,
    bit_planes: BitPlaneRange,
    summary: EncodeSummary,
}

impl<'a> EncodeData<'a> {
    fn new(format: &'a VolumeFormat, storage: &'a dyn Storage, quantizer: Quantizer) -> Self {
        Self {
            format,
            storage,
            quantizer,
            transform: Cdf53Lifting,
            brick_pool: HashMap::new(),
            last_ordinal: vec![None; format.n_iterations()],
            channels: BTreeMap::new(),
            sub_channels: BTreeMap::new(),
            files: BTreeMap::new(),
            rdo_chunks: Vec::new(),
            bit_planes: BitPlaneRange::empty(),
            summary: EncodeSummary::default(),
        }
    }

    /// Quantized samples of an iteration-0 brick, padded; samples past the
    /// volume edge repeat the edge
    fn load_brick(&self, volume: &Volume, brick3: IVec3) -> Array3<i64> {
        let ext = self.format.brick_dims_ext();
        let origin = brick3 * self.format.brick_dims();
        let edge = volume.dims() - IVec3::ONE;
        Array3::from_shape_fn(
            (ext.x as usize, ext.y as usize, ext.z as usize),
            |(x, y, z)| {
                let p = (origin + IVec3::new(x as i32, y as i32, z as i32)).min(edge);
                self.quantizer.to_coefficient(volume.get(p))
            },
        )
    }

    fn encode_volume(&mut self, volume: &Volume) -> Result<()> {
        let layout = self.format.iteration(0);
        let bricks = layout.traverse_volume(&layout.brick_grid());
        debug!(bricks = bricks.len(), "encoding iteration 0");
        for brick in bricks {
            let data = self.load_brick(volume, brick.brick3);
            self.encode_brick(0, brick.brick3, data)?;
        }
        if !self.brick_pool.is_empty() {
            return Err(WzError::BrickNotFound(format!(
                "{} parent bricks never completed",
                self.brick_pool.len()
            )));
        }
        Ok(())
    }

    fn encode_brick(&mut self, iteration: usize, brick3: IVec3, mut data: Array3<i64>) -> Result<()> {
        let format = self.format;
        let location = format.iteration(iteration).locate_brick(brick3);
        let last_ordinal = &mut self.last_ordinal[iteration];
        if let Some(last) = last_ordinal.filter(|&last| last >= location.ordinal) {
            return Err(WzError::InvalidFormat(format!(
                "brick {} at iteration {} arrived after brick {}",
                location.ordinal, iteration, last
            )));
        }
        *last_ordinal = Some(location.ordinal);
        self.transform.forward(&mut data, format.transformed_axes());
        let last = iteration + 1 == format.n_iterations();
        for (sb, subband) in format.subbands_non_ext().iter().enumerate() {
            if subband.is_low_pass() && !last {
                continue;
            }
            self.encode_subband(iteration, sb, subband, &data, &location)?;
        }
        self.summary.bricks += 1;
        if last {
            Ok(())
        } else {
            self.push_to_parent(iteration, brick3, &data)
        }
    }

    /// Copy the low-pass band into the parent; code the parent once complete
    fn push_to_parent(&mut self, iteration: usize, brick3: IVec3, data: &Array3<i64>) -> Result<()> {
        let format = self.format;
        let group = format.group_brick3();
        let parent3 = brick3 / group;
        let parent = format.iteration(iteration + 1).locate_brick(parent3);
        let key = ((iteration + 1) as u8, parent.ordinal);
        let low = format.subbands_non_ext()[0].grid;
        let offset = (brick3 - parent3 * group) * low.dims;

        let pending = self.brick_pool.entry(key).or_insert_with(|| {
            let ext = format.brick_dims_ext();
            let n_present3 = (format.iteration(iteration).n_bricks3 - parent3 * group).min(group);
            PendingBrick {
                data: Array3::zeros((ext.x as usize, ext.y as usize, ext.z as usize)),
                n_children: 0,
                n_children_max: prod(n_present3),
                n_present3,
            }
        });
        for z in 0..low.dims.z {
            for y in 0..low.dims.y {
                for x in 0..low.dims.x {
                    let local = IVec3::new(x, y, z);
                    let src = low.position(local);
                    let dst = offset + local;
                    pending.data[[dst.x as usize, dst.y as usize, dst.z as usize]] =
                        data[[src.x as usize, src.y as usize, src.z as usize]];
                }
            }
        }
        pending.n_children += 1;
        if pending.n_children < pending.n_children_max {
            return Ok(());
        }
        match self.brick_pool.remove(&key) {
            Some(mut complete) => {
                fill_missing(&mut complete.data, complete.n_present3 * low.dims);
                self.encode_brick(iteration + 1, parent3, complete.data)
            }
            None => Err(WzError::BrickNotFound(format!(
                "parent {:?} at iteration {}",
                parent3,
                iteration + 1
            ))),
        }
    }

    fn encode_subband(
        &mut self,
        iteration: usize,
        sb: usize,
        subband: &Subband,
        data: &Array3<i64>,
        location: &BrickLocation,
    ) -> Result<()> {
        let blocks_layout = BlockLayout::new(subband.grid, self.format.block_dims());
        let blocks = blocks_layout.gather(data);
        let emaxes: Vec<u8> = blocks.iter().map(|b| b.emax()).collect();
        let brick_emax = emaxes.iter().copied().max().unwrap_or(0);
        if brick_emax as u32 >= 1 << BRICK_EXPONENT_BITS {
            return Err(WzError::InvalidFormat(format!(
                "coefficient with {} magnitude bits in subband {} at iteration {}",
                brick_emax, sb, iteration
            )));
        }

        let exp_key = (iteration as u8, sb as u8);
        let finished = self
            .sub_channels
            .entry(exp_key)
            .or_default()
            .begin_brick(location.chunk, location.brick_in_chunk);
        if let Some(done) = finished {
            self.write_exponent_chunk(iteration, sb, done)?;
        }
        if let Some(sub) = self.sub_channels.get_mut(&exp_key) {
            sub.write_brick(brick_emax, &emaxes);
        }

        if brick_emax > 0 {
            self.bit_planes.include(brick_emax as i16 - 1);
        }
        let mut states = vec![BlockState::default(); blocks.len()];
        for bp in (0..brick_emax as u32).rev() {
            let channel = self
                .channels
                .entry((iteration as u8, sb as u8, bp as u16))
                .or_default();
            let finished = channel.begin_brick(location.chunk, location.brick_in_chunk);
            let mut ones = 0;
            for ((block, state), &emax) in blocks.iter().zip(states.iter_mut()).zip(&emaxes) {
                if emax as u32 > bp {
                    ones += encode_block_plane(&mut channel.block_stream, block, bp, state);
                }
            }
            channel.end_brick(ones);
            if let Some(done) = finished {
                self.write_data_chunk(iteration, sb, bp as u16, done)?;
            }
        }
        Ok(())
    }

    fn write_data_chunk(&mut self, iteration: usize, sb: usize, bp: u16, done: FinishedChunk) -> Result<()> {
        let address = ChunkAddress::new(iteration, sb, bp, done.chunk);
        self.rdo_chunks
            .push(RdoChunk::new(address, done.bytes.len() as u64, done.ones));
        self.summary.data_chunks += 1;
        self.write_chunk(address, FileKind::Data, &done.bytes)
    }

    fn write_exponent_chunk(&mut self, iteration: usize, sb: usize, done: FinishedChunk) -> Result<()> {
        let address = ChunkAddress::exponent(iteration, sb, done.chunk);
        let packed = compression::pack(self.format.exponent_compression(), &done.bytes)?;
        self.summary.exponent_chunks += 1;
        self.write_chunk(address, FileKind::Exponent, &packed)
    }

    /// Append a chunk to its file; the first chunk of a file creates it
    fn write_chunk(&mut self, address: ChunkAddress, kind: FileKind, bytes: &[u8]) -> Result<()> {
        let path = self.format.chunk_file_path(address, kind);
        trace!(path = %path, address = address.pack(), bytes = bytes.len(), "chunk flushed");
        match self.files.get_mut(&path) {
            Some(footer) => {
                self.storage.append(&path, bytes)?;
                footer.push(address.pack(), bytes.len() as u64);
            }
            None => {
                self.storage.write(&path, bytes)?;
                let mut footer = FileFooter::default();
                footer.push(address.pack(), bytes.len() as u64);
                self.files.insert(path, footer);
            }
        }
        self.summary.total_bytes += bytes.len() as u64;
        Ok(())
    }

    /// Flush every open chunk and terminate every file with its chunk table
    fn finish(&mut self) -> Result<()> {
        let channels = std::mem::take(&mut self.channels);
        for ((iteration, sb, bp), mut channel) in channels {
            if let Some(done) = channel.flush() {
                self.write_data_chunk(iteration as usize, sb as usize, bp, done)?;
            }
        }
        let sub_channels = std::mem::take(&mut self.sub_channels);
        for ((iteration, sb), mut sub) in sub_channels {
            if let Some(done) = sub.flush() {
                self.write_exponent_chunk(iteration as usize, sb as usize, done)?;
            }
        }
        for (path, footer) in &self.files {
            self.storage.append(path, &footer.encode())?;
            trace!(path = %path, chunks = footer.addresses.len(), "file footer written");
        }
        self.summary.files = self.files.len();
        debug!(
            files = self.files.len(),
            data_chunks = self.summary.data_chunks,
            exponent_chunks = self.summary.exponent_chunks,
            "chunk files closed"
        );
        Ok(())
    }

    /// Rank the data chunks and store one truncation table per (iteration, file)
    fn write_truncation_tables(&mut self) -> Result<Vec<u64>> {
        let divisors = self.format.quality_levels();
        if divisors.is_empty() {
            return Ok(Vec::new());
        }
        let plan = rdo::optimize(self.format, &self.rdo_chunks, divisors);
        for ((iteration, file), table) in &plan.files {
            let chunk = file << self.format.iteration(*iteration as usize).chunk_bits;
            let path = self
                .format
                .chunk_file_path(ChunkAddress::new(*iteration as usize, 0, 0, chunk), FileKind::Rdo);
            self.storage.write(&path, &bincode::serialize(table)?)?;
        }
        self.summary.files += plan.files.len();
        Ok(plan.budgets)
    }
}

/// Fill the part of a parent not covered by children by repeating the
/// nearest covered sample
fn fill_missing(data: &mut Array3<i64>, filled: IVec3) {
    let (nx, ny, nz) = data.dim();
    let max = filled - IVec3::ONE;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let p = IVec3::new(x as i32, y as i32, z as i32);
                let src = p.min(max);
                if src != p {
                    data[[x, y, z]] = data[[src.x as usize, src.y as usize, src.z as usize]];
                }
            }
        }
    }
}

/// Encode `volume` into `storage` and record the statistics in `format`.
///
/// Writes every data, exponent and truncation file plus the metadata file.
pub fn encode(format: &mut VolumeFormat, volume: &Volume, storage: &dyn Storage) -> Result<EncodeSummary> {
    if volume.dims() != format.dims() {
        return Err(WzError::InvalidDimensions(format!(
            "volume is {:?}, format expects {:?}",
            volume.dims(),
            format.dims()
        )));
    }
    if volume.data_type() != format.data_type() {
        return Err(WzError::InvalidFormat(format!(
            "volume holds {}, format expects {}",
            volume.data_type(),
            format.data_type()
        )));
    }
    let value_range = volume.value_range();
    if !value_range.max_abs().is_finite() {
        return Err(WzError::InvalidFormat(
            "volume contains non-finite samples".to_string(),
        ));
    }
    let quantizer = Quantizer::for_volume(format.data_type(), &value_range, format.accuracy());
    info!(
        name = %format.name(),
        dims = ?format.dims(),
        data_type = %format.data_type(),
        iterations = format.n_iterations(),
        scale_exponent = quantizer.scale_exponent(),
        "encode started"
    );

    let (summary, rdo_levels, bit_planes) = {
        let mut data = EncodeData::new(format, storage, quantizer);
        data.encode_volume(volume)?;
        data.finish()?;
        let rdo_levels = data.write_truncation_tables()?;
        (data.summary, rdo_levels, data.bit_planes)
    };

    format.set_encode_stats(EncodeStats {
        value_range: Some(value_range),
        bit_plane_range: (!bit_planes.is_empty()).then_some(bit_planes),
        scale_exponent: Some(quantizer.scale_exponent()),
        rdo_levels: rdo_levels.clone(),
        total_bytes: summary.total_bytes,
    });
    write_meta_file(format, storage)?;

    let summary = EncodeSummary {
        bit_plane_range: bit_planes,
        rdo_levels,
        ..summary
    };
    info!(
        bricks = summary.bricks,
        files = summary.files,
        bytes = summary.total_bytes,
        ratio = %format!(
            "{:.2}",
            volume.as_bytes().len() as f64 / summary.total_bytes.max(1) as f64
        ),
        "encode finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStorage;
    use crate::layout::FormatBuilder;
    use crate::types::DataType;

    fn ramp(dims: IVec3) -> Volume {
        let mut v = Volume::new(dims, DataType::I16);
        for z in 0..dims.z {
            for y in 0..dims.y {
                for x in 0..dims.x {
                    v.set(IVec3::new(x, y, z), (x * 3 - y + 2 * z) as f64);
                }
            }
        }
        v
    }

    #[test]
    fn test_fill_missing_repeats_edge() {
        let mut data = Array3::<i64>::zeros((4, 4, 1));
        data[[0, 0, 0]] = 1;
        data[[1, 0, 0]] = 2;
        data[[0, 1, 0]] = 3;
        data[[1, 1, 0]] = 4;
        fill_missing(&mut data, IVec3::new(2, 2, 1));
        assert_eq!(data[[3, 0, 0]], 2);
        assert_eq!(data[[0, 3, 0]], 3);
        assert_eq!(data[[3, 3, 0]], 4);
    }

    #[test]
    fn test_encode_records_stats_and_files() {
        let storage = MemoryStorage::new();
        let mut format = FormatBuilder::new()
            .with_name("ramp")
            .with_dimensions(IVec3::new(40, 24, 8))
            .with_data_type(DataType::I16)
            .with_brick_size(IVec3::new(8, 8, 8))
            .with_num_iterations(2)
            .with_bricks_per_chunk(4)
            .with_chunks_per_file(2)
            .finalize()
            .unwrap();
        let volume = ramp(format.dims());
        let summary = encode(&mut format, &volume, &storage).unwrap();

        // 5x3x1 bricks, then 3x2x1 parents
        assert_eq!(summary.bricks, 15 + 6);
        assert!(summary.data_chunks > 0);
        assert!(summary.exponent_chunks > 0);
        let stats = format.encode_stats();
        assert_eq!(stats.scale_exponent, Some(0));
        assert_eq!(stats.total_bytes, summary.total_bytes);
        assert!(stats.bit_plane_range.is_some());
        assert!(storage.exists("ramp.wzmeta").unwrap());
        // payload files plus the metadata file
        assert_eq!(storage.file_count(), summary.files + 1);
    }

    #[test]
    fn test_encode_rejects_mismatched_volume() {
        let storage = MemoryStorage::new();
        let mut format = FormatBuilder::new()
            .with_dimensions(IVec3::splat(16))
            .with_brick_size(IVec3::splat(8))
            .finalize()
            .unwrap();
        let wrong = Volume::new(IVec3::splat(8), DataType::F32);
        assert!(matches!(
            encode(&mut format, &wrong, &storage),
            Err(WzError::InvalidDimensions(_))
        ));
        let wrong = Volume::new(IVec3::splat(16), DataType::U8);
        assert!(matches!(
            encode(&mut format, &wrong, &storage),
            Err(WzError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_quality_levels_write_truncation_tables() {
        let storage = MemoryStorage::new();
        let mut format = FormatBuilder::new()
            .with_name("q")
            .with_dimensions(IVec3::splat(32))
            .with_data_type(DataType::I16)
            .with_brick_size(IVec3::splat(8))
            .with_bricks_per_chunk(8)
            .with_quality_levels(&[16, 4, 1])
            .finalize()
            .unwrap();
        let volume = ramp(format.dims());
        let summary = encode(&mut format, &volume, &storage).unwrap();
        assert_eq!(summary.rdo_levels.len(), 3);
        assert!(summary.rdo_levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(format.encode_stats().rdo_levels, summary.rdo_levels);
        let rdo_path = format.chunk_file_path(ChunkAddress::new(0, 0, 0, 0), FileKind::Rdo);
        assert!(rdo_path.ends_with(".rdo"));
        assert!(storage.exists(&rdo_path).unwrap());
    }
}

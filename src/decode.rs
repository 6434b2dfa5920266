//! Decoder
//!
//! A [`DecodeQuery`] names a region, an output level, a subband mask and a
//! precision. The session walks the iterations from the coarsest down to the
//! output level, touching only the bricks whose footprint overlaps the
//! region: the last iteration's low-pass band is read from its channels,
//! every finer brick takes its low-pass band from the reconstructed parent.
//! Bit-planes are read most significant first and reading stops at the
//! lowest plane the query asks for.

use crate::address::{BrickTraverse, ChunkAddress};
use crate::bitstream::BitReader;
use crate::cache::{CacheStats, FileCacheTable};
use crate::channel::{decode_block_plane, read_exponents, BlockLayout, BlockState};
use crate::error::{Result, WzError};
use crate::io::Storage;
use crate::layout::{Subband, VolumeFormat};
use crate::transform::{Cdf53Lifting, Quantizer, WaveletTransform};
use crate::types::Extent;
use crate::volume::Volume;
use glam::IVec3;
use ndarray::Array3;
use std::collections::HashMap;
use tracing::{debug, info};

/// What to decode. Every field is independent; unset fields mean "all".
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeQuery {
    /// Region in full-resolution sample coordinates; `None` is the whole volume
    extent: Option<Extent>,
    /// Bit `i` selects subband `i` at the output level
    mask: u8,
    /// Output level: 0 is full resolution
    iteration: usize,
    /// Absolute error the caller can tolerate; 0 decodes every plane
    accuracy: f64,
    /// Bit-planes to decode, counted down from the highest plane in the volume
    bit_planes: Option<u32>,
    /// Quality level of the rate-distortion tables
    quality: Option<usize>,
}

impl Default for DecodeQuery {
    fn default() -> Self {
        Self {
            extent: None,
            mask: u8::MAX,
            iteration: 0,
            accuracy: 0.0,
            bit_planes: None,
            quality: None,
        }
    }
}

impl DecodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.extent = Some(extent);
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_bit_planes(mut self, bit_planes: u32) -> Self {
        self.bit_planes = Some(bit_planes);
        self
    }

    pub fn with_quality(mut self, quality: usize) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn extent(&self) -> Option<Extent> {
        self.extent
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn bit_planes(&self) -> Option<u32> {
        self.bit_planes
    }

    pub fn quality(&self) -> Option<usize> {
        self.quality
    }
}

/// A reconstructed brick and the subbands that went into it
#[derive(Debug)]
struct Brick {
    brick3: IVec3,
    data: Array3<i64>,
    valid_subbands: u8,
}

/// Work done by a session so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    pub queries: u64,
    pub bricks: u64,
    /// Brick-subband bit-planes read
    pub planes: u64,
}

/// One decode session: a format, its storage and the caches of every query
/// issued through it
pub struct DecodeSession<'a> {
    format: &'a VolumeFormat,
    storage: &'a dyn Storage,
    quantizer: Quantizer,
    transform: Cdf53Lifting,
    cache: FileCacheTable,
    stats: DecodeStats,
}

impl<'a> DecodeSession<'a> {
    pub fn new(format: &'a VolumeFormat, storage: &'a dyn Storage) -> Result<Self> {
        let scale_exponent = format.encode_stats().scale_exponent.ok_or_else(|| {
            WzError::InvalidFormat(format!("{} has not been encoded", format.name()))
        })?;
        Ok(Self {
            format,
            storage,
            quantizer: Quantizer::new(format.data_type(), scale_exponent),
            transform: Cdf53Lifting,
            cache: FileCacheTable::new(),
            stats: DecodeStats::default(),
        })
    }

    pub fn format(&self) -> &VolumeFormat {
        self.format
    }

    pub fn cache(&self) -> &FileCacheTable {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Extent of the output on the grid of the query's level
    pub fn output_extent(&self, query: &DecodeQuery) -> Result<Extent> {
        let format = self.format;
        if query.iteration() >= format.n_iterations() {
            return Err(WzError::OutOfBounds(format!(
                "level {} of a {}-iteration volume",
                query.iteration(),
                format.n_iterations()
            )));
        }
        let requested = query.extent().unwrap_or_else(|| format.level_extent(0));
        let scale = format.iteration(query.iteration()).scale3;
        requested
            .coarsen(scale)
            .intersect(&format.level_extent(query.iteration()))
            .ok_or_else(|| {
                WzError::OutOfBounds(format!("{:?} does not intersect the volume", requested))
            })
    }

    pub fn decode(&mut self, query: &DecodeQuery) -> Result<Volume> {
        let format = self.format;
        let n_iterations = format.n_iterations();
        let target = query.iteration();
        let extent = self.output_extent(query)?;
        if let Some(level) = query.quality() {
            let n_levels = format.encode_stats().rdo_levels.len();
            if level >= n_levels {
                return Err(WzError::Configuration(format!(
                    "quality level {} requested, {} available",
                    level, n_levels
                )));
            }
        }
        debug!(
            level = target,
            extent = ?extent,
            mask = query.mask(),
            accuracy = query.accuracy(),
            bit_planes = ?query.bit_planes(),
            quality = ?query.quality(),
            "decode started"
        );

        // coarser levels only feed the low band of the output level
        let top = if query.mask() & 1 == 0 {
            target + 1
        } else {
            n_iterations
        };

        // bricks needed at each level, from the output level up
        let mut ranges = vec![extent.coarsen(format.brick_dims())];
        for _ in target + 1..top {
            let finer = ranges[ranges.len() - 1];
            ranges.push(finer.coarsen(format.group_brick3()));
        }

        let mut out = Volume::new(extent.dims, format.data_type());
        let mut parents: HashMap<u64, Brick> = HashMap::new();
        for iteration in (target..top).rev() {
            let layout = format.iteration(iteration);
            let mut current = HashMap::new();
            for brick in layout.traverse_volume(&ranges[iteration - target]) {
                let decoded = self.decode_brick(iteration, &brick, query, &parents)?;
                if iteration == target {
                    self.write_output(&decoded, &extent, &mut out);
                } else {
                    current.insert(brick.address, decoded);
                }
            }
            parents = current;
        }
        self.stats.queries += 1;

        info!(
            level = target,
            samples = extent.num_samples(),
            cache_files = self.cache.num_files(),
            cache_bytes = self.cache.size_bytes(),
            "decode finished"
        );
        Ok(out)
    }

    fn decode_brick(
        &mut self,
        iteration: usize,
        brick: &BrickTraverse,
        query: &DecodeQuery,
        parents: &HashMap<u64, Brick>,
    ) -> Result<Brick> {
        let format = self.format;
        let layout = format.iteration(iteration);
        let chunk = brick.address >> layout.brick_bits;
        let last = iteration + 1 == format.n_iterations();
        let mask = if iteration == query.iteration() {
            query.mask() & format.all_subbands_mask()
        } else {
            format.all_subbands_mask()
        };
        let ext = format.brick_dims_ext();
        let mut out = Brick {
            brick3: brick.brick3,
            data: Array3::zeros((ext.x as usize, ext.y as usize, ext.z as usize)),
            valid_subbands: 0,
        };

        if !last && mask & 1 != 0 {
            let group = format.group_brick3();
            let parent3 = brick.brick3 / group;
            let ordinal = format.iteration(iteration + 1).locate_brick(parent3).ordinal;
            let parent = parents.get(&ordinal).ok_or_else(|| {
                WzError::BrickNotFound(format!("{:?} at iteration {}", parent3, iteration + 1))
            })?;
            let low = format.subbands_non_ext()[0].grid;
            let offset = (brick.brick3 - parent3 * group) * low.dims;
            for z in 0..low.dims.z {
                for y in 0..low.dims.y {
                    for x in 0..low.dims.x {
                        let local = IVec3::new(x, y, z);
                        let src = offset + local;
                        let dst = low.position(local);
                        out.data[[dst.x as usize, dst.y as usize, dst.z as usize]] =
                            parent.data[[src.x as usize, src.y as usize, src.z as usize]];
                    }
                }
            }
            out.valid_subbands |= 1;
        }

        for (sb, subband) in format.subbands_non_ext().iter().enumerate() {
            if (subband.is_low_pass() && !last) || mask & (1 << sb) == 0 {
                continue;
            }
            self.decode_subband(iteration, sb, subband, chunk, brick.brick_in_chunk, query, &mut out.data)?;
            out.valid_subbands |= 1 << sb;
        }

        self.transform.inverse(&mut out.data, format.transformed_axes());
        self.stats.bricks += 1;
        Ok(out)
    }

    /// Inverse lifting passes between the coarsest iteration and `level`
    fn synthesis_passes(&self, level: usize) -> u32 {
        let format = self.format;
        let axes = format.transformed_axes().iter().filter(|&&t| t).count();
        (axes * (format.n_iterations() - level)) as u32
    }

    /// Lowest bit-plane the query keeps for one chunk chain
    fn lowest_plane(&mut self, address: ChunkAddress, query: &DecodeQuery) -> Result<i32> {
        let passes = self.synthesis_passes(query.iteration());
        let mut lowest = self.quantizer.min_bit_plane(query.accuracy(), passes) as i32;
        if let Some(count) = query.bit_planes() {
            let top = self
                .format
                .encode_stats()
                .bit_plane_range
                .map(|r| r.max as i32)
                .unwrap_or(-1);
            lowest = lowest.max(top - count as i32 + 1);
        }
        if let Some(level) = query.quality() {
            let plane = self
                .cache
                .truncation_plane(self.format, self.storage, address, level)?;
            lowest = lowest.max(plane as i32);
        }
        Ok(lowest.max(0))
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_subband(
        &mut self,
        iteration: usize,
        sb: usize,
        subband: &Subband,
        chunk: u64,
        brick_in_chunk: u64,
        query: &DecodeQuery,
        data: &mut Array3<i64>,
    ) -> Result<()> {
        let format = self.format;
        let exp_address = ChunkAddress::exponent(iteration, sb, chunk);
        let exponents = self.cache.exponent_chunk(format, self.storage, exp_address)?;
        let blocks_layout = BlockLayout::new(subband.grid, format.block_dims());
        let (brick_emax, emaxes) = match exponents.brick(brick_in_chunk) {
            Some(bytes) => read_exponents(bytes, blocks_layout.n_blocks()),
            None => {
                return Err(WzError::BrickNotFound(format!(
                    "brick {} of exponent chunk {:#018x}",
                    brick_in_chunk,
                    exp_address.pack()
                )))
            }
        };
        if brick_emax == 0 {
            return Ok(());
        }

        let lowest = self.lowest_plane(ChunkAddress::new(iteration, sb, 0, chunk), query)?;
        if lowest >= brick_emax as i32 {
            return Ok(());
        }
        let mut blocks = blocks_layout.empty_blocks();
        let mut states = vec![BlockState::default(); blocks.len()];
        for bp in (lowest as u32..brick_emax as u32).rev() {
            let address = ChunkAddress::new(iteration, sb, bp as u16, chunk);
            let plane = self.cache.data_chunk(format, self.storage, address)?;
            let bytes = plane.brick(brick_in_chunk).ok_or_else(|| {
                WzError::BrickNotFound(format!(
                    "brick {} of chunk {:#018x}",
                    brick_in_chunk,
                    address.pack()
                ))
            })?;
            let mut reader = BitReader::new(bytes);
            for ((block, state), &emax) in blocks.iter_mut().zip(states.iter_mut()).zip(&emaxes) {
                if emax as u32 > bp {
                    decode_block_plane(&mut reader, block, bp, state);
                }
            }
            self.stats.planes += 1;
        }
        blocks_layout.scatter(&blocks, data, lowest as u32);
        Ok(())
    }

    /// Copy the part of an output-level brick that lies in `extent`
    fn write_output(&self, brick: &Brick, extent: &Extent, out: &mut Volume) {
        let brick_dims = self.format.brick_dims();
        let origin = brick.brick3 * brick_dims;
        let Some(region) = Extent::new(origin, brick_dims).intersect(extent) else {
            return;
        };
        // the output starts zeroed
        if brick.valid_subbands == 0 {
            return;
        }
        for z in region.from.z..region.to().z {
            for y in region.from.y..region.to().y {
                for x in region.from.x..region.to().x {
                    let p = IVec3::new(x, y, z);
                    let local = p - origin;
                    let q = brick.data[[local.x as usize, local.y as usize, local.z as usize]];
                    out.set(p - extent.from, self.quantizer.from_coefficient(q));
                }
            }
        }
    }
}

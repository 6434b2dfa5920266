//! Format descriptor - global layout parameters and the tables derived from them
//!
//! A [`FormatBuilder`] collects user parameters through `with_*` setters.
//! [`FormatBuilder::finalize`] validates them and computes, per iteration, the
//! brick/chunk/file counts, the space-filling ordering codes and the subband
//! grids. The resulting [`VolumeFormat`] is shared read-only by every encode
//! and decode run; only the statistics recorded by the encoder are written
//! into it afterwards.

use crate::address::{OrderCode, OrderScheme};
use crate::compression::CompressionMethod;
use crate::error::{Result, WzError};
use crate::metadata::Version;
use crate::types::{
    ceil_div3, next_pow2_3, BitPlaneRange, DataType, Extent, Grid, ValueRange,
};
use crate::utils::{is_pow2, log2_exact};
use glam::IVec3;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MAX_BRICKS_PER_CHUNK: u32 = 32768;
pub const MAX_CHUNKS_PER_FILE: u32 = 4096;
pub const MAX_FILES_PER_DIR: u32 = 4096;
/// Keeps the number of blocks per subband representable in two bytes
pub const MAX_BRICK_DIM: i32 = 256;
pub const MAX_ITERATIONS: usize = 16;
pub const MAX_TRANSFORM_PASSES_PER_ITERATION: u32 = 9;
/// Edge of the fixed-size block used by the bit-plane coder
pub const BLOCK_DIM: i32 = 4;
/// Ordinals of bricks within one iteration must fit this many bits
pub const MAX_ORDINAL_BITS: u32 = 62;
/// Width of the chunk/file index field of a packed address
pub const MAX_INDEX_BITS: u32 = 42;

/// One frequency component produced by a transform pass over a brick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subband {
    /// Positions of this subband's coefficients inside the brick buffer
    pub grid: Grid,
    /// 0 = low-pass, 1 = high-pass, per axis
    pub low_high: IVec3,
}

impl Subband {
    pub fn is_low_pass(&self) -> bool {
        self.low_high == IVec3::ZERO
    }
}

/// Derived layout of one transform iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationLayout {
    /// Bricks actually covering the volume at this iteration
    pub n_bricks3: IVec3,
    /// `n_bricks3` rounded up to powers of two; the ordinal space
    pub n_bricks3_pow2: IVec3,
    pub bricks_per_chunk3: IVec3,
    pub chunks_per_file3: IVec3,
    pub n_chunks3: IVec3,
    pub n_files3: IVec3,
    /// log2 of bricks per chunk / chunks per file / files per volume
    pub brick_bits: u32,
    pub chunk_bits: u32,
    pub file_bits: u32,
    /// Volume-wide brick order; the concatenation of the three codes below
    pub brick_order: OrderCode,
    pub brick_order_chunk: OrderCode,
    pub chunk_order_file: OrderCode,
    pub file_order: OrderCode,
    /// Full-resolution samples per sample of this iteration, per axis
    pub scale3: IVec3,
}

impl IterationLayout {
    pub fn bricks_per_chunk(&self) -> u64 {
        1 << self.brick_bits
    }

    pub fn chunks_per_file(&self) -> u64 {
        1 << self.chunk_bits
    }

    pub fn files_per_volume(&self) -> u64 {
        1 << self.file_bits
    }

    pub fn chunks_per_volume(&self) -> u64 {
        1 << (self.chunk_bits + self.file_bits)
    }

    pub fn bricks_per_volume(&self) -> u64 {
        1 << self.brick_order.len()
    }

    pub fn total_bricks(&self) -> i64 {
        crate::types::prod(self.n_bricks3)
    }
}

/// User-supplied format parameters; finalize into a [`VolumeFormat`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatBuilder {
    name: String,
    field: String,
    version: Version,
    dims: IVec3,
    data_type: DataType,
    brick_dims: IVec3,
    n_iterations: u8,
    transform_passes: u32,
    accuracy: f64,
    bricks_per_chunk: u32,
    chunks_per_file: u32,
    files_per_dir: u32,
    order_scheme: OrderScheme,
    group_iterations: bool,
    group_levels: bool,
    group_bit_planes: bool,
    quality_levels: Vec<u32>,
    exponent_compression: CompressionMethod,
    #[serde(skip)]
    dir: Option<PathBuf>,
}

impl Default for FormatBuilder {
    fn default() -> Self {
        Self {
            name: "volume".to_string(),
            field: "data".to_string(),
            version: Version::CURRENT,
            dims: IVec3::splat(256),
            data_type: DataType::F32,
            brick_dims: IVec3::splat(32),
            n_iterations: 1,
            transform_passes: 1,
            accuracy: 0.0,
            bricks_per_chunk: 512,
            chunks_per_file: 4096,
            files_per_dir: 4096,
            order_scheme: OrderScheme::Morton,
            group_iterations: false,
            group_levels: true,
            group_bit_planes: false,
            quality_levels: Vec::new(),
            exponent_compression: CompressionMethod::Zstd,
            dir: None,
        }
    }
}

impl FormatBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_dimensions(mut self, dims: IVec3) -> Self {
        self.dims = dims;
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_brick_size(mut self, brick_dims: IVec3) -> Self {
        self.brick_dims = brick_dims;
        self
    }

    pub fn with_num_iterations(mut self, n_iterations: u8) -> Self {
        self.n_iterations = n_iterations;
        self
    }

    pub fn with_transform_passes(mut self, passes: u32) -> Self {
        self.transform_passes = passes;
        self
    }

    /// Target absolute error; 0 asks for the finest quantization available
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_bricks_per_chunk(mut self, bricks_per_chunk: u32) -> Self {
        self.bricks_per_chunk = bricks_per_chunk;
        self
    }

    pub fn with_chunks_per_file(mut self, chunks_per_file: u32) -> Self {
        self.chunks_per_file = chunks_per_file;
        self
    }

    pub fn with_files_per_directory(mut self, files_per_dir: u32) -> Self {
        self.files_per_dir = files_per_dir;
        self
    }

    /// Output directory, created (idempotently) by `finalize`
    pub fn with_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_order_scheme(mut self, scheme: OrderScheme) -> Self {
        self.order_scheme = scheme;
        self
    }

    pub fn with_group_iterations(mut self, group: bool) -> Self {
        self.group_iterations = group;
        self
    }

    pub fn with_group_levels(mut self, group: bool) -> Self {
        self.group_levels = group;
        self
    }

    pub fn with_group_bit_planes(mut self, group: bool) -> Self {
        self.group_bit_planes = group;
        self
    }

    /// Quality levels as size divisors: level budget = encoded bytes / divisor
    pub fn with_quality_levels(mut self, levels: &[u32]) -> Self {
        self.quality_levels = levels.to_vec();
        self
    }

    pub fn with_exponent_compression(mut self, method: CompressionMethod) -> Self {
        self.exponent_compression = method;
        self
    }

    /// Validate the parameters and derive every layout table
    pub fn finalize(self) -> Result<VolumeFormat> {
        self.validate()?;

        let transformed = [
            self.brick_dims.x > 1,
            self.brick_dims.y > 1,
            self.brick_dims.z > 1,
        ];
        let axis_mask = IVec3::new(
            transformed[0] as i32,
            transformed[1] as i32,
            transformed[2] as i32,
        );
        let group_brick3 = IVec3::ONE + axis_mask;
        let brick_dims_ext = self.brick_dims + axis_mask;
        let block_dims = IVec3::splat(BLOCK_DIM).min(self.brick_dims);

        let brick_bits_in = log2_exact(self.bricks_per_chunk as u64);
        let chunk_bits_in = log2_exact(self.chunks_per_file as u64);

        let mut iterations: Vec<IterationLayout> = Vec::with_capacity(self.n_iterations as usize);
        let mut n_bricks3 = ceil_div3(self.dims, self.brick_dims);
        let mut scale3 = IVec3::ONE;
        for iteration in 0..self.n_iterations {
            if iteration > 0 {
                n_bricks3 = ceil_div3(n_bricks3, group_brick3);
                scale3 *= group_brick3;
            }
            let pow2 = next_pow2_3(n_bricks3);
            let total_bits = pow2.x.trailing_zeros() + pow2.y.trailing_zeros() + pow2.z.trailing_zeros();
            if total_bits > MAX_ORDINAL_BITS {
                return Err(WzError::InvalidDimensions(format!(
                    "{} bricks per volume at iteration {} exceed the ordinal space",
                    crate::types::prod(n_bricks3),
                    iteration
                )));
            }
            let brick_order = match iterations.last() {
                Some(finer) => finer.brick_order.coarsen(transformed),
                None => OrderCode::build(pow2, self.order_scheme),
            };
            debug_assert_eq!(brick_order.extent3(), pow2);
            let brick_bits = brick_bits_in.min(total_bits);
            let chunk_bits = chunk_bits_in.min(total_bits - brick_bits);
            let file_bits = total_bits - brick_bits - chunk_bits;
            if chunk_bits + file_bits > MAX_INDEX_BITS {
                return Err(WzError::InvalidDimensions(format!(
                    "too many chunks per volume at iteration {}",
                    iteration
                )));
            }
            let (brick_order_chunk, rest) = brick_order.split(brick_bits);
            let (chunk_order_file, file_order) = rest.split(chunk_bits);
            let bricks_per_chunk3 = brick_order_chunk.extent3();
            let chunks_per_file3 = chunk_order_file.extent3();
            let n_chunks3 = pow2 / bricks_per_chunk3;
            let n_files3 = n_chunks3 / chunks_per_file3;
            iterations.push(IterationLayout {
                n_bricks3,
                n_bricks3_pow2: pow2,
                bricks_per_chunk3,
                chunks_per_file3,
                n_chunks3,
                n_files3,
                brick_bits,
                chunk_bits,
                file_bits,
                brick_order,
                brick_order_chunk,
                chunk_order_file,
                file_order,
                scale3,
            });
        }

        let subbands = build_subbands(brick_dims_ext, transformed);
        let subbands_non_ext = build_subbands(self.brick_dims, transformed);

        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                WzError::CannotCreateDirectory(format!("{}: {}", dir.display(), e))
            })?;
        }

        debug!(
            name = %self.name,
            field = %self.field,
            dims = ?self.dims,
            brick_dims = ?self.brick_dims,
            iterations = self.n_iterations,
            subbands = subbands.len(),
            "format finalized"
        );

        Ok(VolumeFormat {
            params: self,
            brick_dims_ext,
            block_dims,
            transformed,
            group_brick3,
            iterations,
            subbands,
            subbands_non_ext,
            stats: EncodeStats::default(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.version.major != Version::CURRENT.major {
            return Err(WzError::NotSupportedInVersion(format!(
                "format version {}.{}",
                self.version.major, self.version.minor
            )));
        }
        if self.dims.cmplt(IVec3::ONE).any() {
            return Err(WzError::InvalidDimensions(format!(
                "volume dimensions must be positive, got {:?}",
                self.dims
            )));
        }
        for d in self.brick_dims.to_array() {
            if d < 1 || !is_pow2(d as u64) {
                return Err(WzError::BrickSizeNotPowerOfTwo(format!("{:?}", self.brick_dims)));
            }
            if d > MAX_BRICK_DIM {
                return Err(WzError::BrickSizeTooBig(format!(
                    "{:?} exceeds {}",
                    self.brick_dims, MAX_BRICK_DIM
                )));
            }
        }
        if self.brick_dims == IVec3::ONE {
            return Err(WzError::InvalidDimensions(
                "a brick must span at least two samples along one axis".to_string(),
            ));
        }
        if self.n_iterations == 0 {
            return Err(WzError::Configuration(
                "at least one iteration is required".to_string(),
            ));
        }
        if self.n_iterations as usize > MAX_ITERATIONS {
            return Err(WzError::TooManyIterations(format!(
                "{} > {}",
                self.n_iterations, MAX_ITERATIONS
            )));
        }
        if self.transform_passes == 0 {
            return Err(WzError::Configuration(
                "at least one transform pass per iteration is required".to_string(),
            ));
        }
        if self.transform_passes > MAX_TRANSFORM_PASSES_PER_ITERATION {
            return Err(WzError::TooManyTransformPassesPerIteration(format!(
                "{} > {}",
                self.transform_passes, MAX_TRANSFORM_PASSES_PER_ITERATION
            )));
        }
        if self.transform_passes != 1 {
            return Err(WzError::NotSupportedInVersion(format!(
                "{} transform passes per iteration",
                self.transform_passes
            )));
        }
        if !is_pow2(self.bricks_per_chunk as u64) {
            return Err(WzError::BricksPerChunkNotPowerOf2(self.bricks_per_chunk));
        }
        if self.bricks_per_chunk > MAX_BRICKS_PER_CHUNK {
            return Err(WzError::TooManyBricksPerChunk(format!(
                "{} > {}",
                self.bricks_per_chunk, MAX_BRICKS_PER_CHUNK
            )));
        }
        if !is_pow2(self.chunks_per_file as u64) {
            return Err(WzError::ChunksPerFileNotPowerOf2(self.chunks_per_file));
        }
        if self.chunks_per_file > MAX_CHUNKS_PER_FILE {
            return Err(WzError::TooManyChunksPerFile(format!(
                "{} > {}",
                self.chunks_per_file, MAX_CHUNKS_PER_FILE
            )));
        }
        if !is_pow2(self.files_per_dir as u64) {
            return Err(WzError::FilesPerDirNotPowerOf2(self.files_per_dir));
        }
        if self.files_per_dir > MAX_FILES_PER_DIR {
            return Err(WzError::TooManyFilesPerDir(format!(
                "{} > {}",
                self.files_per_dir, MAX_FILES_PER_DIR
            )));
        }
        if self.files_per_dir < 2 {
            return Err(WzError::Configuration(
                "files per directory must be at least 2".to_string(),
            ));
        }
        if !self.data_type.is_codec_supported() {
            return Err(WzError::NotSupportedInVersion(format!(
                "data type {}",
                self.data_type
            )));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(WzError::Configuration(format!(
                "accuracy must be a non-negative number, got {}",
                self.accuracy
            )));
        }
        if self.quality_levels.iter().any(|&q| q == 0) {
            return Err(WzError::Configuration(
                "quality level divisors must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Statistics the encoder records into the format; read-only afterwards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeStats {
    pub value_range: Option<ValueRange>,
    pub bit_plane_range: Option<BitPlaneRange>,
    /// Quantization scale `s` in `q = round(v * 2^s)`
    pub scale_exponent: Option<i32>,
    /// Byte budget of each quality level, ascending
    pub rdo_levels: Vec<u64>,
    /// Bytes of chunk payload written, exponent streams included
    pub total_bytes: u64,
}

/// Finalized, immutable format descriptor
#[derive(Debug, Clone)]
pub struct VolumeFormat {
    params: FormatBuilder,
    brick_dims_ext: IVec3,
    block_dims: IVec3,
    transformed: [bool; 3],
    group_brick3: IVec3,
    iterations: Vec<IterationLayout>,
    subbands: Vec<Subband>,
    subbands_non_ext: Vec<Subband>,
    stats: EncodeStats,
}

impl VolumeFormat {
    pub fn params(&self) -> &FormatBuilder {
        &self.params
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn field(&self) -> &str {
        &self.params.field
    }

    pub fn version(&self) -> Version {
        self.params.version
    }

    pub fn dims(&self) -> IVec3 {
        self.params.dims
    }

    pub fn data_type(&self) -> DataType {
        self.params.data_type
    }

    pub fn brick_dims(&self) -> IVec3 {
        self.params.brick_dims
    }

    /// Brick extent plus the one-sample halo on every transformed axis
    pub fn brick_dims_ext(&self) -> IVec3 {
        self.brick_dims_ext
    }

    pub fn block_dims(&self) -> IVec3 {
        self.block_dims
    }

    pub fn transformed_axes(&self) -> [bool; 3] {
        self.transformed
    }

    /// How many bricks of iteration i make up one brick of iteration i + 1
    pub fn group_brick3(&self) -> IVec3 {
        self.group_brick3
    }

    pub fn n_iterations(&self) -> usize {
        self.iterations.len()
    }

    pub fn accuracy(&self) -> f64 {
        self.params.accuracy
    }

    pub fn files_per_dir(&self) -> u32 {
        self.params.files_per_dir
    }

    pub fn order_scheme(&self) -> OrderScheme {
        self.params.order_scheme
    }

    pub fn group_iterations(&self) -> bool {
        self.params.group_iterations
    }

    pub fn group_levels(&self) -> bool {
        self.params.group_levels
    }

    pub fn group_bit_planes(&self) -> bool {
        self.params.group_bit_planes
    }

    pub fn quality_levels(&self) -> &[u32] {
        &self.params.quality_levels
    }

    pub fn exponent_compression(&self) -> CompressionMethod {
        self.params.exponent_compression
    }

    pub fn dir(&self) -> Option<&Path> {
        self.params.dir.as_deref()
    }

    pub fn iteration(&self, iteration: usize) -> &IterationLayout {
        &self.iterations[iteration]
    }

    pub fn iterations(&self) -> &[IterationLayout] {
        &self.iterations
    }

    /// Subband grids over the padded brick (the transform's working set)
    pub fn subbands(&self) -> &[Subband] {
        &self.subbands
    }

    /// Subband grids over the unpadded brick (the coefficients that are stored)
    pub fn subbands_non_ext(&self) -> &[Subband] {
        &self.subbands_non_ext
    }

    /// Decode mask selecting every subband
    pub fn all_subbands_mask(&self) -> u8 {
        ((1u16 << self.subbands.len()) - 1) as u8
    }

    /// Sample dimensions of the volume as seen at the given iteration
    pub fn level_dims(&self, iteration: usize) -> IVec3 {
        ceil_div3(self.params.dims, self.iterations[iteration].scale3)
    }

    pub fn level_extent(&self, iteration: usize) -> Extent {
        Extent::whole(self.level_dims(iteration))
    }

    pub fn encode_stats(&self) -> &EncodeStats {
        &self.stats
    }

    pub(crate) fn set_encode_stats(&mut self, stats: EncodeStats) {
        self.stats = stats;
    }

    /// Get a summary string of the format
    pub fn summary(&self) -> String {
        let layout = &self.iterations[0];
        format!(
            "{} / {}: {}x{}x{} {} in {}x{}x{} bricks ({} bricks, {} per chunk, {} chunks per file), {} iteration(s)",
            self.params.name,
            self.params.field,
            self.params.dims.x,
            self.params.dims.y,
            self.params.dims.z,
            self.params.data_type,
            self.params.brick_dims.x,
            self.params.brick_dims.y,
            self.params.brick_dims.z,
            layout.total_bricks(),
            layout.bricks_per_chunk(),
            layout.chunks_per_file(),
            self.iterations.len()
        )
    }
}

/// Enumerate the subbands of one transform pass over a brick of `dims`.
///
/// Subband `i` has its high-pass axes given by the bits of `i`; masks touching
/// an untransformed axis are skipped, so index 0 is always the low-pass band.
fn build_subbands(dims: IVec3, transformed: [bool; 3]) -> Vec<Subband> {
    let mut subbands = Vec::new();
    for mask in 0u8..8 {
        let low_high = IVec3::new(
            (mask & 1) as i32,
            ((mask >> 1) & 1) as i32,
            ((mask >> 2) & 1) as i32,
        );
        if (0..3).any(|a| low_high[a] == 1 && !transformed[a]) {
            continue;
        }
        let mut from = IVec3::ZERO;
        let mut extent = IVec3::ONE;
        let mut stride = IVec3::ONE;
        for a in 0..3 {
            if !transformed[a] {
                extent[a] = dims[a];
                continue;
            }
            stride[a] = 2;
            if low_high[a] == 0 {
                extent[a] = (dims[a] + 1) / 2;
            } else {
                from[a] = 1;
                extent[a] = dims[a] / 2;
            }
        }
        subbands.push(Subband {
            grid: Grid::new(from, extent, stride),
            low_high,
        });
    }
    subbands
}

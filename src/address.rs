//! Hierarchical addressing engine
//!
//! Every brick of an iteration has an ordinal under the iteration's
//! space-filling order. The low `brick_bits` of the ordinal give the brick's
//! position inside its chunk, the next `chunk_bits` the chunk's position
//! inside its file, the rest the file's position in the volume. Chunk
//! payloads are keyed by a packed 64-bit [`ChunkAddress`]; data files are
//! named by a dense file key nested into directories of bounded fan-out.

use crate::layout::{IterationLayout, VolumeFormat};
use crate::types::Extent;
use crate::utils::{bit_width, log2_exact};
use glam::IVec3;
use serde::{Deserialize, Serialize};

/// Space-filling enumeration used to order bricks, chunks and files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderScheme {
    /// Round-robin x, y, z over the remaining bits (Z-order)
    #[default]
    Morton,
    /// All x bits, then all y bits, then all z bits
    RowMajor,
}

impl OrderScheme {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "morton" | "z" | "zorder" => Some(OrderScheme::Morton),
            "rowmajor" | "row-major" | "row_major" => Some(OrderScheme::RowMajor),
            _ => None,
        }
    }
}

/// A packed sequence of axis digits, least significant ordinal bit first.
///
/// Digit `i` names the axis whose next coordinate bit becomes bit `i` of the
/// ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrderCode {
    packed: u128,
    len: u8,
}

impl OrderCode {
    pub const EMPTY: OrderCode = OrderCode { packed: 0, len: 0 };

    /// Build the code enumerating a `pow2` grid (each component a power of two)
    pub fn build(pow2: IVec3, scheme: OrderScheme) -> Self {
        let mut remaining = [
            log2_exact(pow2.x as u64),
            log2_exact(pow2.y as u64),
            log2_exact(pow2.z as u64),
        ];
        let mut code = Self::EMPTY;
        match scheme {
            OrderScheme::Morton => {
                while remaining.iter().any(|&r| r > 0) {
                    for (axis, r) in remaining.iter_mut().enumerate() {
                        if *r > 0 {
                            code.push(axis);
                            *r -= 1;
                        }
                    }
                }
            }
            OrderScheme::RowMajor => {
                for (axis, &r) in remaining.iter().enumerate() {
                    for _ in 0..r {
                        code.push(axis);
                    }
                }
            }
        }
        code
    }

    /// Code of the next coarser iteration: the first digit of every grouped
    /// axis is dropped.
    ///
    /// A parent's ordinal is then its children's ordinals with those digits
    /// removed, so parents complete in increasing ordinal order while the
    /// children are visited in theirs.
    pub fn coarsen(&self, grouped: [bool; 3]) -> Self {
        let mut dropped = [false; 3];
        let mut code = Self::EMPTY;
        for digit in 0..self.len() {
            let axis = self.axis(digit);
            if grouped[axis] && !dropped[axis] {
                dropped[axis] = true;
                continue;
            }
            code.push(axis);
        }
        code
    }

    fn push(&mut self, axis: usize) {
        debug_assert!(self.len < 64);
        self.packed |= (axis as u128) << (2 * self.len as u32);
        self.len += 1;
    }

    pub fn len(&self) -> u32 {
        self.len as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw packed digits
    pub fn packed(&self) -> u128 {
        self.packed
    }

    #[inline]
    pub fn axis(&self, digit: u32) -> usize {
        ((self.packed >> (2 * digit)) & 3) as usize
    }

    /// Split into the first `n` digits and the rest
    pub fn split(&self, n: u32) -> (OrderCode, OrderCode) {
        let n = n.min(self.len());
        if n == 0 {
            return (Self::EMPTY, *self);
        }
        let low = OrderCode {
            packed: self.packed & ((1u128 << (2 * n)) - 1),
            len: n as u8,
        };
        let high = OrderCode {
            packed: self.packed >> (2 * n),
            len: self.len - n as u8,
        };
        (low, high)
    }

    /// Digits per axis
    pub fn bits3(&self) -> IVec3 {
        let mut bits = IVec3::ZERO;
        for digit in 0..self.len() {
            bits[self.axis(digit)] += 1;
        }
        bits
    }

    /// Size of the grid this code enumerates
    pub fn extent3(&self) -> IVec3 {
        let bits = self.bits3();
        IVec3::new(1 << bits.x, 1 << bits.y, 1 << bits.z)
    }

    /// Coordinate to ordinal
    pub fn encode(&self, coord: IVec3) -> u64 {
        let mut shift = [0u32; 3];
        let mut ordinal = 0u64;
        for digit in 0..self.len() {
            let axis = self.axis(digit);
            let bit = ((coord[axis] as u64) >> shift[axis]) & 1;
            ordinal |= bit << digit;
            shift[axis] += 1;
        }
        ordinal
    }

    /// Ordinal to coordinate
    pub fn decode(&self, ordinal: u64) -> IVec3 {
        let mut shift = [0u32; 3];
        let mut coord = IVec3::ZERO;
        for digit in 0..self.len() {
            let axis = self.axis(digit);
            let bit = ((ordinal >> digit) & 1) as i32;
            coord[axis] |= bit << shift[axis];
            shift[axis] += 1;
        }
        coord
    }

    /// Visit every cell of the code's grid that lies in `bounds`, in
    /// increasing ordinal order. `origin` is the grid position of ordinal 0.
    pub fn traverse(&self, origin: IVec3, bounds: &Extent, mut visit: impl FnMut(IVec3, u64)) {
        struct Item {
            from: IVec3,
            dims: IVec3,
            ordinal: u64,
            digits: u32,
        }
        let mut stack = vec![Item {
            from: origin,
            dims: self.extent3(),
            ordinal: 0,
            digits: self.len(),
        }];
        while let Some(item) = stack.pop() {
            if Extent::new(item.from, item.dims).intersect(bounds).is_none() {
                continue;
            }
            if item.digits == 0 {
                visit(item.from, item.ordinal);
                continue;
            }
            let digit = item.digits - 1;
            let axis = self.axis(digit);
            let mut dims = item.dims;
            dims[axis] /= 2;
            let mut high_from = item.from;
            high_from[axis] += dims[axis];
            stack.push(Item {
                from: high_from,
                dims,
                ordinal: item.ordinal | (1 << digit),
                digits: digit,
            });
            stack.push(Item {
                from: item.from,
                dims,
                ordinal: item.ordinal,
                digits: digit,
            });
        }
    }
}

/// Where a brick sits in the brick/chunk/file hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickLocation {
    /// Ordinal of the brick in the whole iteration
    pub ordinal: u64,
    pub brick_in_chunk: u64,
    /// Index of the chunk in the whole iteration
    pub chunk: u64,
    pub chunk_in_file: u64,
    pub file: u64,
}

/// Running state of a walk over the files of an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTraverse {
    pub file3: IVec3,
    /// Ordinal of the file in the volume
    pub file_order: u64,
    pub prev_file_order: Option<u64>,
    /// Bricks owned by this file, clipped to the brick grid
    pub bricks: Extent,
    /// Files visited before this one
    pub n_prior: u64,
    /// Index of the file's first chunk
    pub address: u64,
}

/// Running state of a walk over the chunks of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTraverse {
    pub chunk3: IVec3,
    pub chunk_in_file: u64,
    pub prev_chunk_in_file: Option<u64>,
    pub bricks: Extent,
    pub n_prior: u64,
    /// Index of the chunk in the whole iteration
    pub address: u64,
}

/// Running state of a walk over the bricks of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickTraverse {
    pub brick3: IVec3,
    pub brick_in_chunk: u64,
    pub prev_brick_in_chunk: Option<u64>,
    pub n_prior: u64,
    /// Ordinal of the brick in the whole iteration
    pub address: u64,
}

impl IterationLayout {
    /// Bricks that exist at this iteration
    pub fn brick_grid(&self) -> Extent {
        Extent::whole(self.n_bricks3)
    }

    pub fn locate_brick(&self, brick3: IVec3) -> BrickLocation {
        let ordinal = self.brick_order.encode(brick3);
        let chunk = ordinal >> self.brick_bits;
        BrickLocation {
            ordinal,
            brick_in_chunk: ordinal & (self.bricks_per_chunk() - 1),
            chunk,
            chunk_in_file: chunk & (self.chunks_per_file() - 1),
            file: chunk >> self.chunk_bits,
        }
    }

    pub fn brick_coord(&self, ordinal: u64) -> IVec3 {
        self.brick_order.decode(ordinal)
    }

    pub fn chunk_coord(&self, chunk: u64) -> IVec3 {
        let (_, chunk_order) = self.brick_order.split(self.brick_bits);
        chunk_order.decode(chunk)
    }

    pub fn file_coord(&self, file: u64) -> IVec3 {
        self.file_order.decode(file)
    }

    /// Bricks covered by a chunk, clipped to the brick grid
    pub fn chunk_bricks(&self, chunk: u64) -> Option<Extent> {
        let from = self.chunk_coord(chunk) * self.bricks_per_chunk3;
        Extent::new(from, self.bricks_per_chunk3).intersect(&self.brick_grid())
    }

    fn file_bricks(&self, file3: IVec3) -> Option<Extent> {
        let span = self.bricks_per_chunk3 * self.chunks_per_file3;
        Extent::new(file3 * span, span).intersect(&self.brick_grid())
    }

    /// Files owning at least one brick of `query`, in file order
    pub fn traverse_files(&self, query: &Extent) -> Vec<FileTraverse> {
        let span = self.bricks_per_chunk3 * self.chunks_per_file3;
        let Some(bounds) = query.intersect(&self.brick_grid()) else {
            return Vec::new();
        };
        let file_bounds = Extent::new(
            bounds.from / span,
            crate::types::ceil_div3(bounds.to(), span) - bounds.from / span,
        );
        let mut out: Vec<FileTraverse> = Vec::new();
        self.file_order
            .traverse(IVec3::ZERO, &file_bounds, |file3, file_order| {
                if let Some(bricks) = self.file_bricks(file3) {
                    let prev = out.last().map(|f| f.file_order);
                    let n_prior = out.len() as u64;
                    out.push(FileTraverse {
                        file3,
                        file_order,
                        prev_file_order: prev,
                        bricks,
                        n_prior,
                        address: file_order << self.chunk_bits,
                    });
                }
            });
        out
    }

    /// Chunks of `file` owning at least one brick of `query`
    pub fn traverse_chunks(&self, file: &FileTraverse, query: &Extent) -> Vec<ChunkTraverse> {
        let Some(bounds) = query.intersect(&file.bricks) else {
            return Vec::new();
        };
        let bpc = self.bricks_per_chunk3;
        let chunk_bounds = Extent::new(
            bounds.from / bpc,
            crate::types::ceil_div3(bounds.to(), bpc) - bounds.from / bpc,
        );
        let origin = file.file3 * self.chunks_per_file3;
        let mut out: Vec<ChunkTraverse> = Vec::new();
        self.chunk_order_file
            .traverse(origin, &chunk_bounds, |chunk3, chunk_in_file| {
                if let Some(bricks) = Extent::new(chunk3 * bpc, bpc).intersect(&self.brick_grid()) {
                    let prev = out.last().map(|c| c.chunk_in_file);
                    let n_prior = out.len() as u64;
                    out.push(ChunkTraverse {
                        chunk3,
                        chunk_in_file,
                        prev_chunk_in_file: prev,
                        bricks,
                        n_prior,
                        address: file.address | chunk_in_file,
                    });
                }
            });
        out
    }

    /// Bricks of `chunk` inside `query`
    pub fn traverse_bricks(&self, chunk: &ChunkTraverse, query: &Extent) -> Vec<BrickTraverse> {
        let Some(bounds) = query.intersect(&chunk.bricks) else {
            return Vec::new();
        };
        let origin = chunk.chunk3 * self.bricks_per_chunk3;
        let mut out: Vec<BrickTraverse> = Vec::new();
        self.brick_order_chunk
            .traverse(origin, &bounds, |brick3, brick_in_chunk| {
                let prev = out.last().map(|b| b.brick_in_chunk);
                let n_prior = out.len() as u64;
                out.push(BrickTraverse {
                    brick3,
                    brick_in_chunk,
                    prev_brick_in_chunk: prev,
                    n_prior,
                    address: (chunk.address << self.brick_bits) | brick_in_chunk,
                });
            });
        out
    }

    /// Every brick of `query` (in brick coordinates), file by file, chunk by
    /// chunk, in increasing ordinal order
    pub fn traverse_volume(&self, query: &Extent) -> Vec<BrickTraverse> {
        let mut out = Vec::new();
        for file in self.traverse_files(query) {
            for chunk in self.traverse_chunks(&file, query) {
                out.extend(self.traverse_bricks(&chunk, query));
            }
        }
        out
    }
}

/// Bit-plane value marking a chunk of exponent data
pub const EXPONENT_BIT_PLANE: u16 = 0xFFF;

const ITERATION_SHIFT: u32 = 60;
const SUBBAND_SHIFT: u32 = 54;
const BIT_PLANE_SHIFT: u32 = 42;
const INDEX_MASK: u64 = (1 << BIT_PLANE_SHIFT) - 1;

/// Identity of one chunk: `iteration (4) | subband (6) | bit-plane (12) | chunk index (42)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkAddress {
    pub iteration: u8,
    pub subband: u8,
    pub bit_plane: u16,
    pub chunk: u64,
}

impl ChunkAddress {
    pub fn new(iteration: usize, subband: usize, bit_plane: u16, chunk: u64) -> Self {
        Self {
            iteration: iteration as u8,
            subband: subband as u8,
            bit_plane,
            chunk,
        }
    }

    pub fn exponent(iteration: usize, subband: usize, chunk: u64) -> Self {
        Self::new(iteration, subband, EXPONENT_BIT_PLANE, chunk)
    }

    pub fn is_exponent(&self) -> bool {
        self.bit_plane == EXPONENT_BIT_PLANE
    }

    pub fn pack(&self) -> u64 {
        ((self.iteration as u64 & 0xF) << ITERATION_SHIFT)
            | ((self.subband as u64 & 0x3F) << SUBBAND_SHIFT)
            | ((self.bit_plane as u64 & 0xFFF) << BIT_PLANE_SHIFT)
            | (self.chunk & INDEX_MASK)
    }

    pub fn unpack(address: u64) -> Self {
        Self {
            iteration: (address >> ITERATION_SHIFT) as u8 & 0xF,
            subband: (address >> SUBBAND_SHIFT) as u8 & 0x3F,
            bit_plane: (address >> BIT_PLANE_SHIFT) as u16 & 0xFFF,
            chunk: address & INDEX_MASK,
        }
    }
}

/// What a stored file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Bit-plane chunks
    Data,
    /// Compressed exponent chunks
    Exponent,
    /// Truncation tables of one (iteration, spatial file)
    Rdo,
}

impl FileKind {
    pub fn extension(&self) -> &'static str {
        match self {
            FileKind::Data => "bin",
            FileKind::Exponent => "exp",
            FileKind::Rdo => "rdo",
        }
    }
}

/// Bit-plane slots per (iteration, subband) in the dense file key: one per
/// coefficient plane plus the exponent and RDO files
const PLANE_SLOTS: u64 = 66;
const EXPONENT_SLOT: u64 = 64;
const RDO_SLOT: u64 = 65;

impl VolumeFormat {
    /// Dense key of the file holding `address`; grouped fields are folded out
    pub fn file_key(&self, address: ChunkAddress, kind: FileKind) -> u64 {
        let iteration = address.iteration as usize;
        let layout = self.iteration(iteration);
        let file = address.chunk >> layout.chunk_bits;
        let (iteration, subband, slot) = match kind {
            FileKind::Rdo => (iteration as u64, 0, RDO_SLOT),
            FileKind::Exponent => (
                if self.group_iterations() { 0 } else { iteration as u64 },
                if self.group_levels() { 0 } else { address.subband as u64 },
                EXPONENT_SLOT,
            ),
            FileKind::Data => (
                if self.group_iterations() { 0 } else { iteration as u64 },
                if self.group_levels() { 0 } else { address.subband as u64 },
                if self.group_bit_planes() { 0 } else { address.bit_plane as u64 },
            ),
        };
        let n_subbands = self.subbands().len() as u64;
        let max_files = self.iteration(0).files_per_volume();
        ((iteration * n_subbands + subband) * PLANE_SLOTS + slot) * max_files + file
    }

    /// Directory depth needed so that no directory exceeds `files_per_dir`
    fn file_dir_depth(&self) -> u32 {
        let n_keys = self.n_iterations() as u64
            * self.subbands().len() as u64
            * PLANE_SLOTS
            * self.iteration(0).files_per_volume();
        let digit_bits = log2_exact(self.files_per_dir() as u64);
        bit_width(n_keys - 1).div_ceil(digit_bits).max(1)
    }

    /// Storage path of the file with the given key
    pub fn file_path(&self, key: u64, kind: FileKind) -> String {
        let digit_bits = log2_exact(self.files_per_dir() as u64);
        let mask = (1u64 << digit_bits) - 1;
        let mut path = format!("{}/", self.name());
        for level in (1..self.file_dir_depth()).rev() {
            let shift = level * digit_bits;
            let digit = if shift >= 64 { 0 } else { (key >> shift) & mask };
            path.push_str(&format!("{:x}/", digit));
        }
        path.push_str(&format!("{:012x}.{}", key, kind.extension()));
        path
    }

    /// Path of the file holding `address`
    pub fn chunk_file_path(&self, address: ChunkAddress, kind: FileKind) -> String {
        self.file_path(self.file_key(address, kind), kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FormatBuilder;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_order_code_shapes() {
        let morton = OrderCode::build(IVec3::new(4, 2, 1), OrderScheme::Morton);
        assert_eq!(morton.len(), 3);
        assert_eq!(
            (0..3).map(|d| morton.axis(d)).collect::<Vec<_>>(),
            vec![0, 1, 0]
        );
        let row = OrderCode::build(IVec3::new(4, 2, 1), OrderScheme::RowMajor);
        assert_eq!(
            (0..3).map(|d| row.axis(d)).collect::<Vec<_>>(),
            vec![0, 0, 1]
        );
        // row-major ordinal is x + y * nx
        assert_eq!(row.encode(IVec3::new(3, 1, 0)), 7);
        assert_eq!(morton.encode(IVec3::new(1, 1, 0)), 3);
        assert_eq!(morton.extent3(), IVec3::new(4, 2, 1));
    }

    #[test]
    fn test_coarsen_drops_first_grouped_digits() {
        let code = OrderCode::build(IVec3::new(4, 4, 4), OrderScheme::Morton);
        let parent = code.coarsen([true, true, false]);
        assert_eq!(
            (0..parent.len()).map(|d| parent.axis(d)).collect::<Vec<_>>(),
            vec![2, 0, 1, 2]
        );
        assert_eq!(parent.extent3(), IVec3::new(2, 2, 4));
        // an axis already down to one brick has nothing to drop
        let flat = OrderCode::build(IVec3::new(2, 1, 1), OrderScheme::Morton);
        assert!(flat.coarsen([true, true, true]).is_empty());
    }

    #[test]
    fn test_parents_complete_in_ordinal_order() {
        let cases = [
            (IVec3::new(32, 32, 4), IVec3::new(8, 8, 1), 2),
            (IVec3::new(40, 24, 6), IVec3::new(8, 8, 1), 3),
            (IVec3::new(70, 3, 5), IVec3::new(16, 1, 1), 3),
            (IVec3::new(50, 36, 12), IVec3::new(8, 8, 4), 3),
        ];
        for scheme in [OrderScheme::Morton, OrderScheme::RowMajor] {
            for (dims, brick, iterations) in cases {
                let format = FormatBuilder::new()
                    .with_dimensions(dims)
                    .with_brick_size(brick)
                    .with_num_iterations(iterations)
                    .with_bricks_per_chunk(4)
                    .with_chunks_per_file(2)
                    .with_order_scheme(scheme)
                    .finalize()
                    .unwrap();
                let group = format.group_brick3();
                for it in 1..format.n_iterations() {
                    let fine = format.iteration(it - 1);
                    let coarse = format.iteration(it);
                    let mut waiting: HashMap<u64, i64> = HashMap::new();
                    let mut completed = Vec::new();
                    for child in fine.traverse_volume(&fine.brick_grid()) {
                        let parent3 = child.brick3 / group;
                        let present = (fine.n_bricks3 - parent3 * group).min(group);
                        let ordinal = coarse.locate_brick(parent3).ordinal;
                        let seen = waiting.entry(ordinal).or_insert(0);
                        *seen += 1;
                        if *seen == crate::types::prod(present) {
                            completed.push(ordinal);
                        }
                    }
                    assert_eq!(completed.len() as i64, coarse.total_bricks());
                    assert!(
                        completed.windows(2).all(|w| w[0] < w[1]),
                        "{:?} {:?} iteration {}: {:?}",
                        scheme,
                        dims,
                        it,
                        completed
                    );
                }
            }
        }
    }

    #[test]
    fn test_split_concatenates() {
        let code = OrderCode::build(IVec3::new(8, 8, 4), OrderScheme::Morton);
        let (low, high) = code.split(4);
        assert_eq!(low.len() + high.len(), code.len());
        for ordinal in [0u64, 5, 77, 255] {
            let coord = code.decode(ordinal);
            let inner = low.decode(ordinal & 0xF);
            let outer = high.decode(ordinal >> 4);
            assert_eq!(coord, outer * low.extent3() + inner);
        }
        let (all, none) = code.split(100);
        assert_eq!(all, code);
        assert!(none.is_empty());
    }

    #[test]
    fn test_traverse_is_ordered_and_clipped() {
        let code = OrderCode::build(IVec3::new(8, 4, 2), OrderScheme::Morton);
        let bounds = Extent::new(IVec3::new(1, 1, 0), IVec3::new(5, 2, 1));
        let mut seen = Vec::new();
        code.traverse(IVec3::ZERO, &bounds, |coord, ordinal| {
            assert_eq!(code.encode(coord), ordinal);
            assert!(bounds.contains(coord));
            seen.push(ordinal);
        });
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_locate_matches_traverse() {
        let format = FormatBuilder::new()
            .with_dimensions(IVec3::new(200, 90, 40))
            .with_brick_size(IVec3::splat(16))
            .with_bricks_per_chunk(8)
            .with_chunks_per_file(4)
            .finalize()
            .unwrap();
        let layout = format.iteration(0);
        let bricks = layout.traverse_volume(&layout.brick_grid());
        assert_eq!(bricks.len() as i64, layout.total_bricks());
        assert!(bricks.windows(2).all(|w| w[0].address < w[1].address));
        for b in &bricks {
            let loc = layout.locate_brick(b.brick3);
            assert_eq!(loc.ordinal, b.address);
            assert_eq!(loc.brick_in_chunk, b.brick_in_chunk);
            assert_eq!(layout.brick_coord(loc.ordinal), b.brick3);
            let chunk_bricks = layout.chunk_bricks(loc.chunk).unwrap();
            assert!(chunk_bricks.contains(b.brick3));
        }
    }

    #[test]
    fn test_traverse_records_link_prior_steps() {
        let format = FormatBuilder::new()
            .with_dimensions(IVec3::new(128, 128, 16))
            .with_brick_size(IVec3::new(16, 16, 16))
            .with_bricks_per_chunk(4)
            .with_chunks_per_file(4)
            .finalize()
            .unwrap();
        let layout = format.iteration(0);
        let files = layout.traverse_files(&layout.brick_grid());
        assert_eq!(files.len() as u64, layout.files_per_volume());
        assert_eq!(files[0].prev_file_order, None);
        for (i, f) in files.iter().enumerate().skip(1) {
            assert_eq!(f.prev_file_order, Some(files[i - 1].file_order));
            assert_eq!(f.n_prior, i as u64);
        }
        let chunks = layout.traverse_chunks(&files[1], &layout.brick_grid());
        assert_eq!(chunks.len(), 4);
        for c in &chunks {
            assert_eq!(c.address >> layout.chunk_bits, files[1].file_order);
        }
    }

    #[test]
    fn test_chunk_address_packing() {
        let addr = ChunkAddress::new(3, 7, 41, 123456);
        let packed = addr.pack();
        assert_eq!(ChunkAddress::unpack(packed), addr);
        assert_eq!(packed >> 60, 3);
        let exp = ChunkAddress::exponent(0, 1, 9);
        assert!(exp.is_exponent());
        assert_eq!(ChunkAddress::unpack(exp.pack()), exp);
    }

    #[test]
    fn test_file_grouping() {
        let format = FormatBuilder::new()
            .with_dimensions(IVec3::splat(128))
            .with_brick_size(IVec3::splat(16))
            .with_bricks_per_chunk(8)
            .with_chunks_per_file(2)
            .with_group_levels(true)
            .finalize()
            .unwrap();
        let a = ChunkAddress::new(0, 1, 5, 3);
        let b = ChunkAddress::new(0, 6, 5, 2);
        assert_eq!(
            format.file_key(a, FileKind::Data),
            format.file_key(b, FileKind::Data)
        );
        let c = ChunkAddress::new(0, 1, 4, 3);
        assert_ne!(
            format.file_key(a, FileKind::Data),
            format.file_key(c, FileKind::Data)
        );
        assert_ne!(
            format.file_key(a, FileKind::Data),
            format.file_key(a, FileKind::Exponent)
        );
    }

    #[test]
    fn test_files_per_dir_fan_out() {
        let format = FormatBuilder::new()
            .with_name("fan")
            .with_dimensions(IVec3::splat(64))
            .with_brick_size(IVec3::splat(8))
            .with_bricks_per_chunk(1)
            .with_chunks_per_file(1)
            .with_files_per_directory(16)
            .with_group_levels(false)
            .finalize()
            .unwrap();
        let layout = format.iteration(0);
        let mut dirs: HashMap<String, HashSet<String>> = HashMap::new();
        for chunk in 0..layout.chunks_per_volume() {
            for sb in 0..format.subbands().len() {
                for bp in [0u16, 3, 17] {
                    let path = format.chunk_file_path(ChunkAddress::new(0, sb, bp, chunk), FileKind::Data);
                    assert!(path.starts_with("fan/"));
                    let mut parts: Vec<&str> = path.split('/').collect();
                    while parts.len() > 1 {
                        let leaf = parts.pop().unwrap().to_string();
                        dirs.entry(parts.join("/")).or_default().insert(leaf);
                    }
                }
            }
        }
        assert!(dirs.values().all(|entries| entries.len() <= 16));
    }
}

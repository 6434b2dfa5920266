//! Bit-plane channels and the on-disk chunk/file formats
//!
//! Each subband of a brick is cut into blocks of at most 4x4x4 coefficients.
//! A block is coded in sign-magnitude form one bit-plane at a time, most
//! significant first, with group testing over the not-yet-significant tail.
//! The bits of plane `bp` of every block of one brick go to channel
//! `(iteration, subband, bp)`; consecutive bricks of one chunk accumulate in
//! the channel until a brick of another chunk arrives. A separate sub-channel
//! per `(iteration, subband)` records the block exponents.
//!
//! Chunk layout:
//!
//! ```text
//! [varint n][n varint brick-in-chunk deltas][n varint byte sizes][payload]
//! ```
//!
//! Data file layout: chunk payloads back to back, then
//!
//! ```text
//! [varint n][n zigzag varint address deltas][n varint sizes][u32 LE table length][u32 LE magic]
//! ```

use crate::bitstream::{read_varint, unzigzag, write_varint, zigzag, BitReader, BitWriter};
use crate::error::{Result, WzError};
use crate::types::Grid;
use crate::utils::bit_width;
use bytes::Bytes;
use glam::IVec3;
use ndarray::Array3;

/// Largest number of coefficients in a block
pub const MAX_BLOCK_SIZE: usize = 64;
/// Bits used to store the largest block exponent of a brick
pub const BRICK_EXPONENT_BITS: u32 = 6;
/// Trailer tag of every data and exponent file
pub const FILE_MAGIC: u32 = u32::from_le_bytes(*b"WZF1");
/// Table length plus magic
pub const FILE_TRAILER_SIZE: u64 = 8;

/// Coefficients of one block in sign-magnitude form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoeffBlock {
    pub mags: [u64; MAX_BLOCK_SIZE],
    /// Bit `i` set when coefficient `i` is negative
    pub negative: u64,
    pub len: u8,
}

impl CoeffBlock {
    pub fn empty(len: usize) -> Self {
        debug_assert!(len <= MAX_BLOCK_SIZE);
        Self {
            mags: [0; MAX_BLOCK_SIZE],
            negative: 0,
            len: len as u8,
        }
    }

    /// Number of bit-planes holding data; 0 for an all-zero block
    pub fn emax(&self) -> u8 {
        let max = self.mags[..self.len as usize].iter().copied().max().unwrap_or(0);
        bit_width(max) as u8
    }

    pub fn value(&self, i: usize) -> i64 {
        let mag = self.mags[i] as i64;
        if self.negative & (1 << i) != 0 {
            -mag
        } else {
            mag
        }
    }
}

/// Progress of one block through its bit-planes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockState {
    /// Length of the coded prefix
    n: u8,
    /// Coefficients whose sign has been sent
    significant: u64,
}

/// Code plane `bp` of `block`; returns how many one bits the plane holds
pub fn encode_block_plane(
    w: &mut BitWriter,
    block: &CoeffBlock,
    bp: u32,
    state: &mut BlockState,
) -> u32 {
    let size = block.len as usize;
    let bit_of = |i: usize| (block.mags[i] >> bp) & 1 == 1;
    let mut ones = 0;
    let mut n = state.n as usize;
    for i in 0..n {
        if w.write_bit(bit_of(i)) {
            ones += 1;
            if state.significant & (1 << i) == 0 {
                w.write_bit(block.negative & (1 << i) != 0);
                state.significant |= 1 << i;
            }
        }
    }
    while n < size {
        if !w.write_bit((n..size).any(bit_of)) {
            break;
        }
        loop {
            let k = n;
            n += 1;
            // the last candidate is known to be set
            let bit = if k == size - 1 { true } else { w.write_bit(bit_of(k)) };
            if bit {
                ones += 1;
                w.write_bit(block.negative & (1 << k) != 0);
                state.significant |= 1 << k;
                break;
            }
        }
    }
    state.n = n as u8;
    ones
}

/// Inverse of [`encode_block_plane`]; sets bit `bp` of the decoded magnitudes
pub fn decode_block_plane(
    r: &mut BitReader<'_>,
    block: &mut CoeffBlock,
    bp: u32,
    state: &mut BlockState,
) {
    let size = block.len as usize;
    let mut n = state.n as usize;
    for i in 0..n {
        if r.read_bit() {
            block.mags[i] |= 1 << bp;
            if state.significant & (1 << i) == 0 {
                if r.read_bit() {
                    block.negative |= 1 << i;
                }
                state.significant |= 1 << i;
            }
        }
    }
    while n < size {
        if !r.read_bit() {
            break;
        }
        loop {
            let k = n;
            n += 1;
            let bit = if k == size - 1 { true } else { r.read_bit() };
            if bit {
                block.mags[k] |= 1 << bp;
                if r.read_bit() {
                    block.negative |= 1 << k;
                }
                state.significant |= 1 << k;
                break;
            }
        }
    }
    state.n = n as u8;
}

/// How a subband grid is tiled into blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub grid: Grid,
    pub block_dims: IVec3,
    pub n_blocks3: IVec3,
}

impl BlockLayout {
    pub fn new(grid: Grid, block_dims: IVec3) -> Self {
        Self {
            grid,
            block_dims,
            n_blocks3: crate::types::ceil_div3(grid.dims, block_dims),
        }
    }

    pub fn n_blocks(&self) -> usize {
        crate::types::prod(self.n_blocks3) as usize
    }

    /// Block-local extent of block `b`, clipped to the subband
    fn block_dims_of(&self, block3: IVec3) -> IVec3 {
        (self.grid.dims - block3 * self.block_dims).min(self.block_dims)
    }

    /// Call `f(block index, element index, brick position)` for every coefficient
    fn for_each(&self, mut f: impl FnMut(usize, usize, [usize; 3])) {
        let mut b = 0;
        for bz in 0..self.n_blocks3.z {
            for by in 0..self.n_blocks3.y {
                for bx in 0..self.n_blocks3.x {
                    let block3 = IVec3::new(bx, by, bz);
                    let dims = self.block_dims_of(block3);
                    let mut e = 0;
                    for z in 0..dims.z {
                        for y in 0..dims.y {
                            for x in 0..dims.x {
                                let local = block3 * self.block_dims + IVec3::new(x, y, z);
                                let p = self.grid.position(local);
                                f(b, e, [p.x as usize, p.y as usize, p.z as usize]);
                                e += 1;
                            }
                        }
                    }
                    b += 1;
                }
            }
        }
    }

    /// Zeroed blocks of the right sizes
    pub fn empty_blocks(&self) -> Vec<CoeffBlock> {
        let mut blocks = Vec::with_capacity(self.n_blocks());
        for bz in 0..self.n_blocks3.z {
            for by in 0..self.n_blocks3.y {
                for bx in 0..self.n_blocks3.x {
                    let dims = self.block_dims_of(IVec3::new(bx, by, bz));
                    blocks.push(CoeffBlock::empty(crate::types::prod(dims) as usize));
                }
            }
        }
        blocks
    }

    /// Read the subband's coefficients out of a brick buffer
    pub fn gather(&self, brick: &Array3<i64>) -> Vec<CoeffBlock> {
        let mut blocks = self.empty_blocks();
        self.for_each(|b, e, p| {
            let v = brick[p];
            blocks[b].mags[e] = v.unsigned_abs();
            if v < 0 {
                blocks[b].negative |= 1 << e;
            }
        });
        blocks
    }

    /// Write decoded coefficients back into a brick buffer.
    ///
    /// `lowest_plane` is the last plane decoded; nonzero magnitudes are moved
    /// to the middle of their uncertainty interval.
    pub fn scatter(&self, blocks: &[CoeffBlock], brick: &mut Array3<i64>, lowest_plane: u32) {
        let bias = if lowest_plane > 0 { 1u64 << (lowest_plane - 1) } else { 0 };
        self.for_each(|b, e, p| {
            let block = &blocks[b];
            let mag = block.mags[e];
            let mag = (if mag != 0 { mag + bias } else { 0 }) as i64;
            brick[p] = if block.negative & (1 << e) != 0 { -mag } else { mag };
        });
    }
}

/// Exponent stream of one brick-subband: the brick maximum in
/// [`BRICK_EXPONENT_BITS`] bits, then each block's distance below it in
/// truncated unary
pub fn write_exponents(w: &mut BitWriter, brick_emax: u8, block_emaxes: &[u8]) {
    w.write_bits(brick_emax as u64, BRICK_EXPONENT_BITS);
    for &e in block_emaxes {
        let diff = brick_emax - e;
        for _ in 0..diff {
            w.write_bit(true);
        }
        if diff < brick_emax {
            w.write_bit(false);
        }
    }
}

pub fn read_exponents(data: &[u8], n_blocks: usize) -> (u8, Vec<u8>) {
    let mut r = BitReader::new(data);
    let brick_emax = r.read_bits(BRICK_EXPONENT_BITS) as u8;
    let mut emaxes = Vec::with_capacity(n_blocks);
    for _ in 0..n_blocks {
        let mut diff = 0u8;
        while diff < brick_emax && r.read_bit() {
            diff += 1;
        }
        emaxes.push(brick_emax - diff);
    }
    (brick_emax, emaxes)
}

/// Bricks of one chunk being accumulated
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    brick_deltas: Vec<u8>,
    brick_sizes: Vec<u8>,
    payload: Vec<u8>,
    n_bricks: u64,
    last_brick: Option<u64>,
}

impl ChunkBuilder {
    pub fn push_brick(&mut self, brick_in_chunk: u64, bytes: &[u8]) {
        let delta = match self.last_brick {
            Some(last) => {
                debug_assert!(brick_in_chunk > last);
                brick_in_chunk - last - 1
            }
            None => brick_in_chunk,
        };
        write_varint(&mut self.brick_deltas, delta);
        write_varint(&mut self.brick_sizes, bytes.len() as u64);
        self.payload.extend_from_slice(bytes);
        self.n_bricks += 1;
        self.last_brick = Some(brick_in_chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.n_bricks == 0
    }

    /// Serialize and reset
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            10 + self.brick_deltas.len() + self.brick_sizes.len() + self.payload.len(),
        );
        write_varint(&mut out, self.n_bricks);
        out.extend_from_slice(&self.brick_deltas);
        out.extend_from_slice(&self.brick_sizes);
        out.extend_from_slice(&self.payload);
        *self = Self::default();
        out
    }
}

/// A chunk that has been completed and must be written out
#[derive(Debug)]
pub struct FinishedChunk {
    pub chunk: u64,
    pub bytes: Vec<u8>,
    /// One bits coded into the chunk (data channels only)
    pub ones: u64,
}

/// Chunk-switching bookkeeping shared by channels and sub-channels
#[derive(Debug, Default)]
struct ChunkCursor {
    last_chunk: Option<u64>,
    last_brick: Option<u64>,
    builder: ChunkBuilder,
    ones: u64,
}

impl ChunkCursor {
    fn begin_brick(&mut self, chunk: u64, brick_in_chunk: u64) -> Option<FinishedChunk> {
        let finished = match self.last_chunk {
            Some(last) if last != chunk => {
                debug_assert!(chunk > last, "chunks must arrive in increasing order");
                self.flush()
            }
            _ => None,
        };
        self.last_chunk = Some(chunk);
        self.last_brick = Some(brick_in_chunk);
        finished
    }

    fn flush(&mut self) -> Option<FinishedChunk> {
        let chunk = self.last_chunk?;
        if self.builder.is_empty() {
            return None;
        }
        let ones = std::mem::take(&mut self.ones);
        Some(FinishedChunk {
            chunk,
            bytes: self.builder.finish(),
            ones,
        })
    }
}

/// Encoder state of one (iteration, subband, bit-plane)
#[derive(Debug, Default)]
pub struct Channel {
    cursor: ChunkCursor,
    /// Bits of the brick currently being coded
    pub block_stream: BitWriter,
}

impl Channel {
    pub fn last_chunk(&self) -> Option<u64> {
        self.cursor.last_chunk
    }

    pub fn last_brick(&self) -> Option<u64> {
        self.cursor.last_brick
    }

    /// Start a brick; hands back the previous chunk when this brick opens a new one
    pub fn begin_brick(&mut self, chunk: u64, brick_in_chunk: u64) -> Option<FinishedChunk> {
        self.cursor.begin_brick(chunk, brick_in_chunk)
    }

    /// Move the block stream into the current chunk
    pub fn end_brick(&mut self, ones: u32) {
        let bytes = self.block_stream.take_bytes();
        if let Some(brick) = self.cursor.last_brick {
            self.cursor.builder.push_brick(brick, &bytes);
            self.cursor.ones += ones as u64;
        }
    }

    pub fn flush(&mut self) -> Option<FinishedChunk> {
        self.cursor.flush()
    }
}

/// Exponent state of one (iteration, subband)
#[derive(Debug, Default)]
pub struct SubChannel {
    cursor: ChunkCursor,
    exponents: BitWriter,
}

impl SubChannel {
    pub fn begin_brick(&mut self, chunk: u64, brick_in_chunk: u64) -> Option<FinishedChunk> {
        self.cursor.begin_brick(chunk, brick_in_chunk)
    }

    pub fn write_brick(&mut self, brick_emax: u8, block_emaxes: &[u8]) {
        write_exponents(&mut self.exponents, brick_emax, block_emaxes);
        let bytes = self.exponents.take_bytes();
        if let Some(brick) = self.cursor.last_brick {
            self.cursor.builder.push_brick(brick, &bytes);
        }
    }

    pub fn flush(&mut self) -> Option<FinishedChunk> {
        self.cursor.flush()
    }
}

/// A chunk read back from storage
#[derive(Debug, Clone)]
pub struct ParsedChunk {
    bricks: Vec<u64>,
    offsets: Vec<usize>,
    payload: Bytes,
}

impl ParsedChunk {
    pub fn parse(data: Bytes) -> Result<Self> {
        let mut pos = 0;
        let n = read_varint(&data, &mut pos)? as usize;
        let mut bricks = Vec::with_capacity(n);
        let mut next = 0u64;
        for _ in 0..n {
            let brick = next + read_varint(&data, &mut pos)?;
            bricks.push(brick);
            next = brick + 1;
        }
        let mut offsets = Vec::with_capacity(n + 1);
        offsets.push(0usize);
        for _ in 0..n {
            let size = read_varint(&data, &mut pos)? as usize;
            offsets.push(offsets[offsets.len() - 1] + size);
        }
        let payload = data.slice(pos..);
        if offsets[n] != payload.len() {
            return Err(WzError::InvalidFormat(format!(
                "chunk payload is {} bytes, table says {}",
                payload.len(),
                offsets[n]
            )));
        }
        Ok(Self {
            bricks,
            offsets,
            payload,
        })
    }

    /// Bytes of one brick, if the chunk holds it
    pub fn brick(&self, brick_in_chunk: u64) -> Option<&[u8]> {
        let i = self.bricks.binary_search(&brick_in_chunk).ok()?;
        Some(&self.payload[self.offsets[i]..self.offsets[i + 1]])
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    /// Approximate resident size
    pub fn size_bytes(&self) -> usize {
        self.payload.len() + self.bricks.len() * 8 + self.offsets.len() * 8
    }
}

/// Chunk table stored at the end of a data or exponent file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFooter {
    pub addresses: Vec<u64>,
    pub sizes: Vec<u64>,
}

impl FileFooter {
    pub fn push(&mut self, address: u64, size: u64) {
        self.addresses.push(address);
        self.sizes.push(size);
    }

    pub fn payload_bytes(&self) -> u64 {
        self.sizes.iter().sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut table = Vec::new();
        write_varint(&mut table, self.addresses.len() as u64);
        let mut prev = 0i64;
        for &address in &self.addresses {
            write_varint(&mut table, zigzag((address as i64).wrapping_sub(prev)));
            prev = address as i64;
        }
        for &size in &self.sizes {
            write_varint(&mut table, size);
        }
        let table_len = table.len() as u32;
        table.extend_from_slice(&table_len.to_le_bytes());
        table.extend_from_slice(&FILE_MAGIC.to_le_bytes());
        table
    }

    /// Parse the trailer (last [`FILE_TRAILER_SIZE`] bytes); returns the table length
    pub fn table_len(trailer: &[u8]) -> Result<u64> {
        if trailer.len() != FILE_TRAILER_SIZE as usize {
            return Err(WzError::InvalidFormat("short file trailer".to_string()));
        }
        let mut len = [0u8; 4];
        let mut magic = [0u8; 4];
        len.copy_from_slice(&trailer[..4]);
        magic.copy_from_slice(&trailer[4..]);
        if u32::from_le_bytes(magic) != FILE_MAGIC {
            return Err(WzError::InvalidFormat("bad file magic".to_string()));
        }
        Ok(u32::from_le_bytes(len) as u64)
    }

    pub fn decode(table: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let n = read_varint(table, &mut pos)? as usize;
        let mut addresses = Vec::with_capacity(n);
        let mut prev = 0i64;
        for _ in 0..n {
            prev = prev.wrapping_add(unzigzag(read_varint(table, &mut pos)?));
            addresses.push(prev as u64);
        }
        let mut sizes = Vec::with_capacity(n);
        for _ in 0..n {
            sizes.push(read_varint(table, &mut pos)?);
        }
        Ok(Self { addresses, sizes })
    }
}

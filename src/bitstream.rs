//! Bit-level streams and variable-byte integers
//!
//! Bits are packed least-significant first within each byte. Readers return
//! zero bits past the end of their buffer so that a truncated channel stream
//! decodes as "no more refinement" instead of failing.

use crate::error::{Result, WzError};

/// Append-only bit writer
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    n_acc: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one bit and hand it back, so callers can branch on what they wrote
    #[inline]
    pub fn write_bit(&mut self, bit: bool) -> bool {
        self.acc |= (bit as u64) << self.n_acc;
        self.n_acc += 1;
        if self.n_acc == 8 {
            self.bytes.push(self.acc as u8);
            self.acc = 0;
            self.n_acc = 0;
        }
        bit
    }

    /// Write the low `n` bits of `value`
    pub fn write_bits(&mut self, mut value: u64, mut n: u32) {
        debug_assert!(n <= 64);
        while n > 0 {
            let take = n.min(32);
            let chunk = value & ((1u64 << take) - 1);
            self.acc |= chunk << self.n_acc;
            self.n_acc += take;
            while self.n_acc >= 8 {
                self.bytes.push(self.acc as u8);
                self.acc >>= 8;
                self.n_acc -= 8;
            }
            value >>= take;
            n -= take;
        }
    }

    /// Number of bits written so far
    pub fn bit_len(&self) -> u64 {
        self.bytes.len() as u64 * 8 + self.n_acc as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bit_len() == 0
    }

    /// Pad with zero bits up to the next byte boundary
    pub fn byte_align(&mut self) {
        if self.n_acc > 0 {
            self.bytes.push(self.acc as u8);
            self.acc = 0;
            self.n_acc = 0;
        }
    }

    /// Byte-align and move the buffer out, leaving the writer empty
    pub fn take_bytes(&mut self) -> Vec<u8> {
        self.byte_align();
        std::mem::take(&mut self.bytes)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.take_bytes()
    }
}

/// Sequential bit reader with random-access replay
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn read_bit(&mut self) -> bool {
        let byte = (self.pos >> 3) as usize;
        let bit = match self.data.get(byte) {
            Some(b) => (b >> (self.pos & 7)) & 1 == 1,
            None => false,
        };
        self.pos += 1;
        bit
    }

    pub fn read_bits(&mut self, n: u32) -> u64 {
        debug_assert!(n <= 64);
        let mut value = 0u64;
        for i in 0..n {
            value |= (self.read_bit() as u64) << i;
        }
        value
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, bit: u64) {
        self.pos = bit;
    }

    pub fn byte_align(&mut self) {
        self.pos = (self.pos + 7) & !7;
    }

    /// True once every written bit has been consumed
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.data.len() as u64 * 8
    }
}

/// Append `value` as a little-endian base-128 varint
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Read a varint starting at `*pos`, advancing `pos` past it
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| WzError::InvalidFormat("truncated varint".to_string()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(WzError::InvalidFormat("varint overflow".to_string()));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

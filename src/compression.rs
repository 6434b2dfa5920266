//! Byte-level compression for exponent streams
//!
//! Bit-plane payloads are already entropy-dense and are stored raw. The
//! per-chunk exponent streams are highly repetitive, so they go through one of
//! the general purpose compressors below. Packed blocks carry a one-byte
//! method tag so a reader does not depend on the writer's configuration.

use crate::error::{Result, WzError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression methods available for exponent chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// Stored as-is
    None = 0,
    /// Deflate (zlib without header)
    Deflate = 1,
    /// Zstandard
    Zstd = 3,
}

impl CompressionMethod {
    /// Get the method from its tag byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "raw" => Some(CompressionMethod::None),
            "deflate" | "zip" => Some(CompressionMethod::Deflate),
            "zstd" => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Compression level (0-9, where 0 is no compression and 9 is maximum)
#[derive(Debug, Clone, Copy)]
struct CompressionLevel(u8);

impl CompressionLevel {
    fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for compression/decompression operations
trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

#[derive(Debug, Default)]
struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Default)]
struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| WzError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| WzError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

#[derive(Debug, Default)]
struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| WzError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| WzError::Decompression(e.to_string()))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get a compressor for a given method
fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

/// Compress `data` and prefix the method tag
pub fn pack(method: CompressionMethod, data: &[u8]) -> Result<Vec<u8>> {
    let compressor = get_compressor(method);
    let body = compressor.compress(data, CompressionLevel::default())?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(compressor.method() as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`pack`]
pub fn unpack(data: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = data
        .split_first()
        .ok_or_else(|| WzError::Decompression("empty compressed block".to_string()))?;
    let method = CompressionMethod::from_u8(tag).ok_or_else(|| {
        WzError::Decompression(format!("unknown compression method tag {}", tag))
    })?;
    get_compressor(method).decompress(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_compression() {
        let compressor = NoneCompressor;
        let data = b"exponents";
        let compressed = compressor
            .compress(data, CompressionLevel::default())
            .unwrap();
        assert_eq!(compressed, data);
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_deflate() {
        let compressor = DeflateCompressor;
        let data = [0u8, 1, 1, 0, 2].repeat(200);
        let compressed = compressor
            .compress(&data, CompressionLevel::default())
            .unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_zstd() {
        let compressor = ZstdCompressor;
        let data = [7u8, 7, 7, 3].repeat(200);
        let compressed = compressor
            .compress(&data, CompressionLevel::default())
            .unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_pack_is_self_describing() {
        let data = b"0000111100001111".repeat(16);
        for method in [
            CompressionMethod::None,
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
        ] {
            let packed = pack(method, &data).unwrap();
            assert_eq!(packed[0], method as u8);
            assert_eq!(unpack(&packed).unwrap(), data);
        }
        assert!(unpack(&[]).is_err());
        assert!(unpack(&[9, 1, 2]).is_err());
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(CompressionMethod::parse("ZSTD"), Some(CompressionMethod::Zstd));
        assert_eq!(CompressionMethod::parse("zip"), Some(CompressionMethod::Deflate));
        assert_eq!(CompressionMethod::parse("lz4"), None);
    }
}

//! Session-scoped decode caches
//!
//! A [`FileCacheTable`] keeps, per file key, the parsed chunk table of data
//! and exponent files, the chunks already read from them, and the RDO
//! truncation tables. Nothing is evicted: the table lives as long as the
//! decode session that owns it.

use crate::address::{ChunkAddress, FileKind};
use crate::channel::{FileFooter, ParsedChunk, FILE_TRAILER_SIZE};
use crate::compression;
use crate::error::{Result, WzError};
use crate::io::Storage;
use crate::layout::VolumeFormat;
use crate::rdo::RdoFile;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Parsed chunk table of one file plus the chunks read so far
#[derive(Debug, Default)]
pub struct FileCache {
    path: String,
    /// Packed chunk address -> (byte offset, byte size)
    chunk_table: HashMap<u64, (u64, u64)>,
    chunk_caches: HashMap<u64, Arc<ParsedChunk>>,
}

impl FileCache {
    /// Read and index the footer of `path`
    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let file_size = storage.size(path)?;
        if file_size < FILE_TRAILER_SIZE {
            return Err(WzError::InvalidFormat(format!("{}: file too short", path)));
        }
        let trailer = storage.read_range(path, file_size - FILE_TRAILER_SIZE, FILE_TRAILER_SIZE)?;
        let table_len = FileFooter::table_len(&trailer)?;
        let payload_end = file_size
            .checked_sub(FILE_TRAILER_SIZE + table_len)
            .ok_or_else(|| WzError::InvalidFormat(format!("{}: bad table length", path)))?;
        let table = storage.read_range(path, payload_end, table_len)?;
        let footer = FileFooter::decode(&table)?;
        if footer.payload_bytes() != payload_end {
            return Err(WzError::InvalidFormat(format!(
                "{}: chunk sizes add up to {}, payload is {}",
                path,
                footer.payload_bytes(),
                payload_end
            )));
        }
        let mut chunk_table = HashMap::with_capacity(footer.addresses.len());
        let mut offset = 0u64;
        for (&address, &size) in footer.addresses.iter().zip(&footer.sizes) {
            chunk_table.insert(address, (offset, size));
            offset += size;
        }
        Ok(Self {
            path: path.to_string(),
            chunk_table,
            chunk_caches: HashMap::new(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn contains(&self, address: u64) -> bool {
        self.chunk_table.contains_key(&address)
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_table.len()
    }

    fn read_chunk(&self, storage: &dyn Storage, address: u64) -> Result<Bytes> {
        let &(offset, size) = self
            .chunk_table
            .get(&address)
            .ok_or(WzError::ChunkNotFound(address))?;
        storage.read_range(&self.path, offset, size)
    }

    fn size_bytes(&self) -> usize {
        self.chunk_table.len() * 24
            + self
                .chunk_caches
                .values()
                .map(|c| c.size_bytes())
                .sum::<usize>()
    }
}

/// Truncation planes of one (iteration, spatial file), keyed by (subband, chunk)
#[derive(Debug, Default)]
pub struct RdoCache {
    planes: HashMap<(u8, u64), Vec<i16>>,
}

impl RdoCache {
    fn from_file(file: RdoFile) -> Self {
        Self {
            planes: file
                .entries
                .into_iter()
                .map(|e| ((e.subband, e.chunk), e.min_bit_plane))
                .collect(),
        }
    }

    /// Lowest retained plane of a chunk chain at a quality level
    pub fn min_bit_plane(&self, subband: u8, chunk: u64, level: usize) -> i16 {
        self.planes
            .get(&(subband, chunk))
            .and_then(|levels| levels.get(level).copied())
            .unwrap_or(i16::MAX)
    }

    fn size_bytes(&self) -> usize {
        self.planes.values().map(|v| 16 + v.len() * 2).sum()
    }
}

/// Counters for cache effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub files_loaded: u64,
    pub bytes_read: u64,
}

/// All caches of one decode session
#[derive(Debug, Default)]
pub struct FileCacheTable {
    file_caches: HashMap<u64, FileCache>,
    file_exp_caches: HashMap<u64, FileCache>,
    file_rdo_caches: HashMap<u64, RdoCache>,
    stats: CacheStats,
}

impl FileCacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn file<'a>(
        caches: &'a mut HashMap<u64, FileCache>,
        stats: &mut CacheStats,
        format: &VolumeFormat,
        storage: &dyn Storage,
        address: ChunkAddress,
        kind: FileKind,
    ) -> Result<&'a mut FileCache> {
        let key = format.file_key(address, kind);
        if !caches.contains_key(&key) {
            let path = format.file_path(key, kind);
            trace!(path = %path, "loading chunk table");
            let cache = FileCache::load(storage, &path)?;
            stats.files_loaded += 1;
            caches.insert(key, cache);
        }
        caches
            .get_mut(&key)
            .ok_or_else(|| WzError::FileNotFound(format.file_path(key, kind)))
    }

    fn chunk(
        &mut self,
        format: &VolumeFormat,
        storage: &dyn Storage,
        address: ChunkAddress,
        kind: FileKind,
    ) -> Result<Arc<ParsedChunk>> {
        let caches = match kind {
            FileKind::Exponent => &mut self.file_exp_caches,
            _ => &mut self.file_caches,
        };
        let file = Self::file(caches, &mut self.stats, format, storage, address, kind)?;
        let packed = address.pack();
        if let Some(chunk) = file.chunk_caches.get(&packed) {
            self.stats.hits += 1;
            return Ok(Arc::clone(chunk));
        }
        self.stats.misses += 1;
        trace!(address = packed, "chunk cache miss");
        let raw = file.read_chunk(storage, packed)?;
        self.stats.bytes_read += raw.len() as u64;
        let bytes = match kind {
            FileKind::Exponent => Bytes::from(compression::unpack(&raw)?),
            _ => raw,
        };
        let chunk = Arc::new(ParsedChunk::parse(bytes)?);
        file.chunk_caches.insert(packed, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// A bit-plane chunk
    pub fn data_chunk(
        &mut self,
        format: &VolumeFormat,
        storage: &dyn Storage,
        address: ChunkAddress,
    ) -> Result<Arc<ParsedChunk>> {
        self.chunk(format, storage, address, FileKind::Data)
    }

    /// An exponent chunk, decompressed
    pub fn exponent_chunk(
        &mut self,
        format: &VolumeFormat,
        storage: &dyn Storage,
        address: ChunkAddress,
    ) -> Result<Arc<ParsedChunk>> {
        self.chunk(format, storage, address, FileKind::Exponent)
    }

    /// Lowest plane retained at `level` for the chunk chain of `address`
    pub fn truncation_plane(
        &mut self,
        format: &VolumeFormat,
        storage: &dyn Storage,
        address: ChunkAddress,
        level: usize,
    ) -> Result<i16> {
        let key = format.file_key(address, FileKind::Rdo);
        if !self.file_rdo_caches.contains_key(&key) {
            let path = format.file_path(key, FileKind::Rdo);
            trace!(path = %path, "loading truncation table");
            let bytes = storage.read(&path)?;
            let file: RdoFile = bincode::deserialize(&bytes)?;
            self.stats.files_loaded += 1;
            self.file_rdo_caches.insert(key, RdoCache::from_file(file));
        }
        Ok(self
            .file_rdo_caches
            .get(&key)
            .map(|c| c.min_bit_plane(address.subband, address.chunk, level))
            .unwrap_or(i16::MAX))
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn num_files(&self) -> usize {
        self.file_caches.len() + self.file_exp_caches.len() + self.file_rdo_caches.len()
    }

    /// Approximate resident size of everything cached
    pub fn size_bytes(&self) -> usize {
        self.file_caches
            .values()
            .chain(self.file_exp_caches.values())
            .map(FileCache::size_bytes)
            .sum::<usize>()
            + self
                .file_rdo_caches
                .values()
                .map(RdoCache::size_bytes)
                .sum::<usize>()
    }

    pub fn clear(&mut self) {
        self.file_caches.clear();
        self.file_exp_caches.clear();
        self.file_rdo_caches.clear();
    }
}

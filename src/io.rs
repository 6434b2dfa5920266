//! Storage backends for data, exponent, RDO and metadata files
//!
//! Encode and decode are synchronous pipelines, so the storage seam is a plain
//! blocking trait. Paths are relative, `/`-separated keys; each backend maps
//! them onto its own namespace.

use crate::error::{Result, WzError};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local in-memory store
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "mem" | "memory" => Ok(StorageBackend::Memory),
                _ => Err(WzError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Blocking storage used by encode and decode runs
pub trait Storage: Send + Sync {
    /// Read a whole file
    fn read(&self, path: &str) -> Result<Bytes>;

    /// Read `len` bytes starting at `offset`
    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Create or truncate a file with `data`
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Append `data`, creating the file if needed
    fn append(&self, path: &str, data: &[u8]) -> Result<()>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn size(&self, path: &str) -> Result<u64>;

    fn delete(&self, path: &str) -> Result<()>;

    /// List the keys directly below `prefix`
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend(&self) -> StorageBackend;
}

fn not_found(path: &str, err: std::io::Error) -> WzError {
    if err.kind() == ErrorKind::NotFound {
        WzError::FileNotFound(path.to_string())
    } else {
        WzError::Io(err)
    }
}

/// Files below a base directory
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    base_path: PathBuf,
}

impl FileSystemStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn ensure_parent(full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                WzError::CannotCreateDirectory(format!("{}: {}", parent.display(), e))
            })?;
        }
        Ok(())
    }
}

impl Storage for FileSystemStorage {
    fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path)).map_err(|e| not_found(path, e))?;
        Ok(Bytes::from(data))
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let mut file = fs::File::open(self.full_path(path)).map_err(|e| not_found(path, e))?;
        let file_len = file.metadata()?.len();
        if offset + len > file_len {
            return Err(WzError::OutOfBounds(format!(
                "{}: range {}+{} past end {}",
                path, offset, len, file_len
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        Self::ensure_parent(&full_path)?;
        fs::write(&full_path, data)?;
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        Self::ensure_parent(&full_path)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)?;
        file.write_all(data)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path).exists())
    }

    fn size(&self, path: &str) -> Result<u64> {
        let metadata = fs::metadata(self.full_path(path)).map_err(|e| not_found(path, e))?;
        Ok(metadata.len())
    }

    fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)).map_err(|e| not_found(path, e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();
        if full_path.is_dir() {
            for entry in fs::read_dir(&full_path)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory storage, mainly for tests and transient round trips
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held
    pub fn total_bytes(&self) -> u64 {
        self.files.read().values().map(|v| v.len() as u64).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &str) -> Result<Bytes> {
        self.files
            .read()
            .get(path)
            .map(|data| Bytes::copy_from_slice(data))
            .ok_or_else(|| WzError::FileNotFound(path.to_string()))
    }

    fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes> {
        let files = self.files.read();
        let data = files
            .get(path)
            .ok_or_else(|| WzError::FileNotFound(path.to_string()))?;
        let end = offset + len;
        if end > data.len() as u64 {
            return Err(WzError::OutOfBounds(format!(
                "{}: range {}+{} past end {}",
                path,
                offset,
                len,
                data.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&data[offset as usize..end as usize]))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.files.write().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        self.files
            .write()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.read().contains_key(path))
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.files
            .read()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| WzError::FileNotFound(path.to_string()))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| WzError::FileNotFound(path.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = prefix.trim_end_matches('/');
        let mut entries: Vec<String> = self
            .files
            .read()
            .keys()
            .filter_map(|key| {
                let rest = if dir.is_empty() {
                    key.as_str()
                } else {
                    key.strip_prefix(dir)?.strip_prefix('/')?
                };
                Some(rest.split('/').next().unwrap_or(rest).to_string())
            })
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse a URL and create the matching storage
pub fn create_storage(url: &str) -> Result<Box<dyn Storage>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemStorage::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryStorage::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(storage: &dyn Storage) {
        storage.write("a/b/data.bin", b"hello").unwrap();
        storage.append("a/b/data.bin", b", world").unwrap();
        assert_eq!(&storage.read("a/b/data.bin").unwrap()[..], b"hello, world");
        assert_eq!(&storage.read_range("a/b/data.bin", 7, 5).unwrap()[..], b"world");
        assert!(storage.read_range("a/b/data.bin", 10, 5).is_err());
        assert_eq!(storage.size("a/b/data.bin").unwrap(), 12);
        assert!(storage.exists("a/b/data.bin").unwrap());
        assert_eq!(storage.list("a").unwrap(), vec!["b".to_string()]);

        // write truncates
        storage.write("a/b/data.bin", b"x").unwrap();
        assert_eq!(storage.size("a/b/data.bin").unwrap(), 1);

        storage.delete("a/b/data.bin").unwrap();
        assert!(!storage.exists("a/b/data.bin").unwrap());
        let err = storage.read("a/b/data.bin").unwrap_err();
        assert!(matches!(err, WzError::FileNotFound(_)));
        assert!(err.is_missing());
    }

    #[test]
    fn test_file_system_storage() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&FileSystemStorage::new(temp_dir.path()));
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        exercise(&storage);
        storage.write("x", b"1234").unwrap();
        assert_eq!(storage.total_bytes(), 4);
        assert_eq!(storage.file_count(), 1);
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("/data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("mem://scratch").unwrap(),
            StorageBackend::Memory
        );
        assert!(StorageBackend::from_url("s3://bucket").is_err());
        assert_eq!(
            create_storage("mem://x").unwrap().backend(),
            StorageBackend::Memory
        );
    }
}

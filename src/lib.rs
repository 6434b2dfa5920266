//! wavezip - progressive, multiresolution wavelet compression for volumes
//!
//! A pure Rust codec for large regular 3D grids of scalar samples. Volumes
//! are cut into bricks, transformed with a lifted CDF 5/3 wavelet, and coded
//! bit plane by bit plane into chunks grouped in files.
//!
//! # Features
//!
//! - Lossless integer coding, error-bounded float coding
//! - Progressive decode by resolution level, bit-plane count or accuracy
//! - Region-of-interest queries that touch only the bricks they need
//! - Rate-distortion optimized quality levels
//! - Filesystem and in-memory storage backends (implement [`Storage`] for others)
//!
//! # Example
//!
//! ```rust,ignore
//! use wavezip::{encode, DecodeQuery, DecodeSession, FormatBuilder, MemoryStorage};
//!
//! let mut format = FormatBuilder::new()
//!     .with_name("ct")
//!     .with_dimensions(volume.dims())
//!     .with_data_type(volume.data_type())
//!     .with_num_iterations(2)
//!     .finalize()?;
//! let storage = MemoryStorage::new();
//! encode(&mut format, &volume, &storage)?;
//!
//! let mut session = DecodeSession::new(&format, &storage)?;
//! let preview = session.decode(&DecodeQuery::new().with_iteration(1))?;
//! ```

pub mod access;
pub mod address;
pub mod bitstream;
pub mod cache;
pub mod channel;
pub mod compression;
pub mod config;
pub mod decode;
pub mod encode;
pub mod error;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod rdo;
pub mod transform;
pub mod types;
pub mod utils;
pub mod volume;

// Re-exports
pub use access::{connect, Dataset, DatasetStats};
pub use address::{ChunkAddress, FileKind, OrderScheme};
pub use compression::CompressionMethod;
pub use config::EncodeParams;
pub use decode::{DecodeQuery, DecodeSession};
pub use encode::{encode, EncodeSummary};
pub use error::{Result, WzError};
pub use io::{create_storage, FileSystemStorage, MemoryStorage, Storage, StorageBackend};
pub use layout::{FormatBuilder, VolumeFormat};
pub use metadata::{read_meta_file, write_meta_file};
pub use types::{DataType, Extent, ValueRange};
pub use volume::Volume;

/// Version of the wavezip crate
pub const WAVEZIP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!WAVEZIP_VERSION.is_empty());
    }
}

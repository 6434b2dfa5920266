//! Metadata file - the serialized format descriptor
//!
//! The metadata file stores the builder parameters together with the
//! statistics recorded by the encoder. Derived tables (ordering codes and
//! subband grids) are stored as well and checked against a fresh
//! [`FormatBuilder::finalize`] when the file is read back.

use crate::error::{Result, WzError};
use crate::io::Storage;
use crate::layout::{EncodeStats, FormatBuilder, VolumeFormat};
use crate::types::Grid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tag identifying a wavezip metadata file
pub const META_MAGIC: &str = "wavezip";

/// Extension of the metadata file
pub const META_EXTENSION: &str = "wzmeta";

/// Format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// On-disk form of a [`VolumeFormat`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFile {
    pub magic: String,
    pub version: Version,
    pub params: FormatBuilder,
    pub stats: EncodeStats,
    /// Packed brick ordering code of each iteration, in hex
    pub order_codes: Vec<String>,
    /// Subband grids over the padded brick
    pub subbands: Vec<Grid>,
    pub created_at: DateTime<Utc>,
}

impl MetaFile {
    pub fn from_format(format: &VolumeFormat) -> Self {
        Self {
            magic: META_MAGIC.to_string(),
            version: format.version(),
            params: format.params().clone(),
            stats: format.encode_stats().clone(),
            order_codes: order_codes(format),
            subbands: format.subbands().iter().map(|s| s.grid).collect(),
            created_at: Utc::now(),
        }
    }

    /// Rebuild the format and check the stored tables against it
    pub fn into_format(self) -> Result<VolumeFormat> {
        if self.magic != META_MAGIC {
            return Err(WzError::InvalidFormat(format!(
                "unexpected metadata tag {:?}",
                self.magic
            )));
        }
        if !self.version.is_compatible(&Version::CURRENT) {
            return Err(WzError::NotSupportedInVersion(format!(
                "metadata version {}.{}",
                self.version.major, self.version.minor
            )));
        }
        let mut format = self.params.finalize()?;
        if order_codes(&format) != self.order_codes {
            return Err(WzError::InvalidFormat(
                "stored ordering codes do not match the parameters".to_string(),
            ));
        }
        let grids: Vec<Grid> = format.subbands().iter().map(|s| s.grid).collect();
        if grids != self.subbands {
            return Err(WzError::InvalidFormat(
                "stored subband grids do not match the parameters".to_string(),
            ));
        }
        format.set_encode_stats(self.stats);
        Ok(format)
    }
}

fn order_codes(format: &VolumeFormat) -> Vec<String> {
    format
        .iterations()
        .iter()
        .map(|it| format!("{:x}", it.brick_order.packed()))
        .collect()
}

/// Storage key of the metadata file of dataset `name`
pub fn meta_path(name: &str) -> String {
    format!("{}.{}", name, META_EXTENSION)
}

pub fn write_meta_file(format: &VolumeFormat, storage: &dyn Storage) -> Result<()> {
    let meta = MetaFile::from_format(format);
    let json = serde_json::to_vec_pretty(&meta)?;
    let path = meta_path(format.name());
    storage.write(&path, &json)?;
    debug!(path = %path, bytes = json.len(), "metadata written");
    Ok(())
}

pub fn read_meta_file(storage: &dyn Storage, name: &str) -> Result<VolumeFormat> {
    let path = meta_path(name);
    let bytes = storage.read(&path)?;
    let meta: MetaFile = serde_json::from_slice(&bytes)
        .map_err(|e| WzError::SyntaxError(format!("{}: {}", path, e)))?;
    let format = meta.into_format()?;
    debug!(path = %path, summary = %format.summary(), "metadata read");
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::OrderScheme;
    use crate::io::MemoryStorage;
    use crate::types::{BitPlaneRange, DataType, ValueRange};
    use glam::IVec3;

    fn format() -> VolumeFormat {
        FormatBuilder::new()
            .with_name("meta")
            .with_field("density")
            .with_dimensions(IVec3::new(100, 60, 20))
            .with_data_type(DataType::U16)
            .with_brick_size(IVec3::new(16, 16, 4))
            .with_num_iterations(2)
            .with_order_scheme(OrderScheme::RowMajor)
            .with_quality_levels(&[8, 2])
            .finalize()
            .unwrap()
    }

    #[test]
    fn test_version_compatibility() {
        assert!(Version::new(1, 0).is_compatible(&Version::new(1, 3)));
        assert!(!Version::new(1, 0).is_compatible(&Version::new(2, 0)));
        assert_eq!(Version::default(), Version::CURRENT);
    }

    #[test]
    fn test_meta_file_roundtrip() {
        let storage = MemoryStorage::new();
        let mut format = format();
        format.set_encode_stats(EncodeStats {
            value_range: Some(ValueRange::new(0.0, 4000.0)),
            bit_plane_range: Some(BitPlaneRange { min: 0, max: 13 }),
            scale_exponent: Some(0),
            rdo_levels: vec![100, 400],
            total_bytes: 800,
        });
        write_meta_file(&format, &storage).unwrap();
        assert!(storage.exists("meta.wzmeta").unwrap());

        let back = read_meta_file(&storage, "meta").unwrap();
        assert_eq!(back.dims(), format.dims());
        assert_eq!(back.field(), "density");
        assert_eq!(back.data_type(), DataType::U16);
        assert_eq!(back.order_scheme(), OrderScheme::RowMajor);
        assert_eq!(back.quality_levels(), &[8, 2]);
        assert_eq!(back.encode_stats(), format.encode_stats());
        assert_eq!(back.iterations(), format.iterations());
    }

    #[test]
    fn test_malformed_metadata_is_syntax_error() {
        let storage = MemoryStorage::new();
        storage.write("broken.wzmeta", b"{ \"magic\": ").unwrap();
        assert!(matches!(
            read_meta_file(&storage, "broken"),
            Err(WzError::SyntaxError(_))
        ));
    }

    #[test]
    fn test_missing_metadata_is_missing() {
        let storage = MemoryStorage::new();
        let err = read_meta_file(&storage, "absent").unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut meta = MetaFile::from_format(&format());
        meta.version = Version::new(2, 0);
        assert!(matches!(
            meta.into_format(),
            Err(WzError::NotSupportedInVersion(_))
        ));
    }

    #[test]
    fn test_tampered_tables_rejected() {
        let mut meta = MetaFile::from_format(&format());
        meta.order_codes[0] = "0".to_string();
        assert!(matches!(meta.into_format(), Err(WzError::InvalidFormat(_))));
    }
}

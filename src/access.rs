//! Dataset access - async entry point for encoding and querying volumes
//!
//! Encode and decode runs are synchronous; a [`Dataset`] moves each run onto
//! tokio's blocking pool. Every decode gets its own session and cache, so
//! concurrent queries share nothing but the read-only format and storage.

use crate::cache::CacheStats;
use crate::decode::{DecodeQuery, DecodeSession};
use crate::encode::{encode, EncodeSummary};
use crate::error::{Result, WzError};
use crate::io::{create_storage, Storage};
use crate::layout::{FormatBuilder, VolumeFormat};
use crate::metadata::read_meta_file;
use crate::types::{prod, DataType};
use crate::utils::format_bytes;
use crate::volume::Volume;
use futures::future::try_join_all;
use glam::IVec3;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WzError::TaskFailed(e.to_string()))?
}

/// Open the storage behind a URL (`file://`, `mem://` or a plain path)
pub fn connect(url: &str) -> Result<Arc<dyn Storage>> {
    Ok(Arc::from(create_storage(url)?))
}

/// An encoded volume ready for queries
pub struct Dataset {
    format: Arc<VolumeFormat>,
    storage: Arc<dyn Storage>,
    totals: Arc<Mutex<CacheStats>>,
    queries: Arc<Mutex<u64>>,
}

impl Dataset {
    /// Encode `volume` with the parameters of `builder`
    pub async fn create(
        storage: Arc<dyn Storage>,
        builder: FormatBuilder,
        volume: Volume,
    ) -> Result<(Self, EncodeSummary)> {
        let store = Arc::clone(&storage);
        let (format, summary) = blocking(move || {
            let mut format = builder.finalize()?;
            let summary = encode(&mut format, &volume, store.as_ref())?;
            Ok((format, summary))
        })
        .await?;
        Ok((Self::from_parts(format, storage), summary))
    }

    /// Open a dataset from its metadata file
    pub async fn open(storage: Arc<dyn Storage>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let store = Arc::clone(&storage);
        let format = blocking(move || read_meta_file(store.as_ref(), &name)).await?;
        Ok(Self::from_parts(format, storage))
    }

    pub fn from_parts(format: VolumeFormat, storage: Arc<dyn Storage>) -> Self {
        Self {
            format: Arc::new(format),
            storage,
            totals: Arc::new(Mutex::new(CacheStats::default())),
            queries: Arc::new(Mutex::new(0)),
        }
    }

    pub fn format(&self) -> &VolumeFormat {
        &self.format
    }

    /// Run one query in a fresh session
    pub async fn decode(&self, query: DecodeQuery) -> Result<Volume> {
        let format = Arc::clone(&self.format);
        let storage = Arc::clone(&self.storage);
        let totals = Arc::clone(&self.totals);
        let queries = Arc::clone(&self.queries);
        blocking(move || {
            let mut session = DecodeSession::new(&format, storage.as_ref())?;
            let volume = session.decode(&query)?;
            let stats = session.cache_stats();
            let mut totals = totals.lock();
            totals.hits += stats.hits;
            totals.misses += stats.misses;
            totals.files_loaded += stats.files_loaded;
            totals.bytes_read += stats.bytes_read;
            *queries.lock() += 1;
            Ok(volume)
        })
        .await
    }

    /// Run independent queries concurrently; results keep the input order
    pub async fn decode_many(&self, queries: Vec<DecodeQuery>) -> Result<Vec<Volume>> {
        debug!(queries = queries.len(), "decoding concurrently");
        try_join_all(queries.into_iter().map(|q| self.decode(q))).await
    }

    pub fn stats(&self) -> DatasetStats {
        let format = &self.format;
        let encoded = format.encode_stats().total_bytes;
        DatasetStats {
            name: format.name().to_string(),
            dims: format.dims(),
            data_type: format.data_type(),
            iterations: format.n_iterations(),
            total_bricks: format.iteration(0).total_bricks(),
            raw_bytes: prod(format.dims()) as u64 * format.data_type().size_in_bytes() as u64,
            encoded_bytes: encoded,
            quality_levels: format.encode_stats().rdo_levels.len(),
            queries: *self.queries.lock(),
            cache: *self.totals.lock(),
        }
    }
}

/// Summary of a dataset and of the queries run against it
#[derive(Debug, Clone)]
pub struct DatasetStats {
    pub name: String,
    pub dims: IVec3,
    pub data_type: DataType,
    pub iterations: usize,
    pub total_bricks: i64,
    pub raw_bytes: u64,
    pub encoded_bytes: u64,
    pub quality_levels: usize,
    pub queries: u64,
    /// Cache counters summed over every finished query
    pub cache: CacheStats,
}

impl DatasetStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.encoded_bytes == 0 {
            0.0
        } else {
            self.raw_bytes as f64 / self.encoded_bytes as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {}x{}x{} {}, {} iteration(s), {} bricks, {} raw, {} encoded ({:.2}x), {} queries",
            self.name,
            self.dims.x,
            self.dims.y,
            self.dims.z,
            self.data_type,
            self.iterations,
            self.total_bricks,
            format_bytes(self.raw_bytes),
            format_bytes(self.encoded_bytes),
            self.compression_ratio(),
            self.queries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Extent;
    use tempfile::TempDir;

    fn gradient(dims: IVec3) -> Volume {
        let mut v = Volume::new(dims, DataType::U8);
        for z in 0..dims.z {
            for y in 0..dims.y {
                for x in 0..dims.x {
                    v.set(IVec3::new(x, y, z), ((x + 2 * y + 3 * z) % 256) as f64);
                }
            }
        }
        v
    }

    fn builder(dims: IVec3) -> FormatBuilder {
        FormatBuilder::new()
            .with_name("grad")
            .with_dimensions(dims)
            .with_data_type(DataType::U8)
            .with_brick_size(IVec3::splat(8))
            .with_num_iterations(2)
    }

    #[tokio::test]
    async fn test_create_and_open_volume() {
        let temp_dir = TempDir::new().unwrap();
        let storage = connect(temp_dir.path().to_str().unwrap()).unwrap();
        let dims = IVec3::new(24, 16, 8);
        let volume = gradient(dims);

        let (created, summary) = Dataset::create(Arc::clone(&storage), builder(dims), volume.clone())
            .await
            .unwrap();
        assert!(summary.total_bytes > 0);
        assert_eq!(created.stats().encoded_bytes, summary.total_bytes);

        let opened = Dataset::open(storage, "grad").await.unwrap();
        let stats = opened.stats();
        assert_eq!(stats.dims, dims);
        assert_eq!(stats.iterations, 2);
        let out = opened.decode(DecodeQuery::new()).await.unwrap();
        assert_eq!(out, volume);
        assert_eq!(opened.stats().queries, 1);
    }

    #[tokio::test]
    async fn test_decode_many_keeps_order() {
        let storage = connect("mem://").unwrap();
        let dims = IVec3::new(32, 32, 8);
        let volume = gradient(dims);
        let (dataset, _) = Dataset::create(storage, builder(dims), volume.clone())
            .await
            .unwrap();
        let regions: Vec<Extent> = (0..4)
            .map(|i| Extent::new(IVec3::new(i * 7, i * 3, 0), IVec3::new(9, 11, 8)))
            .collect();
        let queries = regions
            .iter()
            .map(|r| DecodeQuery::new().with_extent(*r))
            .collect();
        let results = dataset.decode_many(queries).await.unwrap();
        for (region, out) in regions.iter().zip(&results) {
            assert_eq!(out, &volume.crop(region).unwrap());
        }
        let stats = dataset.stats();
        assert_eq!(stats.queries, 4);
        assert!(stats.cache.misses > 0);
    }

    #[tokio::test]
    async fn test_open_missing_dataset() {
        let storage = connect("mem://").unwrap();
        let err = Dataset::open(storage, "nothing").await.err().unwrap();
        assert!(err.is_missing());
    }
}

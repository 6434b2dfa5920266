//! Error types for wavezip operations

use thiserror::Error;

/// Main error type for encode/decode operations
#[derive(Error, Debug)]
pub enum WzError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Brick size is not a power of two: {0}")]
    BrickSizeNotPowerOfTwo(String),

    #[error("Brick size too big: {0}")]
    BrickSizeTooBig(String),

    #[error("Too many iterations: {0}")]
    TooManyIterations(String),

    #[error("Too many transform passes per iteration: {0}")]
    TooManyTransformPassesPerIteration(String),

    #[error("Too many bricks per chunk: {0}")]
    TooManyBricksPerChunk(String),

    #[error("Too many chunks per file: {0}")]
    TooManyChunksPerFile(String),

    #[error("Too many files per directory: {0}")]
    TooManyFilesPerDir(String),

    #[error("Bricks per chunk is not a power of two: {0}")]
    BricksPerChunkNotPowerOf2(u32),

    #[error("Chunks per file is not a power of two: {0}")]
    ChunksPerFileNotPowerOf2(u32),

    #[error("Files per directory is not a power of two: {0}")]
    FilesPerDirNotPowerOf2(u32),

    #[error("Not supported in this format version: {0}")]
    NotSupportedInVersion(String),

    #[error("Cannot create directory: {0}")]
    CannotCreateDirectory(String),

    #[error("Syntax error in metadata: {0}")]
    SyntaxError(String),

    #[error("Chunk not found: {0:#018x}")]
    ChunkNotFound(u64),

    #[error("Brick not found: {0}")]
    BrickNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl WzError {
    /// True for the "requested address is absent" family of errors.
    ///
    /// Callers querying sparsely populated regions may treat these as "no data"
    /// rather than as a failure.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            WzError::ChunkNotFound(_) | WzError::BrickNotFound(_) | WzError::FileNotFound(_)
        )
    }
}

/// Specialized Result type for wavezip operations
pub type Result<T> = std::result::Result<T, WzError>;

impl From<bincode::Error> for WzError {
    fn from(err: bincode::Error) -> Self {
        WzError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for WzError {
    fn from(err: serde_json::Error) -> Self {
        WzError::Serialization(err.to_string())
    }
}

//! Encoder configuration from JSON files and environment variables

use crate::address::OrderScheme;
use crate::compression::CompressionMethod;
use crate::layout::FormatBuilder;
use crate::error::{Result, WzError};
use crate::types::DataType;
use glam::IVec3;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Everything needed to encode one raw volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeParams {
    pub name: String,
    pub field: String,
    /// Raw little-endian input file
    pub input: Option<PathBuf>,
    pub dims: [i32; 3],
    pub data_type: DataType,
    pub brick: [i32; 3],
    pub iterations: u8,
    pub accuracy: f64,
    pub bricks_per_chunk: u32,
    pub chunks_per_file: u32,
    pub files_per_dir: u32,
    pub order: OrderScheme,
    pub group_iterations: bool,
    pub group_levels: bool,
    pub group_bit_planes: bool,
    /// Size divisors of the quality levels
    pub quality_levels: Vec<u32>,
    pub exponent_compression: CompressionMethod,
    /// Output directory
    pub dir: PathBuf,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            name: "volume".to_string(),
            field: "data".to_string(),
            input: None,
            dims: [256, 256, 256],
            data_type: DataType::F32,
            brick: [32, 32, 32],
            iterations: 1,
            accuracy: 0.0,
            bricks_per_chunk: 512,
            chunks_per_file: 4096,
            files_per_dir: 4096,
            order: OrderScheme::Morton,
            group_iterations: false,
            group_levels: true,
            group_bit_planes: false,
            quality_levels: Vec::new(),
            exponent_compression: CompressionMethod::Zstd,
            dir: PathBuf::from("data"),
        }
    }
}

/// Parse `"256x256x64"` or `"256,256,64"`; a single number applies to all axes
fn parse_vec3(value: &str) -> Option<[i32; 3]> {
    let parts: Vec<i32> = value
        .split(|c: char| c == 'x' || c == ',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [n] => Some([*n; 3]),
        [x, y, z] => Some([*x, *y, *z]),
        _ => None,
    }
}

fn parse_list(value: &str) -> Option<Vec<u32>> {
    value
        .split(',')
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.trim().parse().ok())
        .collect()
}

/// A set variable that fails to parse is an error, never a silent default
fn var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(value) => parse(&value).map(Some).ok_or_else(|| {
            WzError::Configuration(format!("{name}={value:?} is not valid"))
        }),
        None => Ok(None),
    }
}

impl EncodeParams {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WzError::FileNotFound(path.display().to_string()),
            _ => WzError::Configuration(format!("reading {}: {}", path.display(), e)),
        })?;
        serde_json::from_str(&text)
            .map_err(|e| WzError::Configuration(format!("parsing {}: {}", path.display(), e)))
    }

    /// Defaults overridden by `WAVEZIP_*` variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Override fields from `WAVEZIP_*` variables that are set
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|name| env::var(name).ok())
    }

    /// Override fields from the `WAVEZIP_*` values `lookup` knows about
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |v: &str| Some(v.to_string());
        if let Some(name) = var(&lookup, "WAVEZIP_NAME", text)? {
            self.name = name;
        }
        if let Some(field) = var(&lookup, "WAVEZIP_FIELD", text)? {
            self.field = field;
        }
        if let Some(input) = var(&lookup, "WAVEZIP_INPUT", text)? {
            self.input = Some(PathBuf::from(input));
        }
        if let Some(dir) = var(&lookup, "WAVEZIP_DIR", text)? {
            self.dir = PathBuf::from(dir);
        }
        if let Some(dims) = var(&lookup, "WAVEZIP_DIMS", parse_vec3)? {
            self.dims = dims;
        }
        if let Some(data_type) = var(&lookup, "WAVEZIP_TYPE", DataType::parse)? {
            self.data_type = data_type;
        }
        if let Some(brick) = var(&lookup, "WAVEZIP_BRICK", parse_vec3)? {
            self.brick = brick;
        }
        if let Some(iterations) = var(&lookup, "WAVEZIP_ITERATIONS", |v| v.trim().parse().ok())? {
            self.iterations = iterations;
        }
        if let Some(accuracy) = var(&lookup, "WAVEZIP_ACCURACY", |v| v.trim().parse().ok())? {
            self.accuracy = accuracy;
        }
        if let Some(n) = var(&lookup, "WAVEZIP_BRICKS_PER_CHUNK", |v| v.trim().parse().ok())? {
            self.bricks_per_chunk = n;
        }
        if let Some(n) = var(&lookup, "WAVEZIP_CHUNKS_PER_FILE", |v| v.trim().parse().ok())? {
            self.chunks_per_file = n;
        }
        if let Some(n) = var(&lookup, "WAVEZIP_FILES_PER_DIR", |v| v.trim().parse().ok())? {
            self.files_per_dir = n;
        }
        if let Some(order) = var(&lookup, "WAVEZIP_ORDER", OrderScheme::parse)? {
            self.order = order;
        }
        if let Some(levels) = var(&lookup, "WAVEZIP_QUALITY", parse_list)? {
            self.quality_levels = levels;
        }
        if let Some(method) = var(&lookup, "WAVEZIP_EXPONENT_COMPRESSION", CompressionMethod::parse)? {
            self.exponent_compression = method;
        }

        if self.iterations < 1 {
            return Err(WzError::Configuration(
                "at least one iteration is required".to_string(),
            ));
        }
        Ok(self)
    }

    /// Builder carrying these parameters; call `finalize` to validate
    pub fn to_builder(&self) -> FormatBuilder {
        FormatBuilder::new()
            .with_name(self.name.clone())
            .with_field(self.field.clone())
            .with_dimensions(IVec3::from_array(self.dims))
            .with_data_type(self.data_type)
            .with_brick_size(IVec3::from_array(self.brick))
            .with_num_iterations(self.iterations)
            .with_accuracy(self.accuracy)
            .with_bricks_per_chunk(self.bricks_per_chunk)
            .with_chunks_per_file(self.chunks_per_file)
            .with_files_per_directory(self.files_per_dir)
            .with_order_scheme(self.order)
            .with_group_iterations(self.group_iterations)
            .with_group_levels(self.group_levels)
            .with_group_bit_planes(self.group_bit_planes)
            .with_quality_levels(&self.quality_levels)
            .with_exponent_compression(self.exponent_compression)
            .with_dir(&self.dir)
    }
}

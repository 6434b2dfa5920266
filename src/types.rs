//! Core data types for wavezip

use glam::IVec3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element types supported by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// Unsigned 32-bit integer
    U32 = 3,
    /// Unsigned 64-bit integer (accepted by the builder, rejected at finalize)
    U64 = 4,
    /// Signed 8-bit integer
    I8 = 5,
    /// Signed 16-bit integer
    I16 = 6,
    /// Signed 32-bit integer
    I32 = 7,
    /// Signed 64-bit integer (accepted by the builder, rejected at finalize)
    I64 = 8,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "u8" | "uint8" => Some(DataType::U8),
            "u16" | "uint16" => Some(DataType::U16),
            "u32" | "uint32" => Some(DataType::U32),
            "u64" | "uint64" => Some(DataType::U64),
            "i8" | "int8" => Some(DataType::I8),
            "i16" | "int16" => Some(DataType::I16),
            "i32" | "int32" => Some(DataType::I32),
            "i64" | "int64" => Some(DataType::I64),
            "f32" | "float32" | "float" => Some(DataType::F32),
            "f64" | "float64" | "double" => Some(DataType::F64),
            _ => None,
        }
    }

    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Check if this is an integer type
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    pub fn is_signed(&self) -> bool {
        !matches!(
            self,
            DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64
        )
    }

    /// Whether the wavelet pipeline can carry this type without overflowing
    /// its 64-bit coefficients.
    pub fn is_codec_supported(&self) -> bool {
        !matches!(self, DataType::U64 | DataType::I64)
    }

    /// Representable range, used to clamp lossy integer reconstructions.
    pub fn limits(&self) -> (f64, f64) {
        match self {
            DataType::U8 => (u8::MIN as f64, u8::MAX as f64),
            DataType::U16 => (u16::MIN as f64, u16::MAX as f64),
            DataType::U32 => (u32::MIN as f64, u32::MAX as f64),
            DataType::U64 => (u64::MIN as f64, u64::MAX as f64),
            DataType::I8 => (i8::MIN as f64, i8::MAX as f64),
            DataType::I16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::I32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::I64 => (i64::MIN as f64, i64::MAX as f64),
            DataType::F32 => (f32::MIN as f64, f32::MAX as f64),
            DataType::F64 => (f64::MIN, f64::MAX),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Value range for a volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// An inverted range that any `include` call will overwrite.
    pub fn empty() -> Self {
        Self {
            min: f64::MAX,
            max: f64::MIN,
        }
    }

    pub fn include(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    /// Largest magnitude inside the range
    pub fn max_abs(&self) -> f64 {
        self.min.abs().max(self.max.abs())
    }
}

/// Range of bit-plane indices observed while encoding (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitPlaneRange {
    pub min: i16,
    pub max: i16,
}

impl BitPlaneRange {
    pub fn empty() -> Self {
        Self {
            min: i16::MAX,
            max: i16::MIN,
        }
    }

    pub fn include(&mut self, bit_plane: i16) {
        self.min = self.min.min(bit_plane);
        self.max = self.max.max(bit_plane);
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

impl Default for BitPlaneRange {
    fn default() -> Self {
        Self::empty()
    }
}

/// Axis-aligned box of samples: `from` inclusive, `dims` samples per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub from: IVec3,
    pub dims: IVec3,
}

impl Extent {
    pub fn new(from: IVec3, dims: IVec3) -> Self {
        Self { from, dims }
    }

    /// Extent covering a whole volume of the given dimensions
    pub fn whole(dims: IVec3) -> Self {
        Self {
            from: IVec3::ZERO,
            dims,
        }
    }

    /// Exclusive upper corner
    pub fn to(&self) -> IVec3 {
        self.from + self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.dims.cmple(IVec3::ZERO).any()
    }

    pub fn num_samples(&self) -> i64 {
        prod(self.dims)
    }

    pub fn contains(&self, p: IVec3) -> bool {
        p.cmpge(self.from).all() && p.cmplt(self.to()).all()
    }

    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let from = self.from.max(other.from);
        let to = self.to().min(other.to());
        if to.cmpgt(from).all() {
            Some(Extent::new(from, to - from))
        } else {
            None
        }
    }

    /// Map this extent onto a grid that is `scale` times coarser per axis.
    ///
    /// The result covers every coarse sample whose footprint overlaps `self`.
    pub fn coarsen(&self, scale: IVec3) -> Extent {
        let from = self.from.div_euclid(scale);
        let to = ceil_div3(self.to(), scale);
        Extent::new(from, (to - from).max(IVec3::ZERO))
    }
}

/// A strided sub-lattice (offset, extent, stride) in brick-local index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub from: IVec3,
    pub dims: IVec3,
    pub stride: IVec3,
}

impl Grid {
    pub fn new(from: IVec3, dims: IVec3, stride: IVec3) -> Self {
        Self { from, dims, stride }
    }

    pub fn num_samples(&self) -> i64 {
        prod(self.dims)
    }

    /// Brick-local position of the `i`-th grid point along each axis
    pub fn position(&self, local: IVec3) -> IVec3 {
        self.from + local * self.stride
    }
}

/// Product of the three components, widened to avoid overflow
pub fn prod(v: IVec3) -> i64 {
    v.x as i64 * v.y as i64 * v.z as i64
}

pub fn ceil_div3(a: IVec3, b: IVec3) -> IVec3 {
    IVec3::new(
        ceil_div(a.x, b.x),
        ceil_div(a.y, b.y),
        ceil_div(a.z, b.z),
    )
}

pub fn ceil_div(a: i32, b: i32) -> i32 {
    (a + b - 1).div_euclid(b)
}

/// Component-wise next power of two
pub fn next_pow2_3(v: IVec3) -> IVec3 {
    IVec3::new(
        (v.x.max(1) as u32).next_power_of_two() as i32,
        (v.y.max(1) as u32).next_power_of_two() as i32,
        (v.z.max(1) as u32).next_power_of_two() as i32,
    )
}

/// Binary exponent such that `|value| < 2^e` (frexp convention), clamped for
/// zero and denormals to the smallest normal exponent.
pub fn exponent(value: f64) -> i32 {
    if value == 0.0 || !value.is_finite() {
        return -1022;
    }
    let bits = value.abs().to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased == 0 {
        return -1022;
    }
    biased - 1022
}

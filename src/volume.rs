//! In-memory sample buffers and error metrics
//!
//! A [`Volume`] stores samples of one [`DataType`] as little-endian bytes,
//! x fastest, then y, then z, which is also the layout of raw volume files.

use crate::error::{Result, WzError};
use crate::types::{prod, DataType, Extent, ValueRange};
use glam::IVec3;
use num_traits::{Bounded, NumCast, ToPrimitive};
use std::path::Path;

/// A scalar type that can live in a [`Volume`]
pub trait Sample: Copy + Default + NumCast + ToPrimitive + Bounded + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_sample {
    ($t:ty, $dt:expr) => {
        impl Sample for $t {
            const DATA_TYPE: DataType = $dt;

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_sample!(u8, DataType::U8);
impl_sample!(i8, DataType::I8);
impl_sample!(u16, DataType::U16);
impl_sample!(i16, DataType::I16);
impl_sample!(u32, DataType::U32);
impl_sample!(i32, DataType::I32);
impl_sample!(u64, DataType::U64);
impl_sample!(i64, DataType::I64);
impl_sample!(f32, DataType::F32);
impl_sample!(f64, DataType::F64);

/// Run `$body` with `$t` bound to the Rust type of `$dt`
macro_rules! with_sample_type {
    ($dt:expr, $t:ident => $body:expr) => {
        match $dt {
            DataType::U8 => { type $t = u8; $body }
            DataType::I8 => { type $t = i8; $body }
            DataType::U16 => { type $t = u16; $body }
            DataType::I16 => { type $t = i16; $body }
            DataType::U32 => { type $t = u32; $body }
            DataType::I32 => { type $t = i32; $body }
            DataType::U64 => { type $t = u64; $body }
            DataType::I64 => { type $t = i64; $body }
            DataType::F32 => { type $t = f32; $body }
            DataType::F64 => { type $t = f64; $body }
        }
    };
}

/// Convert with rounding and saturation for integer targets
fn cast_sample<T: Sample>(value: f64) -> T {
    if T::DATA_TYPE.is_float() {
        return NumCast::from(value).unwrap_or_default();
    }
    if value.is_nan() {
        return T::default();
    }
    let (lo, hi) = T::DATA_TYPE.limits();
    let rounded = value.round();
    if rounded <= lo {
        T::min_value()
    } else if rounded >= hi {
        T::max_value()
    } else {
        NumCast::from(rounded).unwrap_or_default()
    }
}

/// A dense 3D block of samples
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    dims: IVec3,
    data_type: DataType,
    data: Vec<u8>,
}

impl Volume {
    /// A zero-filled volume
    pub fn new(dims: IVec3, data_type: DataType) -> Self {
        let len = prod(dims.max(IVec3::ZERO)) as usize * data_type.size_in_bytes();
        Self {
            dims,
            data_type,
            data: vec![0; len],
        }
    }

    pub fn from_samples<T: Sample>(dims: IVec3, samples: &[T]) -> Result<Self> {
        if samples.len() as i64 != prod(dims) {
            return Err(WzError::InvalidDimensions(format!(
                "{} samples do not fill {:?}",
                samples.len(),
                dims
            )));
        }
        let size = T::DATA_TYPE.size_in_bytes();
        let mut data = vec![0u8; samples.len() * size];
        for (sample, out) in samples.iter().zip(data.chunks_exact_mut(size)) {
            sample.write_le(out);
        }
        Ok(Self {
            dims,
            data_type: T::DATA_TYPE,
            data,
        })
    }

    /// Wrap raw little-endian bytes
    pub fn from_bytes(dims: IVec3, data_type: DataType, data: Vec<u8>) -> Result<Self> {
        let expected = prod(dims) as usize * data_type.size_in_bytes();
        if data.len() != expected {
            return Err(WzError::InvalidDimensions(format!(
                "expected {} bytes for {:?} {}, got {}",
                expected,
                dims,
                data_type,
                data.len()
            )));
        }
        Ok(Self {
            dims,
            data_type,
            data,
        })
    }

    /// Read a headerless raw file
    pub fn read_raw(path: impl AsRef<Path>, dims: IVec3, data_type: DataType) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WzError::FileNotFound(path.display().to_string()),
            _ => WzError::Io(e),
        })?;
        Self::from_bytes(dims, data_type, data)
    }

    pub fn write_raw(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    pub fn dims(&self) -> IVec3 {
        self.dims
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn num_samples(&self) -> usize {
        prod(self.dims) as usize
    }

    pub fn extent(&self) -> Extent {
        Extent::whole(self.dims)
    }

    #[inline]
    pub fn linear_index(&self, p: IVec3) -> usize {
        (p.x as i64 + self.dims.x as i64 * (p.y as i64 + self.dims.y as i64 * p.z as i64)) as usize
    }

    /// Sample at linear index `i`, widened to f64
    #[inline]
    pub fn get_index(&self, i: usize) -> f64 {
        let size = self.data_type.size_in_bytes();
        let bytes = &self.data[i * size..(i + 1) * size];
        with_sample_type!(self.data_type, T => T::read_le(bytes).to_f64().unwrap_or(0.0))
    }

    #[inline]
    pub fn get(&self, p: IVec3) -> f64 {
        self.get_index(self.linear_index(p))
    }

    /// Store `value`, rounded and clamped for integer types
    #[inline]
    pub fn set_index(&mut self, i: usize, value: f64) {
        let size = self.data_type.size_in_bytes();
        let out = &mut self.data[i * size..(i + 1) * size];
        with_sample_type!(self.data_type, T => cast_sample::<T>(value).write_le(out))
    }

    #[inline]
    pub fn set(&mut self, p: IVec3, value: f64) {
        let i = self.linear_index(p);
        self.set_index(i, value);
    }

    /// Typed copy of the samples
    pub fn samples<T: Sample>(&self) -> Result<Vec<T>> {
        if T::DATA_TYPE != self.data_type {
            return Err(WzError::InvalidFormat(format!(
                "volume holds {}, requested {}",
                self.data_type,
                T::DATA_TYPE
            )));
        }
        let size = self.data_type.size_in_bytes();
        Ok(self.data.chunks_exact(size).map(T::read_le).collect())
    }

    pub fn value_range(&self) -> ValueRange {
        let mut range = ValueRange::empty();
        for i in 0..self.num_samples() {
            range.include(self.get_index(i));
        }
        range
    }

    /// Copy out a sub-box
    pub fn crop(&self, extent: &Extent) -> Result<Volume> {
        let inside = extent
            .intersect(&self.extent())
            .filter(|e| e == extent)
            .ok_or_else(|| WzError::OutOfBounds(format!("{:?} not inside {:?}", extent, self.dims)))?;
        let mut out = Volume::new(inside.dims, self.data_type);
        for z in 0..inside.dims.z {
            for y in 0..inside.dims.y {
                for x in 0..inside.dims.x {
                    let local = IVec3::new(x, y, z);
                    out.set(local, self.get(inside.from + local));
                }
            }
        }
        Ok(out)
    }
}

fn check_same_shape(a: &Volume, b: &Volume) -> Result<()> {
    if a.dims != b.dims {
        return Err(WzError::InvalidDimensions(format!(
            "volumes differ in shape: {:?} vs {:?}",
            a.dims, b.dims
        )));
    }
    Ok(())
}

pub fn rms_error(a: &Volume, b: &Volume) -> Result<f64> {
    check_same_shape(a, b)?;
    let n = a.num_samples();
    if n == 0 {
        return Ok(0.0);
    }
    let sum: f64 = (0..n)
        .map(|i| {
            let d = a.get_index(i) - b.get_index(i);
            d * d
        })
        .sum();
    Ok((sum / n as f64).sqrt())
}

pub fn max_abs_error(a: &Volume, b: &Volume) -> Result<f64> {
    check_same_shape(a, b)?;
    Ok((0..a.num_samples())
        .map(|i| (a.get_index(i) - b.get_index(i)).abs())
        .fold(0.0, f64::max))
}

/// Peak signal-to-noise ratio in dB, peak taken from the value range of `reference`
pub fn psnr(reference: &Volume, other: &Volume) -> Result<f64> {
    let rms = rms_error(reference, other)?;
    if rms == 0.0 {
        return Ok(f64::INFINITY);
    }
    let range = reference.value_range();
    let peak = (range.max - range.min).max(f64::MIN_POSITIVE);
    Ok(20.0 * (peak / rms).log10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_typed_access() {
        let v = Volume::from_samples(IVec3::new(2, 2, 1), &[1i16, -2, 3, -4]).unwrap();
        assert_eq!(v.data_type(), DataType::I16);
        assert_eq!(v.get(IVec3::new(1, 1, 0)), -4.0);
        assert_eq!(v.samples::<i16>().unwrap(), vec![1, -2, 3, -4]);
        assert!(v.samples::<u8>().is_err());
    }

    #[test]
    fn test_set_rounds_and_clamps() {
        let mut v = Volume::new(IVec3::new(3, 1, 1), DataType::U8);
        v.set_index(0, 12.6);
        v.set_index(1, -5.0);
        v.set_index(2, 300.0);
        assert_eq!(v.samples::<u8>().unwrap(), vec![13, 0, 255]);

        let mut f = Volume::new(IVec3::ONE, DataType::F32);
        f.set_index(0, 0.25);
        assert_eq!(f.get_index(0), 0.25);
    }

    #[test]
    fn test_raw_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("v.raw");
        let v = Volume::from_samples(IVec3::new(3, 2, 2), &(0..12).map(|i| i as f32 * 0.5).collect::<Vec<_>>()).unwrap();
        v.write_raw(&path).unwrap();
        let back = Volume::read_raw(&path, v.dims(), DataType::F32).unwrap();
        assert_eq!(back, v);
        assert!(Volume::read_raw(&path, IVec3::splat(3), DataType::F32).is_err());
        assert!(matches!(
            Volume::read_raw(temp_dir.path().join("missing.raw"), v.dims(), DataType::F32),
            Err(WzError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_metrics() {
        let a = Volume::from_samples(IVec3::new(4, 1, 1), &[0.0f64, 1.0, 2.0, 3.0]).unwrap();
        let b = Volume::from_samples(IVec3::new(4, 1, 1), &[0.0f64, 1.0, 2.0, 5.0]).unwrap();
        assert_eq!(rms_error(&a, &b).unwrap(), 1.0);
        assert_eq!(max_abs_error(&a, &b).unwrap(), 2.0);
        assert!((psnr(&a, &b).unwrap() - 20.0 * 3f64.log10()).abs() < 1e-12);
        assert_eq!(psnr(&a, &a).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_crop() {
        let v = Volume::from_samples(IVec3::new(4, 4, 1), &(0..16u8).collect::<Vec<_>>()).unwrap();
        let c = v.crop(&Extent::new(IVec3::new(1, 2, 0), IVec3::new(2, 2, 1))).unwrap();
        assert_eq!(c.samples::<u8>().unwrap(), vec![9, 10, 13, 14]);
        assert!(v.crop(&Extent::new(IVec3::new(3, 3, 0), IVec3::new(2, 2, 1))).is_err());
    }
}

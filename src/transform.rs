//! Wavelet transform and quantization
//!
//! The transform works on a brick buffer padded with one halo sample on every
//! transformed axis. One forward pass splits each axis into interleaved low
//! (even) and high (odd) coefficients; the inverse pass is exact when every
//! coefficient is present.

use crate::types::{exponent, DataType, ValueRange};
use ndarray::{Array3, ArrayViewMut1, Axis};

/// A separable, invertible integer transform over a padded brick
pub trait WaveletTransform: Send + Sync {
    /// One forward pass over the axes flagged in `axes` (x, then y, then z)
    fn forward(&self, brick: &mut Array3<i64>, axes: [bool; 3]);

    /// Undo one forward pass (z, then y, then x)
    fn inverse(&self, brick: &mut Array3<i64>, axes: [bool; 3]);
}

/// Reversible CDF 5/3 lifting with whole-sample symmetric extension.
///
/// A lane holds `d` samples plus one halo sample at index `d`; the halo is
/// rewritten from the mirror sample before every predict step, so the stored
/// (unpadded) coefficients carry all the information.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cdf53Lifting;

impl Cdf53Lifting {
    fn forward_lane(x: &mut ArrayViewMut1<i64>) {
        let d = x.len() - 1;
        if d < 2 {
            return;
        }
        x[d] = x[d - 2];
        for k in (1..d).step_by(2) {
            x[k] -= (x[k - 1] + x[k + 1]) >> 1;
        }
        x[0] += (2 * x[1] + 2) >> 2;
        for k in (2..d).step_by(2) {
            x[k] += (x[k - 1] + x[k + 1] + 2) >> 2;
        }
    }

    fn inverse_lane(x: &mut ArrayViewMut1<i64>) {
        let d = x.len() - 1;
        if d < 2 {
            return;
        }
        x[0] -= (2 * x[1] + 2) >> 2;
        for k in (2..d).step_by(2) {
            x[k] -= (x[k - 1] + x[k + 1] + 2) >> 2;
        }
        x[d] = x[d - 2];
        for k in (1..d).step_by(2) {
            x[k] += (x[k - 1] + x[k + 1]) >> 1;
        }
    }
}

impl WaveletTransform for Cdf53Lifting {
    fn forward(&self, brick: &mut Array3<i64>, axes: [bool; 3]) {
        for axis in 0..3 {
            if axes[axis] {
                for mut lane in brick.lanes_mut(Axis(axis)) {
                    Self::forward_lane(&mut lane);
                }
            }
        }
    }

    fn inverse(&self, brick: &mut Array3<i64>, axes: [bool; 3]) {
        for axis in (0..3).rev() {
            if axes[axis] {
                for mut lane in brick.lanes_mut(Axis(axis)) {
                    Self::inverse_lane(&mut lane);
                }
            }
        }
    }
}

/// Largest number of magnitude bits a float coefficient is quantized to
pub const MAX_QUANTIZATION_BITS: i32 = 32;

/// Maps samples to integer coefficients: `q = round(v * 2^s)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantizer {
    scale_exponent: i32,
    is_float: bool,
}

impl Quantizer {
    pub fn new(data_type: DataType, scale_exponent: i32) -> Self {
        Self {
            scale_exponent,
            is_float: data_type.is_float(),
        }
    }

    /// Pick the scale for a volume: integers map exactly, floats keep
    /// enough bits below their largest exponent to meet `accuracy`
    pub fn for_volume(data_type: DataType, range: &ValueRange, accuracy: f64) -> Self {
        if !data_type.is_float() {
            return Self::new(data_type, 0);
        }
        let max_abs = range.max_abs();
        if max_abs == 0.0 || !max_abs.is_finite() {
            return Self::new(data_type, 0);
        }
        let emax = exponent(max_abs);
        let bits = if accuracy > 0.0 {
            (emax - accuracy.log2().floor() as i32).clamp(1, MAX_QUANTIZATION_BITS)
        } else {
            MAX_QUANTIZATION_BITS
        };
        Self::new(data_type, bits - 1 - emax)
    }

    pub fn scale_exponent(&self) -> i32 {
        self.scale_exponent
    }

    /// Sample value of one coefficient unit
    pub fn step(&self) -> f64 {
        2f64.powi(-self.scale_exponent)
    }

    pub fn to_coefficient(&self, value: f64) -> i64 {
        if self.is_float {
            (value * 2f64.powi(self.scale_exponent)).round() as i64
        } else {
            value as i64
        }
    }

    pub fn from_coefficient(&self, coefficient: i64) -> f64 {
        if self.is_float {
            coefficient as f64 * self.step()
        } else {
            coefficient as f64
        }
    }

    /// Lowest bit-plane that keeps samples within `accuracy` after
    /// `passes` inverse lifting passes.
    ///
    /// Dropping the planes below `p` leaves each coefficient within
    /// `2^p - 1` units. One inverse pass turns an error bound `e` into at
    /// most `2e + 1`, so the samples end within `2^(p + passes) - 1` units.
    /// Float samples also carry the half-step rounding of the encoder.
    pub fn min_bit_plane(&self, accuracy: f64, passes: u32) -> i16 {
        if accuracy <= 0.0 {
            return 0;
        }
        let mut budget = accuracy / self.step();
        if self.is_float {
            budget -= 0.5;
        }
        if budget < 1.0 {
            return 0;
        }
        let plane = (budget + 1.0).log2().floor() - passes as f64;
        plane.clamp(0.0, i16::MAX as f64) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn lcg(seed: &mut u64) -> i64 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((*seed >> 33) % 2001) as i64 - 1000
    }

    #[test]
    fn test_lane_is_reversible() {
        let mut seed = 7;
        for d in [2usize, 4, 8, 32] {
            let original: Vec<i64> = (0..=d).map(|_| lcg(&mut seed)).collect();
            let mut lane = ndarray::Array1::from(original.clone());
            Cdf53Lifting::forward_lane(&mut lane.view_mut());
            Cdf53Lifting::inverse_lane(&mut lane.view_mut());
            assert_eq!(&lane.as_slice().unwrap()[..d], &original[..d]);
        }
    }

    #[test]
    fn test_brick_roundtrip_ignores_halo() {
        let mut seed = 42;
        let mut brick = Array3::<i64>::zeros((17, 17, 9));
        brick.iter_mut().for_each(|v| *v = lcg(&mut seed));
        let original = brick.clone();
        let transform = Cdf53Lifting;
        transform.forward(&mut brick, [true, true, true]);
        // scribble over the halo planes; the inverse must not depend on them
        brick.slice_mut(s![16, .., ..]).fill(12345);
        brick.slice_mut(s![.., 16, ..]).fill(-777);
        brick.slice_mut(s![.., .., 8]).fill(99);
        transform.inverse(&mut brick, [true, true, true]);
        assert_eq!(
            brick.slice(s![..16, ..16, ..8]),
            original.slice(s![..16, ..16, ..8])
        );
    }

    #[test]
    fn test_constant_has_no_detail() {
        let mut brick = Array3::<i64>::from_elem((9, 9, 1), 5);
        Cdf53Lifting.forward(&mut brick, [true, true, false]);
        for x in 0..8 {
            for y in 0..8 {
                if x % 2 == 1 || y % 2 == 1 {
                    assert_eq!(brick[[x, y, 0]], 0);
                } else {
                    assert_eq!(brick[[x, y, 0]], 5);
                }
            }
        }
    }

    #[test]
    fn test_linear_ramp_has_no_detail() {
        let mut lane = ndarray::Array1::from((0..17).map(|i| 3 * i as i64).collect::<Vec<_>>());
        Cdf53Lifting::forward_lane(&mut lane.view_mut());
        for k in (1..15).step_by(2) {
            assert_eq!(lane[k], 0);
        }
    }

    #[test]
    fn test_quantizer_integer_is_exact() {
        let q = Quantizer::for_volume(DataType::I16, &ValueRange::new(-300.0, 200.0), 0.5);
        assert_eq!(q.scale_exponent(), 0);
        assert_eq!(q.to_coefficient(-123.0), -123);
        assert_eq!(q.from_coefficient(-123), -123.0);
        // 2^(1 + 6) - 1 = 127 stays within 128
        assert_eq!(q.min_bit_plane(128.0, 6), 1);
        assert_eq!(q.min_bit_plane(126.0, 6), 0);
    }

    #[test]
    fn test_inverse_pass_error_growth() {
        let mut seed = 11;
        for e in [1i64, 3, 7, 31] {
            for _ in 0..50 {
                let original: Vec<i64> = (0..=16).map(|_| lcg(&mut seed)).collect();
                let mut exact = ndarray::Array1::from(original);
                Cdf53Lifting::forward_lane(&mut exact.view_mut());
                let mut noisy = exact.clone();
                for v in noisy.iter_mut() {
                    *v += lcg(&mut seed) % (e + 1);
                }
                Cdf53Lifting::inverse_lane(&mut exact.view_mut());
                Cdf53Lifting::inverse_lane(&mut noisy.view_mut());
                let worst = exact
                    .iter()
                    .zip(noisy.iter())
                    .map(|(a, b)| (a - b).abs())
                    .max()
                    .unwrap();
                assert!(worst <= 2 * e + 1, "error {} grew to {}", e, worst);
            }
        }
    }

    #[test]
    fn test_quantizer_float_scale() {
        // max |v| = 3 -> emax = 2; lossless asks for 32 bits
        let q = Quantizer::for_volume(DataType::F32, &ValueRange::new(-3.0, 1.0), 0.0);
        assert_eq!(q.scale_exponent(), 29);
        let v = 1.2345678;
        let back = q.from_coefficient(q.to_coefficient(v));
        assert!((back - v).abs() <= q.step() / 2.0);

        // accuracy 2^-4 -> Q = 2 + 4 = 6 bits
        let q = Quantizer::for_volume(DataType::F64, &ValueRange::new(-3.0, 1.0), 0.0625);
        assert_eq!(q.scale_exponent(), 3);
        assert_eq!(q.min_bit_plane(0.0625, 0), 0);
        assert_eq!(q.min_bit_plane(1.0, 0), 3);
        // three inverse passes cost three planes
        assert_eq!(q.min_bit_plane(1.0, 3), 0);
        assert_eq!(q.min_bit_plane(4.0, 3), 2);

        let zero = Quantizer::for_volume(DataType::F32, &ValueRange::new(0.0, 0.0), 0.0);
        assert_eq!(zero.scale_exponent(), 0);
    }
}

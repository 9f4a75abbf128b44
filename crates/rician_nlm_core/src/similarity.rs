use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use rayon::prelude::*;

use crate::error::{NlmError, Result};
use crate::patch::{Geometry, Neighborhood};
use crate::rician::noise_floor;

/// Turns patch distances into similarity weights.
///
/// `w = exp(-max(d - 2·sigma², 0) / h²)`. The noise floor is subtracted so
/// that two noisy copies of the same patch still compare as identical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityKernel {
    floor: f64,
    inv_h_sq: f64,
}

impl SimilarityKernel {
    pub fn new(sigma: f64, h: f64) -> Result<Self> {
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(NlmError::InvalidParameter(format!(
                "sigma must be finite and >= 0, got {}",
                sigma
            )));
        }
        if !h.is_finite() || h <= 0.0 {
            return Err(NlmError::InvalidParameter(format!(
                "h must be finite and > 0, got {}",
                h
            )));
        }
        Ok(Self {
            floor: noise_floor(sigma),
            inv_h_sq: 1.0 / (h * h),
        })
    }

    #[inline]
    pub fn weight(&self, distance: f64) -> f64 {
        (-(distance - self.floor).max(0.0) * self.inv_h_sq).exp()
    }
}

/// Mean squared difference between the patches centred at `v` and `u`.
///
/// `data` holds `channels` interleaved samples per spatial position. Only
/// offsets `k` with both `v + k` and `u + k` inside the volume contribute;
/// the sum is normalized by their total weight and by the channel count.
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn patch_distance(
    data: &[f64],
    channels: usize,
    geom: &Geometry,
    v: &[usize],
    u: &[usize],
    patch: &Neighborhood,
    patch_weights: &[f64],
) -> f64 {
    let mut sum = 0.0;
    let mut total = 0.0;
    for (k, &w) in patch.iter().zip(patch_weights.iter()) {
        let (Some(vi), Some(ui)) = (geom.shifted(v, k), geom.shifted(u, k)) else {
            continue;
        };
        let a = &data[vi * channels..(vi + 1) * channels];
        let b = &data[ui * channels..(ui + 1) * channels];
        for (x, y) in a.iter().zip(b.iter()) {
            let diff = x - y;
            sum += w * diff * diff;
        }
        total += w;
    }
    if total > 0.0 {
        sum / (total * channels as f64)
    } else {
        f64::INFINITY
    }
}

/// Summed-area table of an n-dimensional volume.
///
/// A zero plane is prepended on every axis, so entry `i` holds the sum of all
/// samples with coordinates `< i` and any half-open box is recovered from its
/// `2^d` corners.
#[derive(Debug, Clone)]
pub struct IntegralVolume {
    geom: Geometry,
    table: Vec<f64>,
}

impl IntegralVolume {
    pub fn new(values: ArrayViewD<f64>) -> Self {
        let padded_shape: Vec<usize> = values.shape().iter().map(|&n| n + 1).collect();
        let mut padded = ArrayD::<f64>::zeros(IxDyn(&padded_shape));
        padded
            .slice_each_axis_mut(|_| Slice::from(1..))
            .assign(&values);
        for axis in 0..padded.ndim() {
            padded.accumulate_axis_inplace(Axis(axis), |&prev, curr| *curr += prev);
        }
        Self {
            geom: Geometry::new(&padded_shape),
            table: padded.into_raw_vec(),
        }
    }

    /// Sum over the half-open box `[lo, hi)`.
    #[inline]
    pub fn box_sum(&self, lo: &[usize], hi: &[usize]) -> f64 {
        let ndim = lo.len();
        let strides = self.geom.strides();
        let mut sum = 0.0;
        for mask in 0..(1usize << ndim) {
            let mut flat = 0;
            for axis in 0..ndim {
                let c = if mask & (1 << axis) != 0 { hi[axis] } else { lo[axis] };
                flat += c * strides[axis];
            }
            if (ndim - mask.count_ones() as usize) % 2 == 0 {
                sum += self.table[flat];
            } else {
                sum -= self.table[flat];
            }
        }
        sum
    }
}

/// Reusable buffers for the running-sum (fast) distance computation.
pub struct ShiftedWeights {
    shape: Vec<usize>,
    diff: Vec<f64>,
    weights: Vec<f64>,
}

impl ShiftedWeights {
    pub fn new(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            diff: vec![0.0; len],
            weights: vec![0.0; len],
        }
    }

    /// Weight of every voxel `v` against `v + offset`, zero where that
    /// neighbour is clipped.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Fill the weights for one search offset using box sums over the
    /// shifted squared-difference volume.
    ///
    /// Peak memory is one difference volume plus one summed-area table,
    /// independent of the patch size.
    pub fn compute(
        &mut self,
        data: &[f64],
        channels: usize,
        geom: &Geometry,
        offset: &[isize],
        patch_half_widths: &[usize],
        kernel: &SimilarityKernel,
    ) -> Result<()> {
        let ndim = geom.ndim();
        let shape = geom.shape();

        // Positions x whose partner x + offset is inside the volume.
        let valid_lo: Vec<usize> = offset.iter().map(|&s| (-s).max(0) as usize).collect();
        let valid_hi: Vec<usize> = shape
            .iter()
            .zip(offset.iter())
            .map(|(&n, &s)| n.saturating_sub(s.max(0) as usize))
            .collect();

        self.diff.par_iter_mut().enumerate().for_each_init(
            || vec![0usize; ndim],
            |coords, (x, out)| {
                geom.coords_of(x, coords);
                *out = match geom.shifted(coords, offset) {
                    Some(y) => {
                        let a = &data[x * channels..(x + 1) * channels];
                        let b = &data[y * channels..(y + 1) * channels];
                        a.iter()
                            .zip(b.iter())
                            .map(|(p, q)| (p - q) * (p - q))
                            .sum()
                    }
                    None => 0.0,
                };
            },
        );

        let diff = ArrayViewD::from_shape(IxDyn(&self.shape), &self.diff[..])
            .map_err(|e| NlmError::InvalidInput(format!("difference volume: {}", e)))?;
        let integral = IntegralVolume::new(diff);

        self.weights.par_iter_mut().enumerate().for_each_init(
            || (vec![0usize; ndim], vec![0usize; ndim], vec![0usize; ndim]),
            |(coords, lo, hi), (v, out)| {
                geom.coords_of(v, coords);
                if geom.shifted(coords, offset).is_none() {
                    *out = 0.0;
                    return;
                }
                let mut count = 1usize;
                for axis in 0..ndim {
                    let c = coords[axis];
                    let r = patch_half_widths[axis];
                    lo[axis] = c.saturating_sub(r);
                    hi[axis] = c.saturating_add(r).saturating_add(1).min(shape[axis]);
                    let overlap_lo = lo[axis].max(valid_lo[axis]);
                    let overlap_hi = hi[axis].min(valid_hi[axis]);
                    count *= overlap_hi.saturating_sub(overlap_lo);
                }
                let sum = integral.box_sum(lo, hi);
                let distance = sum / (count as f64 * channels as f64);
                *out = kernel.weight(distance);
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    // Deterministic generator for reproducible test volumes
    struct SimpleLcg {
        state: u64,
    }

    impl SimpleLcg {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_f64(&mut self) -> f64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (self.state >> 11) as f64 / (1u64 << 53) as f64
        }
    }

    fn random_volume(shape: (usize, usize, usize), seed: u64) -> Array3<f64> {
        let mut rng = SimpleLcg::new(seed);
        Array3::from_shape_fn(shape, |_| rng.next_f64())
    }

    // ==================== Kernel Tests ====================

    #[test]
    fn test_kernel_rejects_bad_bandwidth() {
        assert!(matches!(
            SimilarityKernel::new(0.1, 0.0),
            Err(NlmError::InvalidParameter(_))
        ));
        assert!(matches!(
            SimilarityKernel::new(0.1, -1.0),
            Err(NlmError::InvalidParameter(_))
        ));
        assert!(matches!(
            SimilarityKernel::new(0.1, f64::NAN),
            Err(NlmError::InvalidParameter(_))
        ));
        assert!(matches!(
            SimilarityKernel::new(-0.1, 1.0),
            Err(NlmError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_kernel_noise_floor_gives_unit_weight() {
        let kernel = SimilarityKernel::new(0.5, 1.0).unwrap();
        // Anything below 2·sigma² = 0.5 is treated as identical.
        assert_eq!(kernel.weight(0.0), 1.0);
        assert_eq!(kernel.weight(0.5), 1.0);
        assert!((kernel.weight(1.5) - (-1.0f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn test_kernel_monotone_in_distance() {
        let kernel = SimilarityKernel::new(0.1, 0.2).unwrap();
        let mut previous = 1.0;
        for i in 0..100 {
            let w = kernel.weight(i as f64 * 0.01);
            assert!(w <= previous);
            assert!(w >= 0.0);
            previous = w;
        }
    }

    #[test]
    fn test_kernel_underflows_to_zero() {
        let kernel = SimilarityKernel::new(0.0, 1e-3).unwrap();
        assert_eq!(kernel.weight(1.0), 0.0);
    }

    // ==================== Exact Distance Tests ====================

    #[test]
    fn test_patch_distance_identical_is_zero() {
        let volume = Array2::from_elem((6, 6), 0.75);
        let data = volume.as_slice().unwrap();
        let geom = Geometry::new(&[6, 6]);
        let patch = Neighborhood::new(2, 1).unwrap();
        let weights = vec![1.0; patch.len()];
        let d = patch_distance(data, 1, &geom, &[2, 2], &[3, 4], &patch, &weights);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn test_patch_distance_known_value() {
        // Left half 0, right half 1: a patch fully on each side differs by 1 everywhere.
        let volume = Array2::from_shape_fn((8, 8), |(_, c)| if c < 4 { 0.0 } else { 1.0 });
        let data = volume.as_slice().unwrap();
        let geom = Geometry::new(&[8, 8]);
        let patch = Neighborhood::new(2, 1).unwrap();
        let weights = vec![1.0; patch.len()];
        let d = patch_distance(data, 1, &geom, &[4, 1], &[4, 6], &patch, &weights);
        assert!((d - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_patch_distance_clips_at_border() {
        // Corner patch: only the 4 offsets inside the volume for both centres count.
        let volume = Array2::from_shape_fn((5, 5), |(r, c)| (r * 5 + c) as f64);
        let data = volume.as_slice().unwrap();
        let geom = Geometry::new(&[5, 5]);
        let patch = Neighborhood::new(2, 1).unwrap();
        let weights = vec![1.0; patch.len()];
        // u = v + (0, 1): every valid pair differs by exactly 1.
        let d = patch_distance(data, 1, &geom, &[0, 0], &[0, 1], &patch, &weights);
        assert!((d - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_patch_distance_averages_channels() {
        // Two channels, second one identical between patches.
        let geom = Geometry::new(&[3]);
        let data = [0.0, 5.0, 2.0, 5.0, 4.0, 5.0];
        let patch = Neighborhood::new(1, 0).unwrap();
        let d = patch_distance(&data, 2, &geom, &[0], &[1], &patch, &[1.0]);
        assert!((d - 2.0).abs() < 1e-15);
    }

    // ==================== Integral Volume Tests ====================

    #[test]
    fn test_integral_volume_2d_simple() {
        // [1, 2]
        // [3, 4]
        let input = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let integral = IntegralVolume::new(input.view().into_dyn());

        assert_eq!(integral.box_sum(&[0, 0], &[2, 2]), 10.0);
        assert_eq!(integral.box_sum(&[0, 0], &[1, 2]), 3.0);
        assert_eq!(integral.box_sum(&[1, 1], &[2, 2]), 4.0);
        assert_eq!(integral.box_sum(&[0, 1], &[2, 2]), 6.0);
        assert_eq!(integral.box_sum(&[1, 1], &[1, 2]), 0.0);
    }

    #[test]
    fn test_integral_volume_matches_direct_sum_3d() {
        let volume = random_volume((5, 6, 7), 321);
        let integral = IntegralVolume::new(volume.view().into_dyn());
        let lo = [1, 2, 0];
        let hi = [4, 6, 5];
        let mut expected = 0.0;
        for i in lo[0]..hi[0] {
            for j in lo[1]..hi[1] {
                for k in lo[2]..hi[2] {
                    expected += volume[[i, j, k]];
                }
            }
        }
        assert!((integral.box_sum(&lo, &hi) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_integral_volume_one_dimensional() {
        let values = ndarray::arr1(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let integral = IntegralVolume::new(values.view().into_dyn());
        assert_eq!(integral.box_sum(&[1], &[4]), 9.0);
        assert_eq!(integral.box_sum(&[0], &[5]), 15.0);
    }

    // ==================== Shifted Weight Tests ====================

    #[test]
    fn test_shifted_weights_match_exact_distances() {
        let volume = random_volume((6, 7, 5), 777);
        let data = volume.as_slice().unwrap();
        let geom = Geometry::new(&[6, 7, 5]);
        let patch = Neighborhood::new(3, 1).unwrap();
        let uniform = vec![1.0; patch.len()];
        let kernel = SimilarityKernel::new(0.05, 0.3).unwrap();
        let mut shifted = ShiftedWeights::new(geom.shape());

        for offset in [[0isize, 0, 1], [1, -2, 0], [-1, 1, 2]] {
            shifted.compute(data, 1, &geom, &offset, &[1, 1, 1], &kernel).unwrap();
            let mut coords = [0usize; 3];
            for v in 0..geom.len() {
                geom.coords_of(v, &mut coords);
                let expected = match geom.shifted(&coords, &offset) {
                    Some(u) => {
                        let mut u_coords = [0usize; 3];
                        geom.coords_of(u, &mut u_coords);
                        let d = patch_distance(data, 1, &geom, &coords, &u_coords, &patch, &uniform);
                        kernel.weight(d)
                    }
                    None => 0.0,
                };
                let got = shifted.weights()[v];
                assert!(
                    (got - expected).abs() <= 1e-9 * expected.max(1e-12),
                    "offset {:?}, voxel {}: fast {} vs exact {}",
                    offset,
                    v,
                    got,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_shifted_weights_zero_outside() {
        let volume = random_volume((4, 4, 4), 5);
        let data = volume.as_slice().unwrap();
        let geom = Geometry::new(&[4, 4, 4]);
        let kernel = SimilarityKernel::new(1.0, 1.0).unwrap();
        let mut shifted = ShiftedWeights::new(geom.shape());
        shifted.compute(data, 1, &geom, &[0, 0, 1], &[1, 1, 1], &kernel).unwrap();
        // Last plane along axis 2 has no partner.
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(shifted.weights()[i * 16 + j * 4 + 3], 0.0);
                // Everything else is within the noise floor of sigma = 1.
                assert_eq!(shifted.weights()[i * 16 + j * 4], 1.0);
            }
        }
    }

    #[test]
    fn test_shifted_weights_oversized_patch_matches_full_extent() {
        // A half-width past the extent covers the same box as n - 1.
        let volume = random_volume((5, 4, 6), 99);
        let data = volume.as_slice().unwrap();
        let geom = Geometry::new(&[5, 4, 6]);
        let kernel = SimilarityKernel::new(0.1, 0.5).unwrap();
        let offset = [1isize, 0, -2];

        let mut capped = ShiftedWeights::new(geom.shape());
        capped.compute(data, 1, &geom, &offset, &[4, 3, 5], &kernel).unwrap();
        let mut huge = ShiftedWeights::new(geom.shape());
        huge.compute(data, 1, &geom, &offset, &[usize::MAX; 3], &kernel).unwrap();
        assert_eq!(capped.weights(), huge.weights());
    }

    #[test]
    fn test_shifted_weights_two_dimensional_multichannel() {
        let volume = random_volume((1, 7, 10), 4242);
        let data = volume.as_slice().unwrap();
        // 7 x 5 image with two interleaved channels.
        let geom = Geometry::new(&[7, 5]);
        let patch = Neighborhood::new(2, 1).unwrap();
        let uniform = vec![1.0; patch.len()];
        let kernel = SimilarityKernel::new(0.05, 0.4).unwrap();
        let mut shifted = ShiftedWeights::new(geom.shape());
        let offset = [-1isize, 2];
        shifted.compute(data, 2, &geom, &offset, &[1, 1], &kernel).unwrap();

        let mut coords = [0usize; 2];
        let mut u_coords = [0usize; 2];
        for v in 0..geom.len() {
            geom.coords_of(v, &mut coords);
            let expected = match geom.shifted(&coords, &offset) {
                Some(u) => {
                    geom.coords_of(u, &mut u_coords);
                    kernel.weight(patch_distance(data, 2, &geom, &coords, &u_coords, &patch, &uniform))
                }
                None => 0.0,
            };
            assert!((shifted.weights()[v] - expected).abs() <= 1e-9 * expected.max(1e-12));
        }
    }
}

use ndarray::ArrayViewD;

use crate::error::{NlmError, Result};
use crate::intensity::Intensity;

/// Minimum number of samples for a local linear pseudo-residual.
const MIN_SAMPLES: usize = 3;

/// Estimate the noise scale of a uniformly sampled sequence.
///
/// Implements the pseudo-residual estimator of Gasser et al. (1986) as used
/// for Rician NLM by Wiest-Daesslé et al. (2008). Every interior sample is
/// compared against the linear interpolation of its two neighbours; the
/// residual cancels locally linear signal and keeps the high-frequency part.
///
/// On a uniform grid the interpolation coefficients are `a = b = 0.5` and the
/// residual weight is `c = 1 / (a² + b² + 1) = 2/3`. The estimate is
/// `sqrt(Σ c²·(a·x[i-1] + b·x[i+1] - x[i])² / (n - 2))`, which responds to
/// white noise of standard deviation `s` with `sqrt(2/3)·s`.
///
/// # Errors
///
/// `InvalidInput` when fewer than 3 samples are given or a sample is not finite.
pub fn estimate_noise_scale(samples: &[f64]) -> Result<f64> {
    check_samples(samples)?;

    let a = 0.5;
    let b = 0.5;
    let c = 1.0 / (a * a + b * b + 1.0);
    let c2 = c * c;

    let sum: f64 = samples
        .windows(3)
        .map(|w| {
            let residual = a * w[0] + b * w[2] - w[1];
            c2 * residual * residual
        })
        .sum();

    Ok((sum / (samples.len() - 2) as f64).sqrt())
}

/// Estimate the noise scale of a sequence sampled at explicit positions.
///
/// General form of [`estimate_noise_scale`]: the interpolation coefficients
/// `a = (t[i+1] - t[i]) / (t[i+1] - t[i-1])` and
/// `b = (t[i] - t[i-1]) / (t[i+1] - t[i-1])` follow the local spacing.
///
/// # Errors
///
/// `InvalidInput` when the lengths differ, fewer than 3 samples are given,
/// a value is not finite, or the positions are not strictly increasing.
pub fn estimate_noise_scale_at(positions: &[f64], samples: &[f64]) -> Result<f64> {
    if positions.len() != samples.len() {
        return Err(NlmError::InvalidInput(format!(
            "positions ({}) and samples ({}) must have the same length",
            positions.len(),
            samples.len()
        )));
    }
    check_samples(samples)?;
    if positions.iter().any(|t| !t.is_finite()) {
        return Err(NlmError::InvalidInput(
            "sample positions must be finite".to_string(),
        ));
    }
    if let Some(i) = positions.windows(2).position(|w| w[1] <= w[0]) {
        return Err(NlmError::InvalidInput(format!(
            "sample positions must be strictly increasing (index {})",
            i + 1
        )));
    }

    let mut sum = 0.0;
    for i in 1..samples.len() - 1 {
        let span = positions[i + 1] - positions[i - 1];
        let a = (positions[i + 1] - positions[i]) / span;
        let b = (positions[i] - positions[i - 1]) / span;
        let c = 1.0 / (a * a + b * b + 1.0);
        let residual = a * samples[i - 1] + b * samples[i + 1] - samples[i];
        sum += c * c * residual * residual;
    }

    Ok((sum / (samples.len() - 2) as f64).sqrt())
}

/// Estimate the noise scale of a volume flattened in row-major order.
///
/// Samples are taken at their stored values, without range remapping.
pub fn estimate_volume_noise_scale<T: Intensity>(volume: ArrayViewD<T>) -> Result<f64> {
    let flat: Vec<f64> = volume.iter().map(|&x| x.to_f64()).collect();
    let sigma = estimate_noise_scale(&flat)?;
    log::debug!(
        "Estimated noise scale {:.6} from volume of shape {:?}",
        sigma,
        volume.shape()
    );
    Ok(sigma)
}

fn check_samples(samples: &[f64]) -> Result<()> {
    if samples.len() < MIN_SAMPLES {
        return Err(NlmError::InvalidInput(format!(
            "noise estimation needs at least {} samples, got {}",
            MIN_SAMPLES,
            samples.len()
        )));
    }
    if let Some(i) = samples.iter().position(|x| !x.is_finite()) {
        return Err(NlmError::InvalidInput(format!(
            "sample {} is not finite",
            i
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, ArrayD, IxDyn};
    use rand::prelude::*;
    use rand_distr::{Distribution, Normal};

    fn white_noise(n: usize, sigma: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, sigma).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    #[test]
    fn test_linear_ramp_is_zero() {
        let ramp: Vec<f64> = (0..100).map(|i| 3.0 + 0.25 * i as f64).collect();
        let sigma = estimate_noise_scale(&ramp).unwrap();
        assert!(sigma.abs() < 1e-12, "ramp should give 0, got {}", sigma);
    }

    #[test]
    fn test_constant_is_zero() {
        let sigma = estimate_noise_scale(&[4.0; 16]).unwrap();
        assert_eq!(sigma, 0.0);
    }

    #[test]
    fn test_alternating_golden_value() {
        // Residual is ±2A everywhere, weighted by c² = 4/9: sigma = 4A/3.
        for amplitude in [0.5, 1.0, 3.0] {
            let seq: Vec<f64> = (0..64)
                .map(|i| if i % 2 == 0 { 10.0 + amplitude } else { 10.0 - amplitude })
                .collect();
            let sigma = estimate_noise_scale(&seq).unwrap();
            let expected = 4.0 * amplitude / 3.0;
            assert!(
                (sigma - expected).abs() < 1e-12,
                "amplitude {}: expected {}, got {}",
                amplitude,
                expected,
                sigma
            );
        }
    }

    #[test]
    fn test_minimum_length() {
        // One interior sample with residual 1, weighted by c² = 4/9.
        let sigma = estimate_noise_scale(&[1.0, 0.0, 1.0]).unwrap();
        assert!((sigma - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_too_short_is_invalid_input() {
        for seq in [vec![], vec![1.0], vec![1.0, 2.0]] {
            let err = estimate_noise_scale(&seq).unwrap_err();
            assert!(matches!(err, NlmError::InvalidInput(_)));
        }
    }

    #[test]
    fn test_non_finite_is_invalid_input() {
        let err = estimate_noise_scale(&[1.0, f64::NAN, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, NlmError::InvalidInput(_)));
    }

    #[test]
    fn test_white_noise_gain() {
        let sigma_true = 0.5;
        let noise = white_noise(200_000, sigma_true, 42);
        let sigma = estimate_noise_scale(&noise).unwrap();
        let expected = sigma_true * (2.0f64 / 3.0).sqrt();
        let error = (sigma - expected).abs() / expected;
        assert!(
            error < 0.02,
            "Error {:.2}% exceeds 2% tolerance",
            error * 100.0
        );
    }

    #[test]
    fn test_relative_noise_levels() {
        let low = estimate_noise_scale(&white_noise(50_000, 0.01, 7)).unwrap();
        let high = estimate_noise_scale(&white_noise(50_000, 0.10, 7)).unwrap();
        let ratio = high / low;
        assert!(ratio > 9.5 && ratio < 10.5, "Expected ratio ~10, got {}", ratio);
    }

    #[test]
    fn test_smooth_trend_is_ignored() {
        let n = 20_000;
        let noise = white_noise(n, 0.2, 11);
        let trended: Vec<f64> = noise
            .iter()
            .enumerate()
            .map(|(i, x)| x + (i as f64 / n as f64 * std::f64::consts::PI).sin() * 5.0)
            .collect();
        let plain = estimate_noise_scale(&noise).unwrap();
        let with_trend = estimate_noise_scale(&trended).unwrap();
        assert!((plain - with_trend).abs() / plain < 1e-3);
    }

    #[test]
    fn test_uniform_positions_match_uniform_estimator() {
        let noise = white_noise(1_000, 1.0, 3);
        let positions: Vec<f64> = (0..noise.len()).map(|i| 2.0 * i as f64).collect();
        let uniform = estimate_noise_scale(&noise).unwrap();
        let general = estimate_noise_scale_at(&positions, &noise).unwrap();
        assert!((uniform - general).abs() < 1e-12);
    }

    #[test]
    fn test_irregular_positions_cancel_linear_signal() {
        let positions = [0.0, 0.5, 2.0, 2.25, 4.0, 7.5];
        let samples: Vec<f64> = positions.iter().map(|t| 1.0 - 0.3 * t).collect();
        let sigma = estimate_noise_scale_at(&positions, &samples).unwrap();
        assert!(sigma < 1e-12, "linear signal on irregular grid gave {}", sigma);
    }

    #[test]
    fn test_positions_validation() {
        let samples = [1.0, 2.0, 3.0];
        assert!(matches!(
            estimate_noise_scale_at(&[0.0, 1.0], &samples),
            Err(NlmError::InvalidInput(_))
        ));
        assert!(matches!(
            estimate_noise_scale_at(&[0.0, 1.0, 1.0], &samples),
            Err(NlmError::InvalidInput(_))
        ));
        assert!(matches!(
            estimate_noise_scale_at(&[0.0, f64::INFINITY, 2.0], &samples),
            Err(NlmError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_volume_uses_row_major_order() {
        let volume = Array3::from_shape_fn((4, 5, 6), |(i, j, k)| {
            if (i * 30 + j * 6 + k) % 2 == 0 {
                1.0
            } else {
                -1.0
            }
        });
        let sigma = estimate_volume_noise_scale(volume.view().into_dyn()).unwrap();
        assert!((sigma - 4.0 / 3.0).abs() < 1e-12);

        // A transposed view must still be read in its logical order.
        let transposed = volume.t().to_owned();
        let from_view = estimate_volume_noise_scale(volume.t().into_dyn()).unwrap();
        let from_owned = estimate_volume_noise_scale(transposed.view().into_dyn()).unwrap();
        assert!((from_view - from_owned).abs() < 1e-12);
    }

    #[test]
    fn test_volume_too_small() {
        let volume = ArrayD::<f64>::zeros(IxDyn(&[1, 2]));
        assert!(matches!(
            estimate_volume_noise_scale(volume.view()),
            Err(NlmError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_integer_volume_matches_float_values() {
        let values = Array3::from_shape_fn((6, 7, 8), |(i, j, k)| ((i * 131 + j * 71 + k * 29) % 997) as u16);
        let as_float = values.mapv(f64::from);
        let from_u16 = estimate_volume_noise_scale(values.view().into_dyn()).unwrap();
        let from_f64 = estimate_volume_noise_scale(as_float.view().into_dyn()).unwrap();
        assert_eq!(from_u16, from_f64);
        assert!(from_u16 > 0.0);

        let signed = as_float.mapv(|x| (x - 500.0) as i16);
        let shifted = estimate_volume_noise_scale(signed.view().into_dyn()).unwrap();
        assert!((shifted - from_f64).abs() < 1e-9 * from_f64);
    }
}

//! Synthetic test volumes with known noiseless content.
//!
//! The cylinder phantom is a square prism of intensity 1 with an inscribed
//! cylinder of intensity 5, both spanning the central 80% of the last axis
//! and sitting in a zero background.

use ndarray::{Array3, ArrayViewD};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use crate::error::{NlmError, Result};

/// Intensity of the square prism.
pub const PRISM_INTENSITY: f64 = 1.0;

/// Intensity of the cylinder.
pub const CYLINDER_INTENSITY: f64 = 5.0;

/// Build a cylinder phantom of shape `(x, y, z)`.
pub fn cylinder_phantom(shape: (usize, usize, usize)) -> Array3<f64> {
    let (x_size, y_size, z_size) = shape;
    let x_center = x_size as f64 / 2.0;
    let y_center = y_size as f64 / 2.0;
    let radius = x_size as f64 * 0.4;
    let z_start = z_size as f64 * 0.1;
    let z_end = z_size as f64 * 0.9;

    Array3::from_shape_fn(shape, |(x, y, z)| {
        let z = z as f64;
        if z < z_start || z > z_end {
            return 0.0;
        }
        let dx = x as f64 - x_center;
        let dy = y as f64 - y_center;
        if dx * dx + dy * dy <= radius * radius {
            CYLINDER_INTENSITY
        } else if dx.abs() <= radius && dy.abs() <= radius {
            PRISM_INTENSITY
        } else {
            0.0
        }
    })
}

fn normal(level: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, level).map_err(|e| {
        NlmError::InvalidParameter(format!("noise level {}: {}", level, e))
    })
}

/// Magnitude of the signal plus complex Gaussian noise,
/// `sqrt((S + n_re)² + n_im²)` with both components of scale `level`.
pub fn add_rician_noise<D: ndarray::Dimension>(
    volume: ndarray::ArrayView<f64, D>,
    level: f64,
    seed: u64,
) -> Result<ndarray::Array<f64, D>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = normal(level)?;
    Ok(volume.mapv(|s| {
        let re = s + noise.sample(&mut rng);
        let im = noise.sample(&mut rng);
        (re * re + im * im).sqrt()
    }))
}

/// Signal plus additive Rayleigh noise, `S + sqrt(n_re² + n_im²)` with both
/// components of scale `level`.
///
/// This is how the reference phantom acquisition is simulated. The noise
/// has mean `level·sqrt(π/2)` and standard deviation `level·sqrt(2 - π/2)`.
pub fn add_rayleigh_noise<D: ndarray::Dimension>(
    volume: ndarray::ArrayView<f64, D>,
    level: f64,
    seed: u64,
) -> Result<ndarray::Array<f64, D>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = normal(level)?;
    Ok(volume.mapv(|s| {
        let re = noise.sample(&mut rng);
        let im = noise.sample(&mut rng);
        s + (re * re + im * im).sqrt()
    }))
}

/// Signal plus real Gaussian noise of standard deviation `level`.
pub fn add_gaussian_noise<D: ndarray::Dimension>(
    volume: ndarray::ArrayView<f64, D>,
    level: f64,
    seed: u64,
) -> Result<ndarray::Array<f64, D>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = normal(level)?;
    Ok(volume.mapv(|s| s + noise.sample(&mut rng)))
}

/// Root mean square error between two volumes of equal shape.
///
/// # Errors
///
/// `InvalidInput` when the shapes differ or the volumes are empty.
pub fn rmse(a: ArrayViewD<f64>, b: ArrayViewD<f64>) -> Result<f64> {
    if a.shape() != b.shape() {
        return Err(NlmError::InvalidInput(format!(
            "shape mismatch: {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    if a.is_empty() {
        return Err(NlmError::InvalidInput("empty volumes".to_string()));
    }
    let sum: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    Ok((sum / a.len() as f64).sqrt())
}

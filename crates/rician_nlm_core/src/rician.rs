//! Noise-floor bias removal for magnitude data.
//!
//! A magnitude sample `X = |A + n|` with complex Gaussian noise of scale
//! `sigma` per component has `E[X²] = A² + 2·sigma²`, so a plain weighted
//! average of magnitudes is biased upward. Subtracting the noise floor from
//! the second moment before the square root recovers `A`.

/// Expected contribution of the noise to a second moment, `2·sigma²`.
#[inline]
pub fn noise_floor(sigma: f64) -> f64 {
    2.0 * sigma * sigma
}

/// Debiased amplitude `sqrt(max(E[X²] - 2·sigma², 0))`.
#[inline]
pub fn rician_correct(second_moment: f64, sigma: f64) -> f64 {
    (second_moment - noise_floor(sigma)).max(0.0).sqrt()
}

//! Conversion of caller volumes into the engine's working layout.
//!
//! The engine reads a contiguous row-major `f64` buffer in which the
//! `channels` samples of one spatial position are adjacent. A single-channel
//! volume is stored as-is; with `multichannel` the last axis holds channels.

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::{NlmError, Result};
use crate::intensity::Intensity;
use crate::patch::Geometry;

/// Small epsilon to avoid division by zero during normalization
const NORMALIZATION_EPSILON: f64 = 1e-10;

/// Convert `volume` to a standard-layout `f64` array.
///
/// With `preserve_range` the numeric values are kept. Otherwise integer types
/// are divided by their type range, and floating point data already inside
/// `[0, 1]` is kept while anything else is min-max rescaled (a constant
/// volume becomes zeros). The result is never remapped back.
///
/// # Errors
///
/// `InvalidInput` when the volume is empty or holds a non-finite sample.
pub fn to_float_volume<T: Intensity>(
    volume: ArrayViewD<T>,
    preserve_range: bool,
) -> Result<ArrayD<f64>> {
    if volume.is_empty() {
        return Err(NlmError::InvalidInput(format!(
            "volume of shape {:?} is empty",
            volume.shape()
        )));
    }

    let remap_by_type = !preserve_range && T::HAS_TYPE_RANGE;
    let values: Vec<f64> = if remap_by_type {
        volume.iter().map(|&x| x.to_unit()).collect()
    } else {
        volume.iter().map(|&x| x.to_f64()).collect()
    };
    if let Some(i) = values.iter().position(|x| !x.is_finite()) {
        return Err(NlmError::InvalidInput(format!(
            "sample {} of the volume is not finite",
            i
        )));
    }

    let mut converted = ArrayD::from_shape_vec(IxDyn(volume.shape()), values)
        .map_err(|e| NlmError::InvalidInput(format!("volume layout: {}", e)))?;

    if !preserve_range && !T::HAS_TYPE_RANGE {
        let d_min = converted.iter().copied().fold(f64::INFINITY, f64::min);
        let d_max = converted.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if d_min < 0.0 || d_max > 1.0 {
            let range = d_max - d_min;
            if range > NORMALIZATION_EPSILON {
                converted.mapv_inplace(|x| (x - d_min) / range);
            } else {
                // Constant volume - just use zeros
                converted.fill(0.0);
            }
        }
    }

    Ok(converted)
}

/// Spatial geometry and channel count of a validated volume.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    geometry: Geometry,
    channels: usize,
}

impl VolumeLayout {
    /// Split `shape` into spatial axes and channels and check it against the
    /// search window.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty shape or empty volume, for `multichannel`
    /// without a spatial axis, and when a spatial axis is shorter than the
    /// search window (`2·patch_distance + 1`).
    pub fn new(shape: &[usize], multichannel: bool, patch_distance: usize) -> Result<Self> {
        if shape.is_empty() {
            return Err(NlmError::InvalidInput(
                "volume must have at least one axis".to_string(),
            ));
        }
        if shape.iter().any(|&n| n == 0) {
            return Err(NlmError::InvalidInput(format!(
                "volume of shape {:?} is empty",
                shape
            )));
        }

        let (spatial, channels) = if multichannel {
            if shape.len() < 2 {
                return Err(NlmError::InvalidInput(format!(
                    "multichannel volume needs a spatial axis and a channel axis, got shape {:?}",
                    shape
                )));
            }
            let (spatial, last) = shape.split_at(shape.len() - 1);
            (spatial, last[0])
        } else {
            (shape, 1)
        };

        let window = patch_distance.saturating_mul(2).saturating_add(1);
        if let Some(axis) = spatial.iter().position(|&n| n < window) {
            return Err(NlmError::InvalidInput(format!(
                "axis {} has {} samples, fewer than the search window width {} \
                 (patch_distance = {})",
                axis, spatial[axis], window, patch_distance
            )));
        }

        Ok(Self {
            geometry: Geometry::new(spatial),
            channels,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

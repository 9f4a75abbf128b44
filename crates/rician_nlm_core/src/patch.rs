//! Patch and search-window offsets with boundary clipping.
//!
//! Offsets are enumerated in row-major order over `[-r, r]^d`, so the origin
//! sits at index `len / 2` and the offset at index `len - 1 - i` is the
//! negation of the one at `i`. A shifted position that leaves the volume is
//! never indexed: [`Geometry::shifted`] returns `None` and the caller drops
//! that offset (clipping, not mirroring or wrapping).

use crate::error::{NlmError, Result};

/// Row-major geometry of the spatial part of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    shape: Vec<usize>,
    strides: Vec<usize>,
    len: usize,
}

#[allow(clippy::len_without_is_empty)]
impl Geometry {
    pub fn new(shape: &[usize]) -> Self {
        let mut strides = vec![1usize; shape.len()];
        for axis in (0..shape.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * shape[axis + 1];
        }
        Self {
            shape: shape.to_vec(),
            strides,
            len: shape.iter().product(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of spatial positions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Write the coordinates of flat index `flat` into `out`.
    #[inline]
    pub fn coords_of(&self, flat: usize, out: &mut [usize]) {
        let mut rest = flat;
        for (axis, &stride) in self.strides.iter().enumerate() {
            out[axis] = rest / stride;
            rest %= stride;
        }
    }

    /// Signed flat displacement of `offset`.
    pub fn flat_offset(&self, offset: &[isize]) -> isize {
        offset
            .iter()
            .zip(self.strides.iter())
            .map(|(&o, &s)| o * s as isize)
            .sum()
    }

    /// Flat index of `coords + offset`, or `None` when it leaves the extent.
    #[inline]
    pub fn shifted(&self, coords: &[usize], offset: &[isize]) -> Option<usize> {
        let mut flat = 0usize;
        for axis in 0..self.shape.len() {
            let pos = coords[axis] as isize + offset[axis];
            if pos < 0 || pos >= self.shape[axis] as isize {
                return None;
            }
            flat += pos as usize * self.strides[axis];
        }
        Some(flat)
    }
}

/// Number of offsets in a box with the given per-axis half-widths, or `None`
/// when it does not fit in `usize`.
pub fn neighborhood_len(half_widths: &[usize]) -> Option<usize> {
    half_widths.iter().try_fold(1usize, |acc, &h| {
        h.checked_mul(2)
            .and_then(|w| w.checked_add(1))
            .and_then(|w| acc.checked_mul(w))
    })
}

/// Half-widths of a `radius` neighborhood restricted to `shape`.
///
/// An offset of `n` or more along an axis of extent `n` never lands inside
/// the volume, so each half-width is capped at `n - 1`.
pub fn clipped_half_widths(radius: usize, shape: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .map(|&n| radius.min(n.saturating_sub(1)))
        .collect()
}

/// Set of integer offsets covering a centered box.
///
/// The nominal `radius` sets the Gaussian kernel; the per-axis half-widths
/// set the extent and never exceed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighborhood {
    ndim: usize,
    radius: usize,
    half_widths: Vec<usize>,
    count: usize,
    offsets: Vec<isize>,
}

#[allow(clippy::len_without_is_empty)]
impl Neighborhood {
    /// Hypercube of half-width `radius` in `ndim` dimensions.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when the offset table does not fit in memory.
    pub fn new(ndim: usize, radius: usize) -> Result<Self> {
        Self::with_half_widths(radius, vec![radius; ndim])
    }

    /// Hypercube of half-width `radius` with every axis capped to `shape`.
    pub fn clipped(radius: usize, shape: &[usize]) -> Result<Self> {
        Self::with_half_widths(radius, clipped_half_widths(radius, shape))
    }

    fn with_half_widths(radius: usize, half_widths: Vec<usize>) -> Result<Self> {
        let ndim = half_widths.len();
        let too_large = || {
            NlmError::InvalidParameter(format!(
                "neighborhood of half-width {} in {} dimensions is too large",
                radius, ndim
            ))
        };
        let count = neighborhood_len(&half_widths).ok_or_else(too_large)?;
        let table_len = count.checked_mul(ndim).ok_or_else(too_large)?;
        if half_widths.iter().any(|&h| h > isize::MAX as usize / 2) {
            return Err(too_large());
        }

        let mut offsets = Vec::with_capacity(table_len);
        for index in 0..count {
            let mut rest = index;
            let start = offsets.len();
            offsets.resize(start + ndim, 0);
            for axis in (0..ndim).rev() {
                let width = 2 * half_widths[axis] + 1;
                offsets[start + axis] = (rest % width) as isize - half_widths[axis] as isize;
                rest /= width;
            }
        }
        Ok(Self {
            ndim,
            radius,
            half_widths,
            count,
            offsets,
        })
    }

    /// Nominal half-width.
    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Effective half-width per axis.
    pub fn half_widths(&self) -> &[usize] {
        &self.half_widths
    }

    /// Number of offsets; at least one, since the origin is always included.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Index of the zero offset.
    pub fn center_index(&self) -> usize {
        self.count / 2
    }

    pub fn offset(&self, index: usize) -> &[isize] {
        &self.offsets[index * self.ndim..(index + 1) * self.ndim]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[isize]> + '_ {
        (0..self.count).map(move |i| self.offset(i))
    }

    /// Offsets strictly after the origin in row-major order.
    ///
    /// Together with their negations they cover every non-zero offset once.
    pub fn positive_half(&self) -> impl Iterator<Item = &[isize]> + '_ {
        (self.center_index() + 1..self.count).map(move |i| self.offset(i))
    }

    /// Gaussian kernel `exp(-|k|² / (2A²))` with `A = radius / 2`.
    ///
    /// A zero radius yields the single unit weight.
    pub fn gaussian_weights(&self) -> Vec<f64> {
        if self.radius == 0 {
            return vec![1.0; self.count];
        }
        let a = self.radius as f64 / 2.0;
        let denom = 2.0 * a * a;
        self.iter()
            .map(|k| {
                let r2: f64 = k.iter().map(|&x| (x as f64) * (x as f64)).sum();
                (-r2 / denom).exp()
            })
            .collect()
    }
}

/// Offsets for the comparison patch and the search window of one run.
#[derive(Debug, Clone)]
pub struct PatchIndexer {
    patch: Neighborhood,
    search: Neighborhood,
}

impl PatchIndexer {
    /// Offsets for a volume of spatial `shape`, with the patch capped to the
    /// volume extent.
    pub fn for_shape(shape: &[usize], patch_size: usize, patch_distance: usize) -> Result<Self> {
        Ok(Self {
            patch: Neighborhood::clipped(patch_size, shape)?,
            search: Neighborhood::clipped(patch_distance, shape)?,
        })
    }

    pub fn patch(&self) -> &Neighborhood {
        &self.patch
    }

    pub fn search_window(&self) -> &Neighborhood {
        &self.search
    }
}

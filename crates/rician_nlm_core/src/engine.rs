//! Rician non-local means over n-dimensional volumes.
//!
//! Every output voxel `v` is estimated from the voxels `u` of its search
//! window, weighted by patch similarity:
//!
//! ```text
//! out[v] = sqrt(max(Σ_u w(v,u)·X[u]² / Σ_u w(v,u) - 2·sigma², 0))
//! ```
//!
//! The second moment is accumulated relative to the voxel's own value,
//! `X[v]² + Σ_u w·(X[u]² - X[v]²) / Σ_u w`, so a uniform neighbourhood
//! returns its value exactly.
//!
//! The voxel's weight against itself is the largest weight among its other
//! candidates. When every weight underflows to zero the original value is
//! kept and the voxel is counted in [`DenoiseReport::underflow_voxels`].
//!
//! Exact mode compares patches directly and splits the output into chunks
//! across rayon workers. Fast mode walks one half of the search window, turns
//! every offset into a weight volume via an integral volume, and applies each
//! weight to both voxels of the pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rayon::prelude::*;

use crate::config::NlmConfig;
use crate::error::{NlmError, Result};
use crate::intensity::Intensity;
use crate::noise_estimation::estimate_volume_noise_scale;
use crate::patch::{clipped_half_widths, neighborhood_len, Geometry, Neighborhood, PatchIndexer};
use crate::rician::rician_correct;
use crate::similarity::{patch_distance, ShiftedWeights, SimilarityKernel};
use crate::volume::{to_float_volume, VolumeLayout};

/// Minimum chunk length for Rayon parallel iteration.
const RAYON_MIN_CHUNK_LEN: usize = 64;

/// Target number of chunks per Rayon worker in exact mode.
const CHUNKS_PER_THREAD: usize = 16;

const F64_BYTES: usize = std::mem::size_of::<f64>();
const ISIZE_BYTES: usize = std::mem::size_of::<isize>();

/// Summary of one denoising run.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseReport {
    /// Noise scale used (supplied or estimated).
    pub sigma: f64,
    /// Smoothing bandwidth used.
    pub h: f64,
    pub fast_mode: bool,
    /// Voxels whose weights all underflowed and kept their input value.
    pub underflow_voxels: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct DenoiseOutput {
    pub volume: ArrayD<f64>,
    pub report: DenoiseReport,
}

/// Read-only state shared by all workers of one run.
struct Problem<'a> {
    data: &'a [f64],
    channels: usize,
    geom: &'a Geometry,
    indexer: &'a PatchIndexer,
    kernel: SimilarityKernel,
    sigma: f64,
}

/// Reusable denoiser with an optional cooperative cancel flag.
#[derive(Debug, Clone)]
pub struct DenoiseEngine {
    config: NlmConfig,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl DenoiseEngine {
    /// # Errors
    ///
    /// `InvalidParameter` when `config` does not validate.
    pub fn new(config: NlmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel_flag: None,
        })
    }

    /// Poll `flag` during the run; once it is set the run stops with
    /// [`NlmError::Cancelled`].
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }

    /// Denoise `volume`, returning an `f64` volume of identical shape.
    pub fn denoise<T: Intensity>(&self, volume: ArrayViewD<T>) -> Result<DenoiseOutput> {
        let started = Instant::now();
        let config = &self.config;
        let shape = volume.shape().to_vec();

        let layout = VolumeLayout::new(&shape, config.multichannel, config.patch_distance)?;
        if let Some(limit) = config.memory_limit_bytes {
            let required = estimate_memory_bytes(&shape, config);
            if required > limit {
                return Err(NlmError::MemoryLimitExceeded { required, limit });
            }
        }

        let converted = to_float_volume(volume, config.preserve_range)?;
        let sigma = match config.sigma {
            Some(sigma) => sigma,
            None => estimate_volume_noise_scale(converted.view())?,
        };
        let h = config.resolve_h(sigma)?;
        let kernel = SimilarityKernel::new(sigma, h)?;

        log::info!(
            "Rician NLM: shape={:?}, channels={}, patch_size={}, patch_distance={}, sigma={:.6}, h={:.6}, mode={}",
            shape,
            layout.channels(),
            config.patch_size,
            config.patch_distance,
            sigma,
            h,
            if config.fast_mode { "fast" } else { "exact" }
        );

        let data = converted.into_raw_vec();
        let indexer = PatchIndexer::for_shape(
            layout.geometry().shape(),
            config.patch_size,
            config.patch_distance,
        )?;
        let problem = Problem {
            data: &data,
            channels: layout.channels(),
            geom: layout.geometry(),
            indexer: &indexer,
            kernel,
            sigma,
        };

        let (output, underflow_voxels) = if config.fast_mode {
            if config.gaussian_patch {
                log::warn!("gaussian_patch is ignored in fast mode; using uniform patch weights");
            }
            self.run_fast(&problem)?
        } else {
            let patch_weights = if config.gaussian_patch {
                indexer.patch().gaussian_weights()
            } else {
                vec![1.0; indexer.patch().len()]
            };
            self.run_exact(&problem, &patch_weights)?
        };

        if underflow_voxels > 0 {
            log::debug!(
                "{} of {} voxels had all weights underflow; kept input values",
                underflow_voxels,
                layout.geometry().len()
            );
        }

        let volume = ArrayD::from_shape_vec(IxDyn(&shape), output)
            .map_err(|e| NlmError::InvalidInput(format!("output layout: {}", e)))?;
        let elapsed = started.elapsed();
        log::debug!("Rician NLM finished in {:.3?}", elapsed);

        Ok(DenoiseOutput {
            volume,
            report: DenoiseReport {
                sigma,
                h,
                fast_mode: config.fast_mode,
                underflow_voxels,
                elapsed,
            },
        })
    }

    /// Direct patch comparison for every (voxel, candidate) pair.
    fn run_exact(&self, problem: &Problem, patch_weights: &[f64]) -> Result<(Vec<f64>, usize)> {
        let channels = problem.channels;
        let total = problem.geom.len();
        let mut output = vec![0.0; total * channels];

        let workers = rayon::current_num_threads().max(1);
        let chunk_len = total
            .div_ceil(workers * CHUNKS_PER_THREAD)
            .max(RAYON_MIN_CHUNK_LEN);

        let underflow = output
            .par_chunks_mut(chunk_len * channels)
            .enumerate()
            .map(|(chunk_idx, out_chunk)| -> Result<usize> {
                if self.is_cancelled() {
                    return Err(NlmError::Cancelled);
                }
                let ndim = problem.geom.ndim();
                let mut coords = vec![0usize; ndim];
                let mut candidate = vec![0usize; ndim];
                let mut moment = vec![0.0; channels];
                let mut underflow = 0;

                let start = chunk_idx * chunk_len;
                for (i, out) in out_chunk.chunks_mut(channels).enumerate() {
                    let v = start + i;
                    problem.geom.coords_of(v, &mut coords);
                    let kept = denoise_voxel_exact(
                        problem,
                        patch_weights,
                        v,
                        &coords,
                        &mut candidate,
                        &mut moment,
                        out,
                    );
                    if !kept {
                        underflow += 1;
                    }
                }
                Ok(underflow)
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))?;

        Ok((output, underflow))
    }

    /// Running-sum distances, one search offset pair `{s, -s}` at a time.
    fn run_fast(&self, problem: &Problem) -> Result<(Vec<f64>, usize)> {
        let channels = problem.channels;
        let geom = problem.geom;
        let total = geom.len();
        let data = problem.data;
        let patch_half_widths = problem.indexer.patch().half_widths();

        let mut acc_weight = vec![0.0; total];
        let mut acc_max = vec![0.0f64; total];
        let mut acc_moment = vec![0.0; total * channels];
        let mut shifted = ShiftedWeights::new(geom.shape());

        for offset in problem.indexer.search_window().positive_half() {
            if self.is_cancelled() {
                return Err(NlmError::Cancelled);
            }
            shifted.compute(data, channels, geom, offset, patch_half_widths, &problem.kernel)?;
            let weights = shifted.weights();
            let step = geom.flat_offset(offset);

            acc_weight
                .par_iter_mut()
                .zip(acc_max.par_iter_mut())
                .zip(acc_moment.par_chunks_mut(channels))
                .enumerate()
                .for_each(|(v, ((wsum, wmax), moment))| {
                    let own = &data[v * channels..(v + 1) * channels];
                    // Pair (v, v + s): weight stored at v.
                    let forward = weights[v];
                    if forward > 0.0 {
                        let u = (v as isize + step) as usize;
                        accumulate(data, channels, own, u, forward, wsum, wmax, moment);
                    }
                    // Pair (v - s, v): weight stored at v - s.
                    let back = v as isize - step;
                    if back >= 0 && (back as usize) < total {
                        let u = back as usize;
                        let backward = weights[u];
                        if backward > 0.0 {
                            accumulate(data, channels, own, u, backward, wsum, wmax, moment);
                        }
                    }
                });
        }

        let mut output = vec![0.0; total * channels];
        let underflow = output
            .par_chunks_mut(channels)
            .zip(acc_moment.par_chunks(channels))
            .enumerate()
            .map(|(v, (out, moment))| {
                let self_weight = acc_max[v];
                let wsum = acc_weight[v] + self_weight;
                let own = &data[v * channels..(v + 1) * channels];
                finalize_voxel(own, moment, wsum, problem.sigma, out)
            })
            .filter(|&kept| !kept)
            .count();

        Ok((output, underflow))
    }
}

/// Add candidate `u` to the centred second moment of the voxel whose
/// samples are `own`.
#[allow(clippy::too_many_arguments)]
#[inline]
fn accumulate(
    data: &[f64],
    channels: usize,
    own: &[f64],
    u: usize,
    weight: f64,
    wsum: &mut f64,
    wmax: &mut f64,
    moment: &mut [f64],
) {
    *wsum += weight;
    if weight > *wmax {
        *wmax = weight;
    }
    let candidate = &data[u * channels..(u + 1) * channels];
    for ((m, &x), &o) in moment.iter_mut().zip(candidate).zip(own) {
        *m += weight * (x * x - o * o);
    }
}

/// Write the corrected estimate for one voxel, or its input when all weights
/// underflowed. Returns `false` in the latter case.
///
/// `wsum` includes the self weight, whose centred contribution is zero.
#[inline]
fn finalize_voxel(own: &[f64], moment: &[f64], wsum: f64, sigma: f64, out: &mut [f64]) -> bool {
    if wsum > 0.0 {
        for ((o, &m), &x) in out.iter_mut().zip(moment).zip(own) {
            *o = rician_correct(x * x + m / wsum, sigma);
        }
        true
    } else {
        out.copy_from_slice(own);
        false
    }
}

#[allow(clippy::too_many_arguments)]
fn denoise_voxel_exact(
    problem: &Problem,
    patch_weights: &[f64],
    v: usize,
    coords: &[usize],
    candidate: &mut [usize],
    moment: &mut [f64],
    out: &mut [f64],
) -> bool {
    let channels = problem.channels;
    let data = problem.data;
    let own = &data[v * channels..(v + 1) * channels];
    let search: &Neighborhood = problem.indexer.search_window();
    let center = search.center_index();

    moment.fill(0.0);
    let mut wsum = 0.0;
    let mut wmax = 0.0f64;

    for (index, offset) in search.iter().enumerate() {
        if index == center {
            continue;
        }
        let Some(u) = problem.geom.shifted(coords, offset) else {
            continue;
        };
        for ((c, &base), &o) in candidate.iter_mut().zip(coords).zip(offset) {
            *c = (base as isize + o) as usize;
        }
        let distance = patch_distance(
            data,
            channels,
            problem.geom,
            coords,
            candidate,
            problem.indexer.patch(),
            patch_weights,
        );
        let weight = problem.kernel.weight(distance);
        if weight > 0.0 {
            accumulate(data, channels, own, u, weight, &mut wsum, &mut wmax, moment);
        }
    }

    finalize_voxel(own, moment, wsum + wmax, problem.sigma, out)
}

/// Predicted peak working memory of a run, in bytes.
///
/// Exact mode holds the converted input, the output and the patch weights.
/// Fast mode adds a moment accumulator, three per-voxel scalars (weight sum,
/// weight maximum, shifted weights), the difference volume and its
/// summed-area table. Both modes hold the patch and search offset tables,
/// capped to the volume extent.
pub fn estimate_memory_bytes(shape: &[usize], config: &NlmConfig) -> usize {
    let (spatial, channels): (&[usize], usize) = if config.multichannel && shape.len() >= 2 {
        (&shape[..shape.len() - 1], shape[shape.len() - 1])
    } else {
        (shape, 1)
    };
    let positions = spatial
        .iter()
        .fold(1usize, |acc, &n| acc.saturating_mul(n));
    let samples = positions.saturating_mul(channels);

    let patch_len = neighborhood_len(&clipped_half_widths(config.patch_size, spatial))
        .unwrap_or(usize::MAX);
    let search_len = neighborhood_len(&clipped_half_widths(config.patch_distance, spatial))
        .unwrap_or(usize::MAX);
    let offset_tables = patch_len
        .saturating_add(search_len)
        .saturating_mul(spatial.len())
        .saturating_mul(ISIZE_BYTES);

    let values = if config.fast_mode {
        let table = spatial
            .iter()
            .fold(1usize, |acc, &n| acc.saturating_mul(n.saturating_add(1)));
        samples
            .saturating_mul(3)
            .saturating_add(positions.saturating_mul(4))
            .saturating_add(table)
    } else {
        samples.saturating_mul(2).saturating_add(patch_len)
    };
    values.saturating_mul(F64_BYTES).saturating_add(offset_tables)
}

/// Denoise `volume` with Rician non-local means.
///
/// Convenience wrapper around [`DenoiseEngine`] that drops the run report.
///
/// # Example
///
/// ```
/// use ndarray::ArrayD;
/// use rician_nlm_core::{rician_denoise_nl_means, NlmConfig};
///
/// let volume = ArrayD::<f64>::from_elem(vec![16, 16, 16], 2.0);
/// let config = NlmConfig::new().with_sigma(0.0).with_h(0.5);
/// let denoised = rician_denoise_nl_means(volume.view(), &config).unwrap();
/// assert_eq!(denoised.shape(), volume.shape());
/// ```
pub fn rician_denoise_nl_means<T: Intensity>(
    volume: ArrayViewD<T>,
    config: &NlmConfig,
) -> Result<ArrayD<f64>> {
    let engine = DenoiseEngine::new(config.clone())?;
    engine.denoise(volume).map(|output| output.volume)
}

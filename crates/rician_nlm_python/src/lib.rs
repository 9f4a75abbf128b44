//! PyO3 Python bindings for Rician non-local means.
//!
//! This crate provides thin Python bindings for the rician_nlm_core library.
//! All algorithm logic is in rician_nlm_core; this crate only handles
//! Python/NumPy type conversions and releases the GIL while filtering.

use numpy::{PyArrayDyn, PyReadonlyArrayDyn, ToPyArray};
use pyo3::exceptions::{PyTypeError, PyValueError};
use pyo3::prelude::*;

use rician_nlm_core::{estimate_volume_noise_scale, rician_denoise_nl_means, NlmConfig, NlmError};

fn to_py_err(err: NlmError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn non_negative(name: &str, value: i64) -> PyResult<usize> {
    usize::try_from(value).map_err(|_| {
        to_py_err(NlmError::InvalidParameter(format!(
            "{} must be >= 0, got {}",
            name, value
        )))
    })
}

const SUPPORTED_DTYPES: &str = "float64, float32, uint8, uint16, int16 or int32";

/// Estimate the noise scale of an array flattened in C order.
///
/// Accepts the same dtypes as `rician_denoise_nl_means`; samples are read at
/// their stored values.
#[pyfunction]
pub fn rician_estimate(py: Python<'_>, image: &PyAny) -> PyResult<f64> {
    macro_rules! estimate_as {
        ($($t:ty),*) => {
            $(
                if let Ok(array) = image.extract::<PyReadonlyArrayDyn<$t>>() {
                    log::debug!("rician_estimate on {} array", stringify!($t));
                    let volume = array.as_array().to_owned();
                    return py
                        .allow_threads(move || estimate_volume_noise_scale(volume.view()))
                        .map_err(to_py_err);
                }
            )*
        };
    }

    estimate_as!(f64, f32, u8, u16, i16, i32);

    Err(PyTypeError::new_err(format!(
        "image must be a numpy array of {}",
        SUPPORTED_DTYPES
    )))
}

/// Denoise an image or volume with Rician non-local means.
///
/// Accepts float64, float32, uint8, uint16, int16 and int32 arrays and
/// returns a float64 array of the same shape.
#[pyfunction]
#[pyo3(name = "rician_denoise_nl_means")]
#[pyo3(signature = (
    image,
    patch_size = 2,
    patch_distance = 6,
    h = None,
    sigma = None,
    fast_mode = true,
    multichannel = false,
    preserve_range = true,
    gaussian_patch = false
))]
#[allow(clippy::too_many_arguments)]
pub fn rician_denoise_nl_means_py<'py>(
    py: Python<'py>,
    image: &'py PyAny,
    patch_size: i64,
    patch_distance: i64,
    h: Option<f64>,
    sigma: Option<f64>,
    fast_mode: bool,
    multichannel: bool,
    preserve_range: bool,
    gaussian_patch: bool,
) -> PyResult<&'py PyArrayDyn<f64>> {
    let config = NlmConfig {
        patch_size: non_negative("patch_size", patch_size)?,
        patch_distance: non_negative("patch_distance", patch_distance)?,
        h,
        sigma,
        fast_mode,
        multichannel,
        preserve_range,
        gaussian_patch,
        memory_limit_bytes: None,
    };
    config.validate().map_err(to_py_err)?;

    macro_rules! denoise_as {
        ($($t:ty),*) => {
            $(
                if let Ok(array) = image.extract::<PyReadonlyArrayDyn<$t>>() {
                    log::debug!("rician_denoise_nl_means on {} array", stringify!($t));
                    let volume = array.as_array().to_owned();
                    let output = py
                        .allow_threads(move || rician_denoise_nl_means(volume.view(), &config))
                        .map_err(to_py_err)?;
                    return Ok(output.to_pyarray(py));
                }
            )*
        };
    }

    denoise_as!(f64, f32, u8, u16, i16, i32);

    Err(PyTypeError::new_err(format!(
        "image must be a numpy array of {}",
        SUPPORTED_DTYPES
    )))
}

/// Rician NLM Rust accelerator module
#[pymodule]
fn rician_nlm(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(rician_estimate, m)?)?;
    m.add_function(wrap_pyfunction!(rician_denoise_nl_means_py, m)?)?;
    Ok(())
}

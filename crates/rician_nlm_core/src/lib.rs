//! Rician Non-Local Means Core Library
//!
//! Pure Rust implementation of non-local means denoising for magnitude-valued
//! volumes, where the noise follows a Rician rather than a Gaussian law, plus
//! the pseudo-residual noise estimator that parameterizes it. Volumes of any
//! dimensionality are supported. This crate contains all algorithm logic
//! without Python bindings.

pub mod config;
pub mod engine;
pub mod error;
pub mod intensity;
pub mod noise_estimation;
pub mod patch;
pub mod phantom;
pub mod rician;
pub mod similarity;
pub mod volume;

// Re-export commonly used types at the crate root
pub use config::NlmConfig;
pub use engine::{
    estimate_memory_bytes, rician_denoise_nl_means, DenoiseEngine, DenoiseOutput, DenoiseReport,
};
pub use error::{NlmError, Result};
pub use intensity::Intensity;
pub use noise_estimation::{
    estimate_noise_scale, estimate_noise_scale_at, estimate_volume_noise_scale,
};
pub use patch::{Geometry, Neighborhood, PatchIndexer};
pub use rician::rician_correct;
pub use similarity::{IntegralVolume, SimilarityKernel};

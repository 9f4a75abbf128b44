use crate::error::{NlmError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default patch half-width (5-wide patches)
pub const DEFAULT_PATCH_SIZE: usize = 2;

/// Default search window half-width (13-wide window)
pub const DEFAULT_PATCH_DISTANCE: usize = 6;

/// Bandwidth used when `h` is not given, as a multiple of sigma
pub const H_SIGMA_FACTOR: f64 = 1.15;

/// Default execution mode (running-sum distances)
pub const DEFAULT_FAST_MODE: bool = true;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for Rician non-local means.
///
/// `None` for `h` or `sigma` means "derive from the data": sigma is estimated
/// from the converted volume and `h` defaults to `1.15 × sigma`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NlmConfig {
    /// Patch half-width. Default: 2
    pub patch_size: usize,
    /// Search window half-width. Default: 6
    pub patch_distance: usize,
    /// Smoothing bandwidth. Default: 1.15 × sigma
    pub h: Option<f64>,
    /// Noise scale. Default: estimated
    pub sigma: Option<f64>,
    /// Integral-volume distances instead of direct patch comparison. Default: true
    pub fast_mode: bool,
    /// Last axis holds channels sharing one weight field. Default: false
    pub multichannel: bool,
    /// Keep input intensities instead of remapping to [0, 1]. Default: true
    pub preserve_range: bool,
    /// Center-weighted patch kernel (exact mode only). Default: false
    pub gaussian_patch: bool,
    /// Refuse runs predicted to need more working memory. Default: unlimited
    pub memory_limit_bytes: Option<usize>,
}

impl Default for NlmConfig {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            patch_distance: DEFAULT_PATCH_DISTANCE,
            h: None,
            sigma: None,
            fast_mode: DEFAULT_FAST_MODE,
            multichannel: false,
            preserve_range: true,
            gaussian_patch: false,
            memory_limit_bytes: None,
        }
    }
}

impl NlmConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patch_size(mut self, patch_size: usize) -> Self {
        self.patch_size = patch_size;
        self
    }

    pub fn with_patch_distance(mut self, patch_distance: usize) -> Self {
        self.patch_distance = patch_distance;
        self
    }

    pub fn with_h(mut self, h: f64) -> Self {
        self.h = Some(h);
        self
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = Some(sigma);
        self
    }

    pub fn with_fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    pub fn with_multichannel(mut self, multichannel: bool) -> Self {
        self.multichannel = multichannel;
        self
    }

    pub fn with_preserve_range(mut self, preserve_range: bool) -> Self {
        self.preserve_range = preserve_range;
        self
    }

    pub fn with_gaussian_patch(mut self, gaussian_patch: bool) -> Self {
        self.gaussian_patch = gaussian_patch;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.patch_distance == 0 {
            return Err(NlmError::InvalidParameter(
                "patch_distance must be > 0".to_string(),
            ));
        }
        if let Some(h) = self.h {
            if !h.is_finite() || h <= 0.0 {
                return Err(NlmError::InvalidParameter(format!(
                    "h must be finite and > 0, got {}",
                    h
                )));
            }
        }
        if let Some(sigma) = self.sigma {
            if !sigma.is_finite() || sigma < 0.0 {
                return Err(NlmError::InvalidParameter(format!(
                    "sigma must be finite and >= 0, got {}",
                    sigma
                )));
            }
        }
        Ok(())
    }

    /// Bandwidth for a run with noise scale `sigma`.
    ///
    /// Fails when no `h` was given and `1.15 × sigma` is not positive, i.e.
    /// on noiseless data without an explicit bandwidth.
    pub fn resolve_h(&self, sigma: f64) -> Result<f64> {
        let h = self.h.unwrap_or(H_SIGMA_FACTOR * sigma);
        if !h.is_finite() || h <= 0.0 {
            return Err(NlmError::InvalidParameter(format!(
                "h must be > 0, got {} (sigma = {}); supply h explicitly for noiseless data",
                h, sigma
            )));
        }
        Ok(h)
    }
}

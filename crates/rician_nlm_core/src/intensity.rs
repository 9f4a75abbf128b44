//! Element types accepted at the volume boundary.
//!
//! The engine works in `f64` only. This trait enumerates the sample types a
//! caller may hand in and how each one maps to `f64`, either keeping its
//! numeric value or remapping it onto the canonical `[0, 1]` range.

use std::fmt::Debug;

/// Scalar intensity type that can be fed to the denoiser.
pub trait Intensity: Copy + Debug + Send + Sync + 'static {
    /// Whether `to_unit` already yields values in `[0, 1]`.
    ///
    /// Integer types are remapped by their type range; floating point
    /// types carry no intrinsic range and are rescaled from the data.
    const HAS_TYPE_RANGE: bool;

    /// Value converted to `f64` unchanged.
    fn to_f64(self) -> f64;

    /// Value remapped onto `[0, 1]` by the type range.
    ///
    /// For floating point types this is the identity.
    fn to_unit(self) -> f64;
}

macro_rules! impl_unsigned_intensity {
    ($($t:ty),*) => {
        $(
            impl Intensity for $t {
                const HAS_TYPE_RANGE: bool = true;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn to_unit(self) -> f64 {
                    self as f64 / <$t>::MAX as f64
                }
            }
        )*
    };
}

macro_rules! impl_signed_intensity {
    ($($t:ty),*) => {
        $(
            impl Intensity for $t {
                const HAS_TYPE_RANGE: bool = true;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn to_unit(self) -> f64 {
                    let min = <$t>::MIN as f64;
                    let max = <$t>::MAX as f64;
                    (self as f64 - min) / (max - min)
                }
            }
        )*
    };
}

impl_unsigned_intensity!(u8, u16, u32);
impl_signed_intensity!(i8, i16, i32);

impl Intensity for f32 {
    const HAS_TYPE_RANGE: bool = false;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn to_unit(self) -> f64 {
        self as f64
    }
}

impl Intensity for f64 {
    const HAS_TYPE_RANGE: bool = false;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn to_unit(self) -> f64 {
        self
    }
}

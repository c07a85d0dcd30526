//! Offline loudness DSP
//!
//! Normalizes decoded buffers to a target integrated loudness (BS.1770 gated
//! LUFS) while holding an oversampled true-peak ceiling. Everything in this
//! module is synchronous; the cache invokes it on a blocking thread during
//! buffer load.

pub mod kweighting;
pub mod limiter;
pub mod loudness;
pub mod normalizer;
pub mod resample;
pub mod true_peak;

pub use limiter::{limit_true_peak, LimiterSettings};
pub use loudness::measure_integrated_lufs;
pub use normalizer::{LoudnessNormalizer, NormalizerSettings};
pub use resample::MEASUREMENT_SAMPLE_RATE;
pub use true_peak::measure_true_peak_db;

use thiserror::Error;

/// DSP kernel failure modes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    /// Input buffer contains no frames
    #[error("buffer contains no frames")]
    EmptyBuffer,

    /// Buffer is not float32 non-interleaved with equal channel lengths
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Resampler construction failed
    #[error("converter initialization failed: {0}")]
    ConverterInitFailed(String),

    /// Resampler processing failed
    #[error("conversion failed: {0}")]
    ConversionFailed(String),
}

/// Convert decibels to a linear gain factor
#[inline]
pub fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Convert a linear gain factor to decibels
#[inline]
pub fn linear_to_db(linear: f64) -> f64 {
    20.0 * linear.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_linear_round_trip() {
        for db in [-24.0, -6.0, 0.0, 6.0, 12.0] {
            let back = linear_to_db(db_to_linear(db));
            assert!((db - back).abs() < 1e-9, "round trip failed for {} dB", db);
        }
    }

    #[test]
    fn unity_and_doubling() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-12);
        assert!((db_to_linear(20.0) - 10.0).abs() < 1e-9);
        assert!((linear_to_db(2.0) - 6.0206).abs() < 0.001);
    }
}

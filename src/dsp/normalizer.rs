//! Iterative loudness normalization
//!
//! Resamples to the measurement rate, then loops measure → gain → limit until
//! the integrated loudness is within tolerance of the target and the true
//! peak respects the ceiling, or the iteration budget runs out. Limiting can
//! eat programmed gain, which is why a single pass is not always enough.

use tracing::{debug, info};

use crate::types::DecodedBuffer;

use super::limiter::{limit_true_peak, LimiterSettings};
use super::loudness::measure_integrated_lufs;
use super::resample::{to_measurement_rate, MEASUREMENT_SAMPLE_RATE};
use super::true_peak::measure_true_peak_db;
use super::{db_to_linear, DspError};

/// Normalization targets and iteration budget
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalizerSettings {
    /// Target integrated loudness (LUFS)
    pub target_lufs: f64,
    /// True-peak ceiling (dBTP)
    pub max_true_peak_db: f64,
    /// Measure→gain→limit iterations before giving up
    pub max_iterations: usize,
    /// Acceptable loudness miss (LU)
    pub tolerance_lu: f64,
    /// Limiter dynamics
    pub attack_secs: f64,
    pub release_secs: f64,
    pub lookahead_secs: f64,
    pub oversample_factor: usize,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            target_lufs: -16.0,
            max_true_peak_db: -1.0,
            max_iterations: 3,
            tolerance_lu: 0.1,
            attack_secs: 0.0005,
            release_secs: 0.05,
            lookahead_secs: 0.001,
            oversample_factor: 4,
        }
    }
}

/// Offline loudness normalizer
#[derive(Debug, Clone, Default)]
pub struct LoudnessNormalizer {
    settings: NormalizerSettings,
}

impl LoudnessNormalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &NormalizerSettings {
        &self.settings
    }

    /// Produce a new buffer at the measurement rate, approximately at the
    /// target loudness and under the true-peak ceiling.
    pub fn normalize(&self, buffer: &DecodedBuffer) -> Result<DecodedBuffer, DspError> {
        if buffer.is_empty() {
            return Err(DspError::EmptyBuffer);
        }
        let frames = buffer.channels[0].len();
        if buffer.channels.iter().any(|c| c.len() != frames) {
            return Err(DspError::UnsupportedFormat(
                "channel lengths differ".to_string(),
            ));
        }

        let s = &self.settings;
        let limiter = LimiterSettings {
            ceiling_db: s.max_true_peak_db,
            attack_secs: s.attack_secs,
            release_secs: s.release_secs,
            lookahead_secs: s.lookahead_secs,
            oversample_factor: s.oversample_factor,
        };

        let mut channels = to_measurement_rate(&buffer.channels, buffer.sample_rate)?;

        for iteration in 0..s.max_iterations.max(1) {
            let measured = measure_integrated_lufs(&channels, MEASUREMENT_SAMPLE_RATE);
            if !measured.is_finite() {
                // silence: nothing to normalize
                debug!("measured -inf LUFS, leaving buffer untouched");
                break;
            }

            let gain_db = s.target_lufs - measured;
            let gain = db_to_linear(gain_db) as f32;
            for ch in channels.iter_mut() {
                for x in ch.iter_mut() {
                    *x *= gain;
                }
            }

            limit_true_peak(&mut channels, MEASUREMENT_SAMPLE_RATE, &limiter)?;

            let after = measure_integrated_lufs(&channels, MEASUREMENT_SAMPLE_RATE);
            let peak = measure_true_peak_db(&channels, s.oversample_factor);
            debug!(
                "normalize iteration {}: {:.2} LUFS (gain {:+.2} dB) -> {:.2} LUFS, {:.2} dBTP",
                iteration, measured, gain_db, after, peak
            );

            if (after - s.target_lufs).abs() <= s.tolerance_lu
                && peak <= s.max_true_peak_db + 0.1
            {
                info!(
                    "normalized to {:.2} LUFS / {:.2} dBTP in {} iteration(s)",
                    after,
                    peak,
                    iteration + 1
                );
                break;
            }
        }

        Ok(DecodedBuffer::new(channels, MEASUREMENT_SAMPLE_RATE))
    }
}

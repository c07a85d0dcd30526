//! Sample-rate conversion for loudness measurement
//!
//! Converts planar float32 audio to the 44.1 kHz measurement rate using
//! rubato. Whole buffers are processed in one chunk; this is offline work,
//! not a streaming path.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use super::DspError;

/// Rate all loudness measurement and normalization runs at
pub const MEASUREMENT_SAMPLE_RATE: u32 = 44100;

/// Resample planar audio to `output_rate`.
///
/// Returns a copy when the rates already match. Channel vectors must have
/// equal lengths.
pub fn resample_planar(
    input: &[Vec<f32>],
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<Vec<f32>>, DspError> {
    if input.is_empty() || input[0].is_empty() {
        return Err(DspError::EmptyBuffer);
    }
    let frames = input[0].len();
    if input.iter().any(|c| c.len() != frames) {
        return Err(DspError::UnsupportedFormat(
            "channel lengths differ".to_string(),
        ));
    }

    if input_rate == output_rate {
        return Ok(input.to_vec());
    }

    debug!(
        "resampling {} frames from {}Hz to {}Hz ({} channels)",
        frames,
        input_rate,
        output_rate,
        input.len()
    );

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        frames,
        input.len(),
    )
    .map_err(|e| DspError::ConverterInitFailed(e.to_string()))?;

    let output = resampler
        .process(input, None)
        .map_err(|e| DspError::ConversionFailed(e.to_string()))?;

    Ok(output)
}

/// Resample to the measurement rate (44.1 kHz)
pub fn to_measurement_rate(input: &[Vec<f32>], input_rate: u32) -> Result<Vec<Vec<f32>>, DspError> {
    resample_planar(input, input_rate, MEASUREMENT_SAMPLE_RATE)
}

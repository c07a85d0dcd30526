//! Gated integrated loudness (BS.1770)
//!
//! 400 ms blocks at 75 % overlap, per-channel weighting, absolute gate at
//! −70 LUFS and relative gate at 10 LU below the ungated mean. Signals
//! shorter than one gating window fall back to the ungated whole-signal mean.

use super::kweighting::KWeightingFilter;

/// Gating block length in seconds
const BLOCK_SECS: f64 = 0.4;
/// Gating block step (75 % overlap)
const STEP_SECS: f64 = 0.1;
/// Absolute gate threshold (LUFS)
const ABSOLUTE_GATE_LUFS: f64 = -70.0;
/// Relative gate offset below the ungated mean (LU)
const RELATIVE_GATE_LU: f64 = 10.0;
/// Energy → loudness calibration offset
const LOUDNESS_OFFSET: f64 = -0.691;

/// Per-channel weights: L, R, C full weight, surrounds +1.5 dB, LFE excluded.
///
/// Layouts follow the usual ordering for each channel count; channels past
/// the known layouts weigh 1.0.
fn channel_weights(count: usize) -> Vec<f64> {
    match count {
        1 => vec![1.0],
        2 => vec![1.0, 1.0],
        3 => vec![1.0, 1.0, 1.0],
        4 => vec![1.0, 1.0, 1.41, 1.41],
        5 => vec![1.0, 1.0, 1.0, 1.41, 1.41],
        6 => vec![1.0, 1.0, 1.0, 0.0, 1.41, 1.41],
        n => {
            let mut w = vec![1.0, 1.0, 1.0, 0.0, 1.41, 1.41];
            w.resize(n, 1.0);
            w
        }
    }
}

fn energy_to_lufs(energy: f64) -> f64 {
    if energy <= 0.0 {
        return f64::NEG_INFINITY;
    }
    LOUDNESS_OFFSET + 10.0 * energy.log10()
}

/// Measure integrated loudness of planar float32 audio.
///
/// Returns LUFS, or −∞ for silence and for signals where no gating block
/// survives the absolute gate.
pub fn measure_integrated_lufs(channels: &[Vec<f32>], sample_rate: u32) -> f64 {
    if channels.is_empty() || channels[0].is_empty() || sample_rate == 0 {
        return f64::NEG_INFINITY;
    }

    let weights = channel_weights(channels.len());
    let filter = KWeightingFilter::new(sample_rate);

    // K-weight, then prefix-sum squared samples per channel so block energies
    // are O(1) lookups
    let frames = channels[0].len();
    let mut prefix: Vec<Vec<f64>> = Vec::with_capacity(channels.len());
    for ch in channels {
        let weighted = filter.filter(ch);
        let mut sums = Vec::with_capacity(frames + 1);
        let mut acc = 0.0f64;
        sums.push(0.0);
        for &x in &weighted {
            acc += (x as f64) * (x as f64);
            sums.push(acc);
        }
        prefix.push(sums);
    }

    let mean_square = |ch: usize, start: usize, end: usize| -> f64 {
        (prefix[ch][end] - prefix[ch][start]) / (end - start) as f64
    };

    let block_energy = |start: usize, end: usize| -> f64 {
        weights
            .iter()
            .enumerate()
            .map(|(ch, w)| w * mean_square(ch, start, end))
            .sum()
    };

    let window = (BLOCK_SECS * sample_rate as f64).round() as usize;
    let step = (STEP_SECS * sample_rate as f64).round() as usize;

    // Shorter than one gating window: ungated whole-signal mean
    if frames < window {
        return energy_to_lufs(block_energy(0, frames));
    }

    let block_count = (frames - window) / step + 1;
    let mut gated: Vec<f64> = Vec::with_capacity(block_count);
    for j in 0..block_count {
        let start = j * step;
        let energy = block_energy(start, start + window);
        if energy_to_lufs(energy) > ABSOLUTE_GATE_LUFS {
            gated.push(energy);
        }
    }

    if gated.is_empty() {
        return f64::NEG_INFINITY;
    }

    let ungated_mean = gated.iter().sum::<f64>() / gated.len() as f64;
    let relative_threshold = energy_to_lufs(ungated_mean) - RELATIVE_GATE_LU;

    let surviving: Vec<f64> = gated
        .into_iter()
        .filter(|&e| energy_to_lufs(e) > relative_threshold)
        .collect();
    if surviving.is_empty() {
        return f64::NEG_INFINITY;
    }

    energy_to_lufs(surviving.iter().sum::<f64>() / surviving.len() as f64)
}

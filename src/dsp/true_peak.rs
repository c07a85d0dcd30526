//! Oversampled true-peak metering
//!
//! Approximates inter-sample peaks by 4× oversampling through a windowed-sinc
//! polyphase interpolator. The same prototype filter drives the matching
//! decimator so the limiter can round-trip a signal through the oversampled
//! domain with a known, compensated delay.

use std::f64::consts::PI;

use super::linear_to_db;

/// Default oversampling factor for true-peak work
pub const OVERSAMPLE_FACTOR: usize = 4;

/// Prototype taps per polyphase branch
const TAPS_PER_PHASE: usize = 12;
/// Lowpass cutoff as a fraction of the input Nyquist
const CUTOFF: f64 = 0.9;

/// Windowed-sinc interpolation prototype for factor `l`.
///
/// Tap count is `12·l + 1` so the center lands on an integer and the group
/// delay is exactly 6 input samples in every branch.
fn prototype(l: usize) -> Vec<f64> {
    let taps = TAPS_PER_PHASE * l + 1;
    let m = (taps - 1) as f64;
    let center = m / 2.0;
    (0..taps)
        .map(|n| {
            let t = (n as f64 - center) / l as f64;
            let sinc = if t.abs() < 1e-9 {
                CUTOFF
            } else {
                (PI * CUTOFF * t).sin() / (PI * t)
            };
            let w = 0.42 - 0.5 * (2.0 * PI * n as f64 / m).cos() + 0.08 * (4.0 * PI * n as f64 / m).cos();
            sinc * w
        })
        .collect()
}

/// Group delay of the interpolator in input samples
fn interp_delay(l: usize) -> usize {
    (TAPS_PER_PHASE * l) / (2 * l)
}

/// Oversample one channel by `factor` using polyphase interpolation.
///
/// Each branch is normalized to unity DC gain, so a constant signal stays
/// constant and sample-aligned outputs reproduce the input level.
pub fn oversample(channel: &[f32], factor: usize) -> Vec<f32> {
    if factor <= 1 || channel.is_empty() {
        return channel.to_vec();
    }
    let mut h = prototype(factor);
    for p in 0..factor {
        let sum: f64 = h.iter().skip(p).step_by(factor).sum();
        if sum.abs() > 1e-12 {
            for tap in h.iter_mut().skip(p).step_by(factor) {
                *tap /= sum;
            }
        }
    }

    let frames = channel.len();
    let mut out = vec![0.0f32; frames * factor];
    for p in 0..factor {
        let phase: Vec<f64> = h.iter().skip(p).step_by(factor).copied().collect();
        for i in 0..frames {
            let mut acc = 0.0f64;
            for (k, &tap) in phase.iter().enumerate() {
                if let Some(idx) = i.checked_sub(k) {
                    acc += tap * channel[idx] as f64;
                }
            }
            out[i * factor + p] = acc as f32;
        }
    }
    out
}

/// Decimate an oversampled channel back to the base rate.
///
/// `frames` is the original base-rate length; the combined interpolator +
/// decimator delay is compensated so the result is sample-aligned with the
/// pre-oversampling input.
pub fn downsample(oversampled: &[f32], factor: usize, frames: usize) -> Vec<f32> {
    if factor <= 1 {
        return oversampled.to_vec();
    }
    let h = prototype(factor);
    let sum: f64 = h.iter().sum();
    let h: Vec<f64> = h.iter().map(|&t| t / sum).collect();

    // interpolation delay + decimation filter delay, in oversampled samples
    let delay = 2 * interp_delay(factor) * factor;

    let sample_at = |n: isize| -> f64 {
        if n < 0 || n as usize >= oversampled.len() {
            0.0
        } else {
            oversampled[n as usize] as f64
        }
    };

    (0..frames)
        .map(|i| {
            let pos = (i * factor + delay) as isize;
            let mut acc = 0.0f64;
            for (j, &tap) in h.iter().enumerate() {
                acc += tap * sample_at(pos - j as isize);
            }
            acc as f32
        })
        .collect()
}

/// Linked true peak across channels as a linear value
pub fn measure_true_peak_linear(channels: &[Vec<f32>], factor: usize) -> f64 {
    let mut peak = 0.0f64;
    for ch in channels {
        for &x in &oversample(ch, factor) {
            let a = (x as f64).abs();
            if a > peak {
                peak = a;
            }
        }
    }
    peak
}

/// Linked true peak across channels in dBTP
pub fn measure_true_peak_db(channels: &[Vec<f32>], factor: usize) -> f64 {
    let peak = measure_true_peak_linear(channels, factor);
    if peak <= 0.0 {
        f64::NEG_INFINITY
    } else {
        linear_to_db(peak)
    }
}

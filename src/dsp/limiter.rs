//! Look-ahead true-peak limiter
//!
//! Operates in the 4× oversampled domain: a forward-max window (monotonic
//! deque) computes the gain needed to keep upcoming peaks under the ceiling,
//! a first-order attack/release smoother shapes that gain, and a final clamp
//! guarantees the ceiling regardless of smoothing. Channels are gain-linked.

use std::collections::VecDeque;

use tracing::debug;

use super::true_peak::{downsample, measure_true_peak_db, oversample};
use super::{db_to_linear, DspError};

/// Limiter tuning
#[derive(Debug, Clone, Copy)]
pub struct LimiterSettings {
    /// True-peak ceiling in dBTP
    pub ceiling_db: f64,
    /// Attack time constant in seconds
    pub attack_secs: f64,
    /// Release time constant in seconds
    pub release_secs: f64,
    /// Forward-look window in seconds
    pub lookahead_secs: f64,
    /// Oversampling factor for metering and gain application
    pub oversample_factor: usize,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            ceiling_db: -1.0,
            attack_secs: 0.0005,
            release_secs: 0.05,
            lookahead_secs: 0.001,
            oversample_factor: 4,
        }
    }
}

/// Limit `channels` in place so the oversampled true peak stays under the
/// ceiling. If the oversampling round trip reintroduces overshoot, a single
/// corrective pass runs on the result.
pub fn limit_true_peak(
    channels: &mut [Vec<f32>],
    sample_rate: u32,
    settings: &LimiterSettings,
) -> Result<(), DspError> {
    if channels.is_empty() || channels[0].is_empty() {
        return Err(DspError::EmptyBuffer);
    }

    limit_pass(channels, sample_rate, settings);

    // the decimation filter can ring a fraction of a dB above the ceiling
    let peak_db = measure_true_peak_db(channels, settings.oversample_factor);
    if peak_db > settings.ceiling_db + 0.05 {
        debug!(
            "limiter round trip overshoot ({:.2} dBTP > {:.2}), running corrective pass",
            peak_db, settings.ceiling_db
        );
        limit_pass(channels, sample_rate, settings);
    }
    Ok(())
}

fn limit_pass(channels: &mut [Vec<f32>], sample_rate: u32, settings: &LimiterSettings) {
    let factor = settings.oversample_factor.max(1);
    let frames = channels[0].len();
    let os_rate = sample_rate as f64 * factor as f64;

    let mut os_channels: Vec<Vec<f32>> = channels
        .iter()
        .map(|ch| oversample(ch, factor))
        .collect();
    let os_len = os_channels[0].len();

    // linked peak envelope
    let mut peak = vec![0.0f32; os_len];
    for ch in &os_channels {
        for (p, &x) in peak.iter_mut().zip(ch.iter()) {
            *p = p.max(x.abs());
        }
    }

    let ceiling = db_to_linear(settings.ceiling_db) as f32;
    let window = ((settings.lookahead_secs * os_rate).round() as usize).max(1);

    // forward max over [n, n+window) via monotonic deque of indices
    let mut deque: VecDeque<usize> = VecDeque::new();
    let mut push = |deque: &mut VecDeque<usize>, idx: usize| {
        while let Some(&back) = deque.back() {
            if peak[back] <= peak[idx] {
                deque.pop_back();
            } else {
                break;
            }
        }
        deque.push_back(idx);
    };
    for idx in 0..window.min(os_len) {
        push(&mut deque, idx);
    }

    let attack_coef = (-1.0 / (settings.attack_secs * os_rate)).exp() as f32;
    let release_coef = (-1.0 / (settings.release_secs * os_rate)).exp() as f32;

    let mut gain = 1.0f32;
    for n in 0..os_len {
        let future_peak = peak[*deque.front().expect("window never empty")].max(1e-12);
        let desired = (ceiling / future_peak).min(1.0);

        // fast attack toward reductions, slow release back to unity
        let coef = if desired < gain { attack_coef } else { release_coef };
        gain = coef * gain + (1.0 - coef) * desired;
        // hard guarantee: smoothing never lets a peak through
        gain = gain.min(desired);

        for ch in os_channels.iter_mut() {
            ch[n] *= gain;
        }

        // slide the window
        if deque.front() == Some(&n) {
            deque.pop_front();
        }
        let incoming = n + window;
        if incoming < os_len {
            push(&mut deque, incoming);
        }
    }

    for (ch, os) in channels.iter_mut().zip(os_channels.iter()) {
        *ch = downsample(os, factor, frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::true_peak::measure_true_peak_linear;

    fn sine(rate: u32, freq: f64, frames: usize, amplitude: f64) -> Vec<f32> {
        (0..frames)
            .map(|i| {
                ((2.0 * std::f64::consts::PI * freq * i as f64 / rate as f64).sin() * amplitude)
                    as f32
            })
            .collect()
    }

    #[test]
    fn holds_ceiling_on_hot_signal() {
        let mut channels = vec![sine(44100, 997.0, 44100, 0.99)];
        let settings = LimiterSettings::default();
        limit_true_peak(&mut channels, 44100, &settings).unwrap();
        let tp = measure_true_peak_db(&channels, 4);
        assert!(
            tp <= settings.ceiling_db + 0.1,
            "true peak {:.2} dBTP exceeds ceiling",
            tp
        );
    }

    #[test]
    fn quiet_signal_passes_through() {
        let original = sine(44100, 440.0, 22050, 0.25);
        let mut channels = vec![original.clone()];
        limit_true_peak(&mut channels, 44100, &LimiterSettings::default()).unwrap();
        // well under the ceiling: gain stays at unity, signal survives the
        // resampling round trip within filter tolerance
        for i in 200..original.len() - 200 {
            assert!(
                (channels[0][i] - original[i]).abs() < 0.05,
                "sample {} changed: {} vs {}",
                i,
                channels[0][i],
                original[i]
            );
        }
    }

    #[test]
    fn channels_stay_linked() {
        // one hot channel forces the same gain on its quiet sibling
        let hot = sine(44100, 997.0, 44100, 0.99);
        let quiet = sine(44100, 997.0, 44100, 0.40);
        let mut channels = vec![hot, quiet.clone()];
        limit_true_peak(&mut channels, 44100, &LimiterSettings::default()).unwrap();

        let quiet_peak_after = measure_true_peak_linear(&[channels[1].clone()], 4);
        let quiet_peak_before = measure_true_peak_linear(&[quiet], 4);
        assert!(
            quiet_peak_after < quiet_peak_before - 0.01,
            "linked gain did not reach the quiet channel: {:.3} vs {:.3}",
            quiet_peak_after,
            quiet_peak_before
        );
    }

    #[test]
    fn empty_input_rejected() {
        let mut channels: Vec<Vec<f32>> = vec![];
        assert_eq!(
            limit_true_peak(&mut channels, 44100, &LimiterSettings::default()),
            Err(DspError::EmptyBuffer)
        );
    }
}

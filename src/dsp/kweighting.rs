//! K-weighting pre-filter (BS.1770)
//!
//! A high-shelf boost modeling head diffraction followed by an RLB high-pass,
//! convolved into a single 4th-order IIR per channel. Coefficients are derived
//! for the actual sample rate via tan pre-warping, so measurement works at any
//! rate, not just 48 kHz.

use std::f64::consts::PI;

/// Shelf stage center frequency (Hz)
const SHELF_F0: f64 = 1681.974450955533;
/// Shelf gain (dB)
const SHELF_GAIN_DB: f64 = 3.999843853973347;
/// Shelf quality
const SHELF_Q: f64 = 0.7071752369554196;

/// High-pass corner frequency (Hz)
const HIGHPASS_F0: f64 = 38.13547087602444;
/// High-pass quality
const HIGHPASS_Q: f64 = 0.5003270373238773;

/// 4th-order IIR applying both K-weighting stages in one pass
#[derive(Debug, Clone)]
pub struct KWeightingFilter {
    b: [f64; 5],
    a: [f64; 5],
}

impl KWeightingFilter {
    /// Derive coefficients for `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        let fs = sample_rate as f64;

        // Stage 1: high-shelf
        let k = (PI * SHELF_F0 / fs).tan();
        let vh = 10f64.powf(SHELF_GAIN_DB / 20.0);
        let vb = vh.powf(0.4996667741545416);
        let d = 1.0 + k / SHELF_Q + k * k;
        let shelf_b = [
            (vh + vb * k / SHELF_Q + k * k) / d,
            2.0 * (k * k - vh) / d,
            (vh - vb * k / SHELF_Q + k * k) / d,
        ];
        let shelf_a = [1.0, 2.0 * (k * k - 1.0) / d, (1.0 - k / SHELF_Q + k * k) / d];

        // Stage 2: RLB high-pass
        let k = (PI * HIGHPASS_F0 / fs).tan();
        let d = 1.0 + k / HIGHPASS_Q + k * k;
        let hp_b = [1.0, -2.0, 1.0];
        let hp_a = [
            1.0,
            2.0 * (k * k - 1.0) / d,
            (1.0 - k / HIGHPASS_Q + k * k) / d,
        ];

        Self {
            b: convolve(shelf_b, hp_b),
            a: convolve(shelf_a, hp_a),
        }
    }

    /// Filter one channel, returning the weighted signal
    pub fn filter(&self, input: &[f32]) -> Vec<f32> {
        // direct form II transposed, f64 state
        let mut s = [0.0f64; 4];
        let (b, a) = (&self.b, &self.a);
        input
            .iter()
            .map(|&x| {
                let x = x as f64;
                let y = b[0] * x + s[0];
                s[0] = b[1] * x - a[1] * y + s[1];
                s[1] = b[2] * x - a[2] * y + s[2];
                s[2] = b[3] * x - a[3] * y + s[3];
                s[3] = b[4] * x - a[4] * y;
                y as f32
            })
            .collect()
    }
}

/// Convolve two 3-tap polynomials into one 5-tap polynomial
fn convolve(x: [f64; 3], y: [f64; 3]) -> [f64; 5] {
    let mut out = [0.0; 5];
    for (i, xi) in x.iter().enumerate() {
        for (j, yj) in y.iter().enumerate() {
            out[i + j] += xi * yj;
        }
    }
    out
}

//! Fade curve implementations
//!
//! Five curve shapes with fade-in and fade-out directions. During a
//! crossfade the outgoing mixer follows `fade_out(p)` while the incoming
//! mixer follows `fade_in(p)`; EqualPower keeps the summed power constant
//! across the overlap.

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Fade curve types
///
/// - Linear: constant rate of change
/// - EasePower: smooth symmetric S-curve (gentle start and finish)
/// - EaseIn: slow start, fast finish
/// - EaseOut: fast start, slow finish
/// - EqualPower: constant perceived loudness through a crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// v(t) = t
    Linear,
    /// v(t) = 0.5 × (1 − cos(π × t))
    EasePower,
    /// v(t) = t²
    EaseIn,
    /// v(t) = 1 − (1 − t)²
    EaseOut,
    /// v(t) = sin(t × π/2)
    EqualPower,
}

impl FadeCurve {
    /// Fade-in multiplier at normalized position `t ∈ [0, 1]`
    ///
    /// Returns 0.0 at the start of the fade and 1.0 at the end.
    pub fn fade_in(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => t,
            FadeCurve::EasePower => 0.5 * (1.0 - (std::f32::consts::PI * t).cos()),
            FadeCurve::EaseIn => t * t,
            FadeCurve::EaseOut => {
                let inv = 1.0 - t;
                1.0 - inv * inv
            }
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Fade-out multiplier at normalized position `t ∈ [0, 1]`
    ///
    /// The crossfade complement of [`FadeCurve::fade_in`]: 1.0 at the start,
    /// 0.0 at the end. For EqualPower, `fade_in(t)² + fade_out(t)² = 1`.
    pub fn fade_out(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => 1.0 - t,
            FadeCurve::EasePower => 0.5 * (1.0 + (std::f32::consts::PI * t).cos()),
            FadeCurve::EaseIn => {
                let inv = 1.0 - t;
                inv * inv
            }
            FadeCurve::EaseOut => 1.0 - t * t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
        }
    }

    /// Interpolate a mixer value between two endpoints: `from + (to − from)·fade_in(t)`
    pub fn interpolate(&self, from: f32, to: f32, t: f32) -> f32 {
        from + (to - from) * self.fade_in(t)
    }

    /// Parse from a configuration string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Some(FadeCurve::Linear),
            "ease_power" | "easepower" => Some(FadeCurve::EasePower),
            "ease_in" | "easein" => Some(FadeCurve::EaseIn),
            "ease_out" | "easeout" => Some(FadeCurve::EaseOut),
            "equal_power" | "equalpower" => Some(FadeCurve::EqualPower),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::EasePower => "ease_power",
            FadeCurve::EaseIn => "ease_in",
            FadeCurve::EaseOut => "ease_out",
            FadeCurve::EqualPower => "equal_power",
        }
    }
}

impl Default for FadeCurve {
    /// EqualPower keeps long ambient material at constant perceived level
    /// through transitions
    fn default() -> Self {
        FadeCurve::EqualPower
    }
}

//! Engine configuration
//!
//! Typed parameter structs with defaults matching long-form ambient playback.
//! `validate()` runs on every `update_configuration` call; out-of-range
//! values are rejected before they can reach the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dsp::normalizer::NormalizerSettings;
use crate::error::{Error, Result};
use crate::host::SessionOptions;
use crate::playback::curves::FadeCurve;
use crate::types::{LoopMode, RepeatMode};

/// Who owns the process-wide audio session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// The engine configures and activates the session
    Managed,
    /// The embedder owns the session; the engine only validates it
    External,
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Managed
    }
}

/// Overlay layer configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub loop_mode: LoopMode,
    /// Pause between loop iterations
    pub loop_delay: Duration,
    /// Overlay mixer level in [0, 1]
    pub volume: f32,
    pub fade_in: Duration,
    pub fade_out: Duration,
    pub fade_curve: FadeCurve,
    /// Run overlay buffers through loudness normalization on load
    pub normalized: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Infinite,
            loop_delay: Duration::ZERO,
            volume: 1.0,
            fade_in: Duration::ZERO,
            fade_out: Duration::ZERO,
            fade_curve: FadeCurve::Linear,
            normalized: false,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::InvalidConfiguration {
                reason: format!("overlay volume {} outside [0, 1]", self.volume),
            });
        }
        if matches!(self.loop_mode, LoopMode::Count(0)) {
            return Err(Error::InvalidConfiguration {
                reason: "overlay loop count must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level player configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Crossfade length for automatic and manual transitions (1–30 s)
    pub crossfade_duration: Duration,
    pub fade_curve: FadeCurve,
    pub repeat_mode: RepeatMode,
    /// Completed playlist cycles before finishing; 0 = infinite
    pub repeat_count: u32,
    /// Main output level in [0, 1]
    pub volume: f32,
    pub session_mode: SessionMode,
    pub session_options: SessionOptions,
    /// Normalize main-layer buffers on load
    pub normalize_loudness: bool,
    pub normalization: NormalizerSettings,
    /// Deadline for each file load
    pub load_timeout: Duration,
    /// Decoded-buffer cache bound (entry count)
    pub cache_capacity: usize,
    /// Preloaded sound-effect slots
    pub effect_slots: usize,
    pub overlay: OverlayConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            crossfade_duration: Duration::from_secs(5),
            fade_curve: FadeCurve::default(),
            repeat_mode: RepeatMode::Off,
            repeat_count: 0,
            volume: 1.0,
            session_mode: SessionMode::Managed,
            session_options: SessionOptions::default(),
            normalize_loudness: false,
            normalization: NormalizerSettings::default(),
            load_timeout: Duration::from_secs(10),
            cache_capacity: 16,
            effect_slots: 10,
            overlay: OverlayConfig::default(),
        }
    }
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<()> {
        let crossfade = self.crossfade_duration.as_secs_f64();
        if !(1.0..=30.0).contains(&crossfade) {
            return Err(Error::InvalidConfiguration {
                reason: format!("crossfade duration {crossfade:.2}s outside [1, 30]"),
            });
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::InvalidConfiguration {
                reason: format!("volume {} outside [0, 1]", self.volume),
            });
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidConfiguration {
                reason: "cache capacity must be at least 1".to_string(),
            });
        }
        if self.load_timeout.is_zero() {
            return Err(Error::InvalidConfiguration {
                reason: "load timeout must be non-zero".to_string(),
            });
        }
        self.overlay.validate()
    }
}

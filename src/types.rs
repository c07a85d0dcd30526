//! Core data model shared between components
//!
//! Plain value types: tracks, decoded PCM buffers, repeat/loop modes, slot
//! identifiers, and the observable state enums. Everything here is Sendable
//! and cheap to clone (buffers travel as `Arc<DecodedBuffer>`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Optional user-supplied track metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

/// Format details gained when a track's file is loaded
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Duration in seconds
    pub duration: f64,
    /// Sample rate of the decoded file
    pub sample_rate: u32,
    /// Channel count of the decoded file
    pub channels: u16,
    /// Whether the source was interleaved before decode
    pub interleaved: bool,
}

/// A playable track: immutable identity plus format info gained on load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Instance identity (distinct per playlist entry)
    pub id: Uuid,
    /// Source URI understood by the host media reader
    pub uri: String,
    /// Optional user-supplied metadata
    pub metadata: Option<TrackMetadata>,
    /// Populated once the file has been decoded
    pub info: Option<TrackInfo>,
}

impl Track {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            metadata: None,
            info: None,
        }
    }

    pub fn with_metadata(uri: impl Into<String>, metadata: TrackMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            uri: uri.into(),
            metadata: Some(metadata),
            info: None,
        }
    }

    /// Duration in seconds, if known
    pub fn duration(&self) -> Option<f64> {
        self.info.map(|i| i.duration)
    }
}

/// Decoded PCM audio: float32, non-interleaved, shared read-only after decode
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    /// One Vec per channel, equal lengths
    pub channels: Vec<Vec<f32>>,
    /// Sample rate of the stored frames
    pub sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Allocate a silent buffer
    pub fn silent(channel_count: usize, frames: usize, sample_rate: u32) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channel_count],
            sample_rate,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }
}

/// Main-layer repeat behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Stop at the playlist ends
    Off,
    /// Loop the current track gaplessly
    SingleTrack,
    /// Wrap around the playlist
    Playlist,
}

impl Default for RepeatMode {
    fn default() -> Self {
        RepeatMode::Off
    }
}

/// Overlay-layer loop behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Play a single iteration
    Once,
    /// Play a fixed number of iterations (> 0)
    Count(u32),
    /// Loop until stopped
    Infinite,
}

impl Default for LoopMode {
    fn default() -> Self {
        LoopMode::Infinite
    }
}

/// One of the two main-layer player/mixer pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    /// The other slot
    pub fn other(&self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotId::A => write!(f, "A"),
            SlotId::B => write!(f, "B"),
        }
    }
}

/// Observable facade state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum PlayerState {
    Idle,
    Preparing,
    Playing,
    Paused,
    FadingOut,
    Finished,
    /// Unrecoverable failure; carries the error description
    Failed(String),
}

impl PlayerState {
    /// Terminal states ignore pause/resume
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlayerState::Finished | PlayerState::Failed(_))
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "idle"),
            PlayerState::Preparing => write!(f, "preparing"),
            PlayerState::Playing => write!(f, "playing"),
            PlayerState::Paused => write!(f, "paused"),
            PlayerState::FadingOut => write!(f, "fading_out"),
            PlayerState::Finished => write!(f, "finished"),
            PlayerState::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Observable overlay state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayState {
    Idle,
    Preparing,
    Playing,
    Paused,
    Stopping,
}

impl fmt::Display for OverlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayState::Idle => write!(f, "idle"),
            OverlayState::Preparing => write!(f, "preparing"),
            OverlayState::Playing => write!(f, "playing"),
            OverlayState::Paused => write!(f, "paused"),
            OverlayState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Why a crossfade was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossfadeKind {
    /// Gapless loop or automatic playlist advance
    AutomaticLoop,
    /// User-initiated track change
    ManualChange,
}

/// Phase of an in-flight transition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "progress")]
pub enum CrossfadePhase {
    Idle,
    Preparing,
    /// Fractional progress in [0, 1]
    Fading(f32),
    Switching,
    Cleanup,
}

/// Progress report republished on the event stream during transitions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossfadeProgress {
    pub phase: CrossfadePhase,
    /// Total transition duration
    pub duration: Duration,
    /// Time elapsed since the fade began
    pub elapsed: Duration,
}

impl CrossfadeProgress {
    pub fn idle() -> Self {
        Self {
            phase: CrossfadePhase::Idle,
            duration: Duration::ZERO,
            elapsed: Duration::ZERO,
        }
    }

    /// Fractional progress, 0 outside the fading phase
    pub fn fraction(&self) -> f32 {
        match self.phase {
            CrossfadePhase::Fading(p) => p,
            CrossfadePhase::Switching | CrossfadePhase::Cleanup => 1.0,
            _ => 0.0,
        }
    }
}

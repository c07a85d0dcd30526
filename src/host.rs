//! Host platform abstraction
//!
//! The engine never talks to an audio device, a decoder, or the OS session
//! directly. The embedder supplies implementations of these traits wrapping
//! whatever node-graph framework the platform exposes. Completion and
//! notification callbacks may arrive on arbitrary host threads; the engine
//! converts them to owned values and reposts them onto its own tasks, so
//! implementations only need `Send + Sync` handles.

pub mod sim;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::DecodedBuffer;

/// A point on a player's render timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTime {
    /// Samples rendered since the player last started playing
    pub sample_time: u64,
    /// The engine's output sample rate
    pub sample_rate: u32,
}

impl RenderTime {
    pub fn seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_time as f64 / self.sample_rate as f64
    }
}

/// Fired by the host when scheduled audio has fully played back.
///
/// Hosts also fire pending handlers when a player is stopped; stale handlers
/// are filtered out by the engine's schedule generations.
pub type CompletionHandler = Box<dyn FnOnce() + Send + 'static>;

/// One player node in the host graph
pub trait PlayerNode: Send + Sync {
    fn play(&self);
    /// Begin playback phase-locked to a future render time
    fn play_at(&self, when: RenderTime);
    fn pause(&self);
    /// Halt and discard scheduled audio; pending completions fire stale
    fn stop(&self);
    /// Clear internal state without firing completions
    fn reset(&self);

    /// Schedule an entire buffer for playback
    fn schedule_file(&self, buffer: Arc<DecodedBuffer>, on_complete: CompletionHandler);
    /// Schedule a tail segment starting at `from_frame`
    fn schedule_segment(&self, buffer: Arc<DecodedBuffer>, from_frame: u64, on_complete: CompletionHandler);
    /// Schedule a raw buffer (overlay / effects path)
    fn schedule_buffer(&self, buffer: Arc<DecodedBuffer>, on_complete: CompletionHandler);

    fn is_playing(&self) -> bool;
    /// Current render position, `None` when the player has never started
    fn last_render_time(&self) -> Option<RenderTime>;
}

/// A mixer node with a single volume control
pub trait MixerNode: Send + Sync {
    fn set_volume(&self, volume: f32);
    fn volume(&self) -> f32;
}

/// Failures raised by the host graph
#[derive(Error, Debug, Clone, PartialEq)]
#[error("host audio graph error: {0}")]
pub struct GraphError(pub String);

/// The host node graph: attachment, connection, and engine lifecycle
pub trait AudioGraph: Send + Sync {
    /// Attach a new player node; `label` is diagnostic only
    fn attach_player(&self, label: &str) -> Arc<dyn PlayerNode>;
    /// Attach a new mixer node feeding the main mix
    fn attach_mixer(&self, label: &str) -> Arc<dyn MixerNode>;
    /// Connect a player to its mixer, adapting channel counts as needed
    fn connect(&self, player: &Arc<dyn PlayerNode>, mixer: &Arc<dyn MixerNode>) -> Result<(), GraphError>;
    /// The output mixer all per-layer mixers feed
    fn main_mixer(&self) -> Arc<dyn MixerNode>;

    fn start(&self) -> Result<(), GraphError>;
    fn stop(&self);
    fn is_running(&self) -> bool;
    /// Render sample rate of the output bus
    fn output_sample_rate(&self) -> u32;
}

/// Audio session categories the engine recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCategory {
    Playback,
    PlayAndRecord,
    MultiRoute,
    Ambient,
    SoloAmbient,
    Record,
}

impl SessionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionCategory::Playback => "playback",
            SessionCategory::PlayAndRecord => "play_and_record",
            SessionCategory::MultiRoute => "multi_route",
            SessionCategory::Ambient => "ambient",
            SessionCategory::SoloAmbient => "solo_ambient",
            SessionCategory::Record => "record",
        }
    }
}

impl std::fmt::Display for SessionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session option set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub mix_with_others: bool,
    pub duck_others: bool,
    pub allow_bluetooth: bool,
    pub default_to_speaker: bool,
    pub interrupt_spoken_audio: bool,
}

/// Why the audio route changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeReason {
    /// Headphones unplugged, device disappeared: act immediately
    OldDeviceUnavailable,
    /// A new output became available: debounced
    NewDeviceAvailable,
    /// An output override was applied: debounced
    Override,
    /// The session category changed underneath us: revalidate
    CategoryChange,
    Unknown,
}

/// Asynchronous session notifications from the host.
///
/// Raw platform callbacks must be converted to these owned values at the
/// callback boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionHostEvent {
    InterruptionBegan,
    /// `should_resume: None` means the hint was absent (assistant-style
    /// pauses); playback must not auto-resume
    InterruptionEnded { should_resume: Option<bool> },
    RouteChanged { reason: RouteChangeReason },
    MediaServicesReset,
}

/// The process-wide audio session exposed by the host
pub trait SessionHost: Send + Sync {
    fn category(&self) -> SessionCategory;
    fn options(&self) -> SessionOptions;
    fn set_category(&self, category: SessionCategory, options: SessionOptions) -> Result<(), String>;
    fn set_preferred_sample_rate(&self, rate: f64) -> Result<(), String>;
    fn set_preferred_io_buffer_duration(&self, seconds: f64) -> Result<(), String>;
    fn set_active(&self, active: bool) -> Result<(), String>;
    fn is_active(&self) -> bool;

    /// Subscribe to session notifications; every subscriber sees every event
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SessionHostEvent>;
}

/// Media read failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaReadError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("decode failed for {uri}: {detail}")]
    Decode { uri: String, detail: String },
}

/// Decoded audio as delivered by the host reader
#[derive(Debug, Clone)]
pub struct LoadedAudio {
    pub buffer: DecodedBuffer,
    /// Whether the source file stored interleaved frames
    pub was_interleaved: bool,
}

/// Blocking file reader; invoked on a blocking thread under a timeout race
pub trait MediaSource: Send + Sync {
    fn read(&self, uri: &str) -> Result<LoadedAudio, MediaReadError>;
}

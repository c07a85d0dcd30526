//! # lumiere
//!
//! Embeddable audio playback engine for long-form atmospheric content:
//! meditation, sleep, and ambient programs that run for hours and must
//! coexist with everything else making sound on the device.
//!
//! Three independent layers play at once:
//! - a gapless **main** stream with seamless crossfading between tracks
//!   (dual player slots, generation-tagged schedules, pause/resume/rollback
//!   of in-flight fades),
//! - a looping **overlay** for ambience or timed bells,
//! - a one-shot **effects** layer backed by a preloaded cache.
//!
//! Buffers can be normalized offline to a target integrated loudness
//! (BS.1770 gated LUFS) under an oversampled true-peak ceiling.
//!
//! The engine never touches an audio device directly: the embedder provides
//! the platform node graph, session, and file reader through the traits in
//! [`host`]. A simulated host ([`host::sim`]) ships with the crate for tests
//! and headless use.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lumiere::host::sim::{SimGraph, SimMediaSource, SimSession};
//! use lumiere::{AmbientPlayer, PlayerConfig, Track};
//!
//! # async fn demo() -> lumiere::Result<()> {
//! let graph = SimGraph::new(44100);
//! let session = SimSession::new();
//! let media = SimMediaSource::new();
//!
//! let player = AmbientPlayer::new(graph, session, media, PlayerConfig::default())?;
//! player.load_playlist(vec![Track::new("file:///calm.flac")]).await?;
//! player.start_playing(Duration::from_secs(2)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod dsp;
pub mod error;
pub mod events;
pub mod host;
pub mod ops;
pub mod playback;
pub mod player;
pub mod session;
pub mod state;
pub mod types;

pub use config::{OverlayConfig, PlayerConfig, SessionMode};
pub use error::{Error, Result};
pub use events::PlayerEvent;
pub use playback::crossfade::{CrossfadeOutcome, PausedCrossfade};
pub use playback::curves::FadeCurve;
pub use playback::effects::SoundEffect;
pub use player::AmbientPlayer;
pub use session::{SessionDelegate, SessionValidation};
pub use state::PositionInfo;
pub use types::{
    CrossfadeKind, CrossfadePhase, CrossfadeProgress, DecodedBuffer, LoopMode, OverlayState,
    PlayerState, RepeatMode, Track, TrackInfo, TrackMetadata,
};

//! Shared fixtures for the integration suites
//!
//! Builds a full player on the simulated host with generated sine fixtures.
//! Tests drive playback through the public facade and observe effects on the
//! sim graph's players and mixers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lumiere::config::PlayerConfig;
use lumiere::host::sim::{SimGraph, SimMediaSource, SimSession};
use lumiere::host::{MixerNode, PlayerNode};
use lumiere::player::AmbientPlayer;
use lumiere::types::{RepeatMode, Track};

pub const RATE: u32 = 44100;

pub struct Fixture {
    pub player: Arc<AmbientPlayer>,
    pub graph: Arc<SimGraph>,
    pub session: Arc<SimSession>,
    pub media: Arc<SimMediaSource>,
}

impl Fixture {
    /// Player with `track_count` sine fixtures of `track_secs` seconds each
    pub fn new(track_count: usize, track_secs: f64, config: PlayerConfig) -> Self {
        let graph = SimGraph::new(RATE);
        let session = SimSession::new();
        let media = SimMediaSource::new();
        for i in 0..track_count {
            media.add_sine(&track_uri(i), RATE, 220.0 + 110.0 * i as f64, track_secs, 0.5);
        }
        let player = AmbientPlayer::new(
            Arc::clone(&graph) as _,
            Arc::clone(&session) as _,
            Arc::clone(&media) as _,
            config,
        )
        .expect("player construction");
        Self {
            player,
            graph,
            session,
            media,
        }
    }

    pub fn tracks(&self, count: usize) -> Vec<Track> {
        (0..count).map(|i| Track::new(track_uri(i))).collect()
    }

    /// Load a playlist and begin playback without a fade-in
    pub async fn start(&self, track_count: usize) {
        self.player
            .load_playlist(self.tracks(track_count))
            .await
            .expect("load playlist");
        self.player
            .start_playing(Duration::ZERO)
            .await
            .expect("start playing");
    }

    pub fn main_mixer_volume(&self) -> f32 {
        self.graph.sim_main_mixer().volume()
    }

    pub fn slot_mixer_volume(&self, slot: char) -> f32 {
        self.graph
            .mixer(&format!("mixer-{slot}"))
            .expect("slot mixer")
            .volume()
    }

    pub fn slot_playing(&self, slot: char) -> bool {
        self.graph
            .player(&format!("player-{slot}"))
            .expect("slot player")
            .is_playing()
    }
}

pub fn track_uri(index: usize) -> String {
    format!("track-{index}")
}

/// Default configuration tuned for short test material
pub fn test_config(crossfade_secs: f64, repeat: RepeatMode) -> PlayerConfig {
    let mut config = PlayerConfig::default();
    config.crossfade_duration = Duration::from_secs_f64(crossfade_secs);
    config.repeat_mode = repeat;
    config
}

//! Public facade
//!
//! `AmbientPlayer` serializes user operations through the bounded queue,
//! keeps the observable state mirror current, and wires the background
//! machinery together: the position ticker that arms automatic gapless
//! transitions, the natural-end listener, and the session-signal handler
//! that turns interruptions, route losses, and media-services resets into
//! pause/resume/recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::AudioFileCache;
use crate::config::{OverlayConfig, PlayerConfig};
use crate::dsp::normalizer::LoudnessNormalizer;
use crate::error::{Error, Result};
use crate::events::PlayerEvent;
use crate::host::{AudioGraph, MediaSource, SessionHost};
use crate::playback::crossfade::{replace_plan, Crossfader, ReplacePlan};
use crate::playback::curves::FadeCurve;
use crate::playback::effects::{EffectsPlayer, SoundEffect};
use crate::playback::engine::AudioEngine;
use crate::playback::overlay::OverlayPlayer;
use crate::playback::playlist::Playlist;
use crate::ops::{OpPriority, OperationQueue, DEFAULT_DEPTH};
use crate::session::{SessionCoordinator, SessionDelegate, SessionSignal};
use crate::state::{PositionInfo, SharedState};
use crate::types::{
    CrossfadeKind, CrossfadeProgress, LoopMode, OverlayState, PlayerState, RepeatMode, SlotId,
    Track,
};

/// Fade used by plain pause/resume
const PAUSE_FADE: Duration = Duration::from_millis(300);
/// Fades on either side of a skip's seek
const SKIP_FADE: Duration = Duration::from_millis(300);
/// Restore ramp when a crossfade is cancelled by a newer operation
const CANCEL_FADE: Duration = Duration::from_millis(300);
/// Default skip distance
pub const DEFAULT_SKIP_INTERVAL: Duration = Duration::from_secs(15);
/// Default fade for `finish`
pub const DEFAULT_FINISH_FADE: Duration = Duration::from_secs(3);
/// Default fade for `seek`
pub const DEFAULT_SEEK_FADE: Duration = Duration::from_millis(100);
/// Minimum spacing between skip-track calls
const SKIP_MIN_INTERVAL: Duration = Duration::from_millis(500);
/// Internal position poll; the subject republishes every fifth tick
const POSITION_TICK: Duration = Duration::from_millis(100);

/// The embeddable playback engine facade
pub struct AmbientPlayer {
    config: RwLock<PlayerConfig>,
    cache: Arc<AudioFileCache>,
    engine: Arc<AudioEngine>,
    crossfader: Arc<Crossfader>,
    overlay: Arc<OverlayPlayer>,
    effects: Arc<EffectsPlayer>,
    session: Arc<SessionCoordinator>,
    playlist: Mutex<Playlist>,
    shared: Arc<SharedState>,
    ops: OperationQueue,
    last_skip: std::sync::Mutex<Option<tokio::time::Instant>>,
    skip_in_progress: AtomicBool,
    paused_by_interruption: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AmbientPlayer {
    /// Build the full stack on the supplied host. Attaches and connects the
    /// node graph but does not start it; `start_playing` does.
    ///
    /// Must be called from within a tokio runtime: the player spawns its
    /// position ticker and listener tasks immediately.
    pub fn new(
        graph: Arc<dyn AudioGraph>,
        session_host: Arc<dyn SessionHost>,
        media: Arc<dyn MediaSource>,
        config: PlayerConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let shared = Arc::new(SharedState::new());
        let cache = Arc::new(AudioFileCache::new(
            media,
            Some(LoudnessNormalizer::new(config.normalization)),
            config.cache_capacity,
            config.load_timeout,
        ));
        let engine = Arc::new(AudioEngine::new(
            Arc::clone(&graph),
            Arc::clone(&cache),
            config.normalize_loudness,
        )?);
        engine.set_volume(config.volume);

        let overlay_nodes = engine
            .take_overlay_nodes()
            .ok_or_else(|| Error::EngineStartFailed {
                reason: "overlay nodes already taken".to_string(),
            })?;
        let overlay = OverlayPlayer::new(
            overlay_nodes.player,
            overlay_nodes.mixer,
            Arc::clone(&cache),
            graph.output_sample_rate(),
            config.overlay,
        );

        let effect_nodes = engine
            .take_effect_nodes()
            .ok_or_else(|| Error::EngineStartFailed {
                reason: "effect nodes already taken".to_string(),
            })?;
        let effects = Arc::new(EffectsPlayer::new(
            effect_nodes.player,
            effect_nodes.mixer,
            Arc::clone(&cache),
            config.effect_slots,
        ));

        let session = SessionCoordinator::new(
            session_host,
            Arc::clone(&shared),
            config.session_mode,
        );
        let crossfader = Crossfader::new(Arc::clone(&engine), Arc::clone(&shared));

        let player = Arc::new(Self {
            config: RwLock::new(config),
            cache,
            engine,
            crossfader,
            overlay,
            effects,
            session,
            playlist: Mutex::new(Playlist::default()),
            shared,
            ops: OperationQueue::new(DEFAULT_DEPTH),
            last_skip: std::sync::Mutex::new(None),
            skip_in_progress: AtomicBool::new(false),
            paused_by_interruption: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });
        player.spawn_background_tasks();
        Ok(player)
    }

    // ------------------------------------------------------------------
    // Observables
    // ------------------------------------------------------------------

    pub fn state(&self) -> PlayerState {
        self.shared.state()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.shared.current_track()
    }

    pub fn position(&self) -> PositionInfo {
        self.shared.position()
    }

    pub fn volume(&self) -> f32 {
        self.engine.target_volume()
    }

    pub fn overlay_state(&self) -> OverlayState {
        self.overlay.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.shared.subscribe_state()
    }

    pub fn subscribe_track(&self) -> watch::Receiver<Option<Track>> {
        self.shared.subscribe_track()
    }

    pub fn subscribe_position(&self) -> watch::Receiver<PositionInfo> {
        self.shared.subscribe_position()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_crossfade_progress(&self) -> watch::Receiver<CrossfadeProgress> {
        self.crossfader.subscribe_progress()
    }

    pub fn set_session_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        self.session.set_delegate(delegate);
    }

    pub async fn configuration(&self) -> PlayerConfig {
        self.config.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Main layer operations
    // ------------------------------------------------------------------

    /// Start playback of the playlist's current track
    pub async fn start_playing(self: &Arc<Self>, fade_in: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "start_playing", async move {
                this.do_start_playing(fade_in).await
            })
            .await?
    }

    async fn do_start_playing(self: Arc<Self>, fade_in: Duration) -> Result<()> {
        let state = self.shared.state();
        if !matches!(state, PlayerState::Idle | PlayerState::Finished) {
            return Err(Error::invalid_state(state, "start playing"));
        }
        if self.playlist.lock().await.is_empty() {
            return Err(Error::EmptyPlaylist);
        }

        self.shared.set_state(PlayerState::Preparing);
        let (options, curve) = {
            let config = self.config.read().await;
            (config.session_options, config.fade_curve)
        };

        let result: Result<()> = async {
            self.session.configure(options, false)?;
            self.session.activate()?;
            self.engine.start()?;

            let track = self
                .playlist
                .lock()
                .await
                .current()
                .cloned()
                .ok_or(Error::EmptyPlaylist)?;
            let loaded = self.load_track(self.engine.active_slot(), &track).await?;
            self.set_current(Some(loaded)).await;

            let fade = (!fade_in.is_zero()).then_some((fade_in, curve));
            self.engine.schedule_active(fade).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.shared.set_state(PlayerState::Playing);
                self.prefetch_next();
                Ok(())
            }
            Err(error) => {
                self.shared.set_state(PlayerState::Idle);
                Err(error)
            }
        }
    }

    /// Pause the main layer, snapshotting an in-flight crossfade
    pub async fn pause(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "pause", async move {
                this.do_pause().await
            })
            .await?
    }

    async fn do_pause(self: Arc<Self>) -> Result<()> {
        // idempotent: anything but Playing (including terminal states) is a no-op
        if self.shared.state() != PlayerState::Playing {
            return Ok(());
        }
        if self.crossfader.pause_active().await? {
            self.shared.set_state(PlayerState::Paused);
            return Ok(());
        }
        let curve = self.config.read().await.fade_curve;
        self.crossfader.simple_fade_out(PAUSE_FADE, curve).await;
        self.engine.pause().await;
        self.shared.set_state(PlayerState::Paused);
        Ok(())
    }

    /// Resume the main layer, restoring a paused crossfade when one exists
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "resume", async move {
                this.do_resume().await
            })
            .await?
    }

    async fn do_resume(self: Arc<Self>) -> Result<()> {
        if self.shared.state() != PlayerState::Paused {
            return Ok(());
        }
        if self.crossfader.resume().await? {
            self.shared.set_state(PlayerState::Playing);
            return Ok(());
        }
        self.engine.play().await?;
        let curve = self.config.read().await.fade_curve;
        self.crossfader.simple_fade_in(PAUSE_FADE, curve).await;
        self.shared.set_state(PlayerState::Playing);
        Ok(())
    }

    /// Stop the main layer. Always succeeds and lands in Finished.
    pub async fn stop(self: &Arc<Self>, fade_out: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "stop", async move {
                this.do_stop(fade_out).await;
                Ok(())
            })
            .await?
    }

    async fn do_stop(self: Arc<Self>, fade_out: Duration) {
        let was_playing = self.shared.state() == PlayerState::Playing;
        if was_playing {
            self.shared.set_state(PlayerState::FadingOut);
        }
        self.crossfader.abort().await;
        if was_playing && !fade_out.is_zero() {
            let curve = self.config.read().await.fade_curve;
            self.crossfader.simple_fade_out(fade_out, curve).await;
        }
        self.engine.stop().await;
        self.set_current(None).await;
        self.shared.set_position(PositionInfo::zero());
        self.shared.set_state(PlayerState::Finished);
    }

    /// Fade out over `fade_out` (default 3 s) and stop. Requires Playing or
    /// Paused.
    pub async fn finish(self: &Arc<Self>, fade_out: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "finish", async move {
                let state = this.shared.state();
                if !matches!(state, PlayerState::Playing | PlayerState::Paused) {
                    return Err(Error::invalid_state(state, "finish"));
                }
                this.do_stop(fade_out).await;
                Ok(())
            })
            .await?
    }

    /// Seek within the current track
    pub async fn seek(self: &Arc<Self>, time: Duration, fade: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::High, "seek", async move {
                this.do_seek(time, fade).await
            })
            .await?
    }

    async fn do_seek(self: Arc<Self>, time: Duration, fade: Duration) -> Result<()> {
        if self.shared.current_track().is_none() {
            return Err(Error::invalid_state(self.shared.state(), "seek"));
        }
        self.engine.cancel_fade_in();
        if self.crossfader.is_in_progress().await {
            // a seek wins over a transition; restore the outgoing track
            let _ = self.crossfader.rollback_current(CANCEL_FADE).await;
        }
        let curve = self.config.read().await.fade_curve;
        let playing = self.shared.state() == PlayerState::Playing
            && self.engine.active_player_playing();
        if playing {
            self.crossfader.fade_seek_fade(time, fade, fade, curve).await?;
        } else {
            self.engine.seek(time).await?;
        }
        self.shared.set_position(self.engine.position().await);
        Ok(())
    }

    /// Skip forward within the track (fade-seek-fade)
    pub async fn skip_forward(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let position = self.shared.position();
        let target = Duration::from_secs_f64(position.current_time) + interval;
        self.skip_within_track(target).await
    }

    /// Skip backward within the track
    pub async fn skip_backward(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let position = self.shared.position();
        let target =
            Duration::from_secs_f64((position.current_time - interval.as_secs_f64()).max(0.0));
        self.skip_within_track(target).await
    }

    async fn skip_within_track(self: &Arc<Self>, target: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::High, "skip_within_track", async move {
                this.do_seek(target, SKIP_FADE).await
            })
            .await?
    }

    /// Set the output volume (also the active mixer when idle)
    pub fn set_volume(&self, volume: f32) {
        self.engine.set_volume(volume);
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) {
        self.config.write().await.repeat_mode = mode;
        info!(?mode, "repeat mode changed");
    }

    /// Replace the configuration. Stops playback first.
    pub async fn update_configuration(self: &Arc<Self>, config: PlayerConfig) -> Result<()> {
        config.validate()?;
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "update_configuration", async move {
                this.clone().do_stop(Duration::ZERO).await;
                this.engine.set_normalize_loads(config.normalize_loudness);
                this.engine.set_volume(config.volume);
                this.overlay.set_config(config.overlay)?;
                this.session.set_mode(config.session_mode);
                this.cache.set_capacity(config.cache_capacity);
                this.cache.set_load_timeout(config.load_timeout);
                *this.config.write().await = config;
                info!("configuration updated");
                Ok(())
            })
            .await?
    }

    // ------------------------------------------------------------------
    // Playlist operations
    // ------------------------------------------------------------------

    /// Install a playlist while stopped
    pub async fn load_playlist(self: &Arc<Self>, tracks: Vec<Track>) -> Result<()> {
        if tracks.is_empty() {
            return Err(Error::EmptyPlaylist);
        }
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "load_playlist", async move {
                let state = this.shared.state();
                if matches!(state, PlayerState::Playing | PlayerState::Paused) {
                    return Err(Error::invalid_state(state, "load playlist"));
                }
                this.playlist.lock().await.replace(tracks);
                Ok(())
            })
            .await?
    }

    /// Swap the playlist; crossfades into its first track when playing
    pub async fn replace_playlist(self: &Arc<Self>, tracks: Vec<Track>) -> Result<()> {
        if tracks.is_empty() {
            return Err(Error::EmptyPlaylist);
        }
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::High, "replace_playlist", async move {
                this.do_replace_playlist(tracks).await
            })
            .await?
    }

    async fn do_replace_playlist(self: Arc<Self>, tracks: Vec<Track>) -> Result<()> {
        let playing = self.shared.state() == PlayerState::Playing;
        if !playing {
            self.playlist.lock().await.replace(tracks);
            return Ok(());
        }

        self.resolve_existing_crossfade().await;
        let first = tracks[0].clone();
        {
            let mut playlist = self.playlist.lock().await;
            playlist.replace(tracks);
        }
        let (duration, curve) = self.transition_params().await;
        self.crossfader
            .begin(&first, duration, curve, CrossfadeKind::ManualChange)
            .await?;
        self.mirror_incoming_track().await;
        self.prefetch_next();
        Ok(())
    }

    /// Warm the cache for the upcoming playlist entry
    pub async fn preload_next(&self) -> Result<()> {
        let repeat = self.config.read().await.repeat_mode;
        let next = self.playlist.lock().await.peek_next(repeat).cloned();
        match next {
            Some(next) => {
                let normalize = self.config.read().await.normalize_loudness;
                self.cache.preload(&next.uri, normalize).await
            }
            None => Err(Error::NoNextTrack),
        }
    }

    pub async fn peek_next_track(&self) -> Option<Track> {
        let repeat = self.config.read().await.repeat_mode;
        self.playlist.lock().await.peek_next(repeat).cloned()
    }

    pub async fn peek_previous_track(&self) -> Option<Track> {
        let repeat = self.config.read().await.repeat_mode;
        self.playlist.lock().await.peek_previous(repeat).cloned()
    }

    /// Crossfade to the next playlist entry. Rate-limited to one skip per
    /// half second; the returned track is the transition target.
    pub async fn skip_to_next(self: &Arc<Self>) -> Result<Track> {
        self.skip_track(true).await
    }

    /// Crossfade to the previous playlist entry
    pub async fn skip_to_previous(self: &Arc<Self>) -> Result<Track> {
        self.skip_track(false).await
    }

    async fn skip_track(self: &Arc<Self>, forward: bool) -> Result<Track> {
        self.acquire_skip_gate()?;
        let this = Arc::clone(self);
        let result = self
            .ops
            .run(OpPriority::High, "skip_track", async move {
                this.do_skip_track(forward).await
            })
            .await;
        self.skip_in_progress.store(false, Ordering::SeqCst);
        result?
    }

    fn acquire_skip_gate(&self) -> Result<()> {
        if self
            .skip_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::RateLimited("another skip is in flight".to_string()));
        }
        let mut last = self.last_skip.lock().expect("skip lock");
        if let Some(at) = *last {
            if at.elapsed() < SKIP_MIN_INTERVAL {
                self.skip_in_progress.store(false, Ordering::SeqCst);
                return Err(Error::RateLimited(format!(
                    "skips are limited to one per {SKIP_MIN_INTERVAL:?}"
                )));
            }
        }
        *last = Some(tokio::time::Instant::now());
        Ok(())
    }

    async fn do_skip_track(self: Arc<Self>, forward: bool) -> Result<Track> {
        let state = self.shared.state();
        if state != PlayerState::Playing {
            return Err(Error::invalid_state(state, "skip track"));
        }
        let repeat = self.config.read().await.repeat_mode;
        {
            let playlist = self.playlist.lock().await;
            let peeked = if forward {
                playlist.peek_next(repeat)
            } else {
                playlist.peek_previous(repeat)
            };
            if peeked.is_none() {
                return Err(if forward {
                    Error::NoNextTrack
                } else {
                    Error::NoPreviousTrack
                });
            }
        }

        self.resolve_existing_crossfade().await;

        let target = {
            let mut playlist = self.playlist.lock().await;
            if forward {
                playlist.advance_next(repeat)
            } else {
                playlist.advance_previous(repeat)
            }
        }
        .ok_or(if forward {
            Error::NoNextTrack
        } else {
            Error::NoPreviousTrack
        })?;

        let (duration, curve) = self.transition_params().await;
        self.crossfader
            .begin(&target, duration, curve, CrossfadeKind::ManualChange)
            .await?;
        self.mirror_incoming_track().await;
        self.prefetch_next();
        Ok(target)
    }

    /// Apply the replacement policy to a crossfade already in flight
    async fn resolve_existing_crossfade(&self) {
        if !self.crossfader.is_in_progress().await {
            return;
        }
        let progress = self.crossfader.current_progress().fraction();
        match replace_plan(progress) {
            ReplacePlan::Rollback => {
                debug!(progress, "early crossfade, rolling back");
                let _ = self.crossfader.rollback_current(CANCEL_FADE).await;
            }
            ReplacePlan::WaitForCompletion => {
                debug!(progress, "late crossfade, waiting for completion");
                self.crossfader.wait_near_completion().await;
            }
            ReplacePlan::FastForward => {
                debug!(progress, "mid crossfade, fast-forwarding");
                let _ = self.crossfader.fast_forward_current(CANCEL_FADE).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Overlay operations
    // ------------------------------------------------------------------

    pub async fn play_overlay(self: &Arc<Self>, uri: &str) -> Result<()> {
        let this = Arc::clone(self);
        let uri = uri.to_string();
        self.ops
            .run(OpPriority::Normal, "play_overlay", async move {
                this.overlay.play(&uri).await
            })
            .await?
    }

    pub fn set_overlay_configuration(&self, config: OverlayConfig) -> Result<()> {
        self.overlay.set_config(config)
    }

    pub fn set_overlay_volume(&self, volume: f32) {
        self.overlay.set_volume(volume);
    }

    pub fn set_overlay_loop_mode(&self, mode: LoopMode) -> Result<()> {
        self.overlay.set_loop_mode(mode)
    }

    pub fn set_overlay_loop_delay(&self, delay: Duration) {
        self.overlay.set_loop_delay(delay);
    }

    pub async fn stop_overlay(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "stop_overlay", async move {
                this.overlay.stop().await;
                Ok(())
            })
            .await?
    }

    pub fn pause_overlay(&self) {
        self.overlay.pause();
    }

    pub fn resume_overlay(&self) {
        self.overlay.resume();
    }

    // ------------------------------------------------------------------
    // Sound effect operations
    // ------------------------------------------------------------------

    pub async fn play_sound_effect(
        self: &Arc<Self>,
        effect: SoundEffect,
        fade_in: Duration,
    ) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "play_sound_effect", async move {
                this.effects.play(&effect, fade_in).await
            })
            .await?
    }

    pub async fn stop_sound_effect(self: &Arc<Self>, fade_out: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "stop_sound_effect", async move {
                this.effects.stop(fade_out).await;
                Ok(())
            })
            .await?
    }

    pub async fn set_sound_effect_volume(&self, volume: f32) {
        self.effects.set_master_volume(volume).await;
    }

    pub async fn preload_sound_effects(self: &Arc<Self>, effects: Vec<SoundEffect>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "preload_sound_effects", async move {
                this.effects.preload(&effects).await
            })
            .await?
    }

    pub async fn unload_sound_effects(self: &Arc<Self>, uris: Vec<String>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "unload_sound_effects", async move {
                this.effects.unload(&uris).await;
                Ok(())
            })
            .await?
    }

    // ------------------------------------------------------------------
    // Compound operations
    // ------------------------------------------------------------------

    /// Pause main, overlay, and effects in one step
    pub async fn pause_all(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "pause_all", async move {
                this.pause_all_now().await
            })
            .await?
    }

    /// Resume main and overlay
    pub async fn resume_all(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::Normal, "resume_all", async move {
                this.resume_all_now().await
            })
            .await?
    }

    /// Stop every layer
    pub async fn stop_all(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.ops
            .run(OpPriority::UserInteractive, "stop_all", async move {
                this.overlay.stop().await;
                this.effects.stop(Duration::ZERO).await;
                this.do_stop(Duration::ZERO).await;
                Ok(())
            })
            .await?
    }

    async fn pause_all_now(self: &Arc<Self>) -> Result<()> {
        Arc::clone(self).do_pause().await?;
        self.overlay.pause();
        self.effects.stop(Duration::ZERO).await;
        Ok(())
    }

    async fn resume_all_now(self: &Arc<Self>) -> Result<()> {
        Arc::clone(self).do_resume().await?;
        self.overlay.resume();
        Ok(())
    }

    /// Tear down: stop all layers, halt the graph, abort background tasks
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.stop_all().await;
        self.session.shutdown().await;
        self.ops.shutdown();
        for task in self.tasks.lock().expect("tasks lock").drain(..) {
            task.abort();
        }
        info!("player shut down");
    }

    // ------------------------------------------------------------------
    // Internal machinery
    // ------------------------------------------------------------------

    async fn transition_params(&self) -> (Duration, FadeCurve) {
        let config = self.config.read().await;
        (config.crossfade_duration, config.fade_curve)
    }

    /// Load with file-load lifecycle events
    async fn load_track(&self, slot: SlotId, track: &Track) -> Result<Track> {
        self.shared.events.emit(PlayerEvent::FileLoadStarted {
            uri: track.uri.clone(),
            timestamp: Utc::now(),
        });
        match self.engine.load_into_slot(slot, track).await {
            Ok(loaded) => {
                self.shared.events.emit(PlayerEvent::FileLoadFinished {
                    uri: loaded.uri.clone(),
                    duration: loaded.duration().unwrap_or(0.0),
                    timestamp: Utc::now(),
                });
                if let Some(info) = loaded.info {
                    self.playlist.lock().await.attach_info(loaded.id, info);
                }
                Ok(loaded)
            }
            Err(error) => {
                self.shared.events.emit(PlayerEvent::FileLoadFailed {
                    uri: track.uri.clone(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
                Err(error)
            }
        }
    }

    async fn set_current(&self, track: Option<Track>) {
        self.shared.set_current_track(track.clone());
        self.shared.events.emit(PlayerEvent::TrackChanged {
            track,
            timestamp: Utc::now(),
        });
    }

    /// Mirror the track that just became the transition target
    async fn mirror_incoming_track(&self) {
        let incoming = self.engine.slot_track(self.engine.inactive_slot()).await;
        if let Some(track) = incoming {
            self.set_current(Some(track)).await;
        }
    }

    /// Fire-and-forget warm-up of the next playlist entry
    fn prefetch_next(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let repeat = this.config.read().await.repeat_mode;
            let next = this.playlist.lock().await.peek_next(repeat).cloned();
            if let Some(next) = next {
                let normalize = this.config.read().await.normalize_loudness;
                if let Err(error) = this.cache.preload(&next.uri, normalize).await {
                    debug!(uri = %next.uri, %error, "prefetch failed");
                }
            }
        });
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("tasks lock");

        // position ticker + automatic transition arming
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.position_ticker().await;
        }));

        // natural-end listener
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.natural_end_loop().await;
        }));

        // session signals
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.session.start().await;
            let Some(mut signals) = this.session.take_signals().await else {
                return;
            };
            while let Some(signal) = signals.recv().await {
                this.handle_session_signal(signal).await;
            }
        }));
    }

    async fn position_ticker(self: Arc<Self>) {
        let mut tick: u32 = 0;
        let mut armed = false;
        let mut end_fallback_armed = false;
        loop {
            tokio::time::sleep(POSITION_TICK).await;
            tick = tick.wrapping_add(1);
            if self.shared.state() != PlayerState::Playing {
                continue;
            }

            let position = self.engine.position().await;
            if tick % 5 == 0 {
                self.shared.set_position(position);
            }
            if position.duration <= 0.0 {
                continue;
            }

            let (configured, repeat, repeat_count) = {
                let config = self.config.read().await;
                (
                    config.crossfade_duration,
                    config.repeat_mode,
                    config.repeat_count,
                )
            };
            // a loop never fades longer than 40% of the material; playlist
            // advances always use the configured duration
            let transition = match repeat {
                RepeatMode::SingleTrack => configured
                    .min(Duration::from_secs_f64(position.duration * 0.4))
                    .max(Duration::from_millis(100)),
                RepeatMode::Playlist | RepeatMode::Off => configured,
            };
            let threshold = position.duration - transition.as_secs_f64();
            let end_guard = position.duration - 0.5;

            // single-shot hysteresis on both triggers
            if position.current_time < threshold {
                armed = true;
            }
            if position.current_time < end_guard {
                end_fallback_armed = true;
            }

            if armed
                && position.current_time >= threshold
                && !self.crossfader.is_in_progress().await
                && !self.crossfader.has_paused_snapshot().await
            {
                armed = false;
                if let Err(error) = self.automatic_transition(repeat, repeat_count, transition).await
                {
                    warn!(%error, "automatic transition failed");
                }
            }

            // the natural-end callback can be late or absent; once the track
            // is within half a second of its end with no transition running,
            // advance the hard way
            if end_fallback_armed
                && position.current_time >= end_guard
                && !self.crossfader.is_in_progress().await
                && !self.crossfader.has_paused_snapshot().await
            {
                end_fallback_armed = false;
                debug!(at = position.current_time, "end-of-track fallback");
                if let Err(error) = self.handle_natural_end(repeat, repeat_count).await {
                    warn!(%error, "end-of-track fallback failed");
                }
            }
        }
    }

    async fn automatic_transition(
        self: &Arc<Self>,
        repeat: RepeatMode,
        repeat_count: u32,
        transition: Duration,
    ) -> Result<()> {
        let curve = self.config.read().await.fade_curve;
        match repeat {
            RepeatMode::SingleTrack => {
                let Some(current) = self.shared.current_track() else {
                    return Ok(());
                };
                info!(uri = %current.uri, "gapless loop transition");
                self.crossfader
                    .begin(&current, transition, curve, CrossfadeKind::AutomaticLoop)
                    .await
            }
            RepeatMode::Playlist | RepeatMode::Off => {
                let Some(next) = self.peek_bounded(repeat, repeat_count).await else {
                    // end of material: the natural-end listener finishes
                    return Ok(());
                };
                info!(uri = %next.uri, "gapless advance transition");
                self.crossfader
                    .begin(&next, transition, curve, CrossfadeKind::AutomaticLoop)
                    .await?;
                // only move the cursor once the transition is actually running
                self.commit_advance(repeat).await;
                self.mirror_incoming_track().await;
                self.prefetch_next();
                Ok(())
            }
        }
    }

    /// Upcoming track honoring repeat mode and the bounded playlist repeat
    /// count, without moving the cursor
    async fn peek_bounded(&self, repeat: RepeatMode, repeat_count: u32) -> Option<Track> {
        let playlist = self.playlist.lock().await;
        match repeat {
            RepeatMode::SingleTrack => playlist.current().cloned(),
            RepeatMode::Off => playlist.peek_next(RepeatMode::Off).cloned(),
            RepeatMode::Playlist => {
                let wrapping = playlist.cursor() + 1 >= playlist.len();
                if wrapping && repeat_count > 0 && playlist.completed_cycles() + 1 > repeat_count {
                    return None;
                }
                playlist.peek_next(RepeatMode::Playlist).cloned()
            }
        }
    }

    async fn commit_advance(&self, repeat: RepeatMode) {
        self.playlist.lock().await.advance_next(repeat);
    }

    async fn natural_end_loop(self: Arc<Self>) {
        loop {
            let Some(slot) = self.engine.next_natural_end().await else {
                break;
            };
            debug!(%slot, "natural end");
            if self.crossfader.is_in_progress().await
                || self.shared.state() != PlayerState::Playing
            {
                continue;
            }
            let (repeat, repeat_count) = {
                let config = self.config.read().await;
                (config.repeat_mode, config.repeat_count)
            };
            let result = self.handle_natural_end(repeat, repeat_count).await;
            if let Err(error) = result {
                error!(%error, "natural-end handling failed");
                self.engine.stop().await;
                self.shared.set_state(PlayerState::Failed(error.to_string()));
            }
        }
    }

    async fn handle_natural_end(
        self: &Arc<Self>,
        repeat: RepeatMode,
        repeat_count: u32,
    ) -> Result<()> {
        match repeat {
            RepeatMode::SingleTrack => {
                // the position trigger normally loops earlier; restart from
                // the top if the file ran out anyway
                self.engine.schedule_active(None).await?;
                self.shared.set_position(self.engine.position().await);
                Ok(())
            }
            RepeatMode::Playlist | RepeatMode::Off => {
                match self.peek_bounded(repeat, repeat_count).await {
                    Some(next) => {
                        let loaded = self.load_track(self.engine.active_slot(), &next).await?;
                        self.commit_advance(repeat).await;
                        self.set_current(Some(loaded)).await;
                        self.engine.schedule_active(None).await?;
                        self.prefetch_next();
                        Ok(())
                    }
                    None => {
                        info!("playlist exhausted");
                        Arc::clone(self).do_stop(Duration::ZERO).await;
                        Ok(())
                    }
                }
            }
        }
    }

    async fn handle_session_signal(self: &Arc<Self>, signal: SessionSignal) {
        debug!(?signal, "session signal");
        match signal {
            SessionSignal::InterruptionPause => {
                if self.shared.state() == PlayerState::Playing {
                    self.paused_by_interruption.store(true, Ordering::SeqCst);
                    let _ = self.pause_all_now().await;
                }
            }
            SessionSignal::InterruptionResume => {
                if self.paused_by_interruption.swap(false, Ordering::SeqCst) {
                    let _ = self.resume_all_now().await;
                }
            }
            SessionSignal::RouteLost | SessionSignal::CategoryIncompatible(_) => {
                let _ = self.pause_all_now().await;
            }
            SessionSignal::Recover => {
                if let Err(error) = self.recover().await {
                    error!(%error, "media-services recovery failed");
                    self.shared
                        .set_state(PlayerState::Failed(error.to_string()));
                }
            }
        }
    }

    /// Rebuild the audio stack after a media-services reset and restore the
    /// interrupted position.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let state = self.shared.state();
        if !matches!(state, PlayerState::Playing | PlayerState::Paused | PlayerState::FadingOut) {
            debug!(%state, "media services reset with nothing to restore");
            return Ok(());
        }
        let was_playing = state == PlayerState::Playing;
        let position = self.shared.position().current_time;
        info!(was_playing, position, "recovering from media services reset");

        self.shared.set_state(PlayerState::Paused);
        self.crossfader.abort().await;
        self.engine.mark_not_running();

        let options = self.config.read().await.session_options;
        self.session.configure(options, true)?;
        self.session.reactivate()?;
        self.engine.start()?;

        if let Some(track) = self.shared.current_track() {
            self.load_track(self.engine.active_slot(), &track).await?;
            self.engine.schedule_active(None).await?;
            self.engine.seek(Duration::from_secs_f64(position)).await?;
            if was_playing {
                self.shared.set_state(PlayerState::Playing);
            } else {
                self.engine.pause().await;
            }
            self.shared.set_position(self.engine.position().await);
        }
        Ok(())
    }
}

//! Dual-slot playback engine
//!
//! Owns the node graph: two player/mixer pairs for the gapless main layer,
//! plus the overlay and effects node pairs which are attached here and handed
//! off once. All mixer volume writes for the main layer happen in this
//! module, so fades, crossfades and `set_volume` interleave without races.
//!
//! Completion callbacks carry the schedule generation they were registered
//! under; a callback only becomes a natural-end event if its generation still
//! matches the slot and the slot is still active.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::cache::{AudioFileCache, LoadPriority};
use crate::error::{Error, Result};
use crate::host::{AudioGraph, MixerNode, PlayerNode, RenderTime};
use crate::state::PositionInfo;
use crate::types::{DecodedBuffer, SlotId, Track, TrackInfo};

use super::curves::FadeCurve;

/// Lead time for phase-locking the incoming player to the render timeline
pub(crate) const SYNC_LEAD_SAMPLES: u64 = 8192;
/// Click-elimination fade when silencing the outgoing player
pub(crate) const STOP_FADE: Duration = Duration::from_millis(20);

/// Fade step rate buckets: more steps per second for short fades
pub(crate) fn steps_per_second(duration: Duration) -> u32 {
    let secs = duration.as_secs_f32();
    if secs < 1.0 {
        100
    } else if secs < 5.0 {
        50
    } else if secs < 15.0 {
        30
    } else {
        20
    }
}

/// Cooperative controls for an in-flight crossfade
#[derive(Default)]
pub struct CrossfadeControl {
    cancelled: AtomicBool,
    pause_requested: AtomicBool,
}

impl CrossfadeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }
}

/// How a crossfade volume ramp ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FadeOutcome {
    Completed,
    /// Pause was requested mid-ramp; both mixers hold the captured values
    Paused {
        active_volume: f32,
        inactive_volume: f32,
        elapsed: Duration,
    },
    Cancelled,
}

/// Fade a mixer between two volumes, checking cancellation between steps.
///
/// Writes the exact target at the end unless cancelled; a cancelled fade
/// leaves the last stepped value in place so rollback or fast-forward can
/// take over from it. Returns true when the fade ran to completion.
pub(crate) async fn fade_mixer(
    mixer: &Arc<dyn MixerNode>,
    from: f32,
    to: f32,
    duration: Duration,
    curve: FadeCurve,
    cancel: Option<&AtomicBool>,
) -> bool {
    if duration.is_zero() {
        mixer.set_volume(to);
        return true;
    }
    let steps = (steps_per_second(duration) as f32 * duration.as_secs_f32()).ceil() as u32;
    let steps = steps.max(1);
    let step_duration = duration / steps;

    for step in 1..=steps {
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
        }
        tokio::time::sleep(step_duration).await;
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
        }
        if step == steps {
            mixer.set_volume(to);
        } else {
            let p = step as f32 / steps as f32;
            mixer.set_volume(from + (to - from) * curve.fade_in(p));
        }
    }
    true
}

/// A loaded track occupying a slot
#[derive(Clone)]
pub struct SlotAudio {
    pub track: Track,
    pub buffer: Arc<DecodedBuffer>,
    normalized: bool,
}

#[derive(Default)]
struct SlotData {
    audio: Option<SlotAudio>,
    /// Playback base position within the file, in file frames
    offset_frames: u64,
}

struct Slot {
    id: SlotId,
    player: Arc<dyn PlayerNode>,
    mixer: Arc<dyn MixerNode>,
    generation: AtomicU64,
    data: Mutex<SlotData>,
}

impl Slot {
    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Node pair handed off to the overlay or effects layer at setup
pub struct NodePair {
    pub player: Arc<dyn PlayerNode>,
    pub mixer: Arc<dyn MixerNode>,
}

/// The dual-slot engine core
pub struct AudioEngine {
    graph: Arc<dyn AudioGraph>,
    cache: Arc<AudioFileCache>,
    slots: [Slot; 2],
    active: std::sync::RwLock<SlotId>,
    target_volume: std::sync::RwLock<f32>,
    running: AtomicBool,
    crossfade_active: AtomicBool,
    normalize_loads: AtomicBool,
    /// Raw (slot, generation) completions from the host
    completion_tx: mpsc::UnboundedSender<(SlotId, u64)>,
    completion_rx: Mutex<mpsc::UnboundedReceiver<(SlotId, u64)>>,
    fade_in_cancel: std::sync::Mutex<Option<Arc<AtomicBool>>>,
    overlay_nodes: std::sync::Mutex<Option<NodePair>>,
    effect_nodes: std::sync::Mutex<Option<NodePair>>,
}

impl AudioEngine {
    /// Attach and connect the full node set. Initial volumes: slots and
    /// overlay at 0, main at 1.
    pub fn new(graph: Arc<dyn AudioGraph>, cache: Arc<AudioFileCache>, normalize_loads: bool) -> Result<Self> {
        let make_slot = |id: SlotId, player_label: &str, mixer_label: &str| -> Result<Slot> {
            let player = graph.attach_player(player_label);
            let mixer = graph.attach_mixer(mixer_label);
            graph
                .connect(&player, &mixer)
                .map_err(|e| Error::EngineStartFailed { reason: e.to_string() })?;
            mixer.set_volume(0.0);
            Ok(Slot {
                id,
                player,
                mixer,
                generation: AtomicU64::new(0),
                data: Mutex::new(SlotData::default()),
            })
        };

        let slot_a = make_slot(SlotId::A, "player-a", "mixer-a")?;
        let slot_b = make_slot(SlotId::B, "player-b", "mixer-b")?;

        let overlay_player = graph.attach_player("overlay");
        let overlay_mixer = graph.attach_mixer("overlay-mixer");
        graph
            .connect(&overlay_player, &overlay_mixer)
            .map_err(|e| Error::EngineStartFailed { reason: e.to_string() })?;
        overlay_mixer.set_volume(0.0);

        let effect_player = graph.attach_player("effects");
        let effect_mixer = graph.attach_mixer("effects-mixer");
        graph
            .connect(&effect_player, &effect_mixer)
            .map_err(|e| Error::EngineStartFailed { reason: e.to_string() })?;
        effect_mixer.set_volume(1.0);

        graph.main_mixer().set_volume(1.0);

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Ok(Self {
            graph,
            cache,
            slots: [slot_a, slot_b],
            active: std::sync::RwLock::new(SlotId::A),
            target_volume: std::sync::RwLock::new(1.0),
            running: AtomicBool::new(false),
            crossfade_active: AtomicBool::new(false),
            normalize_loads: AtomicBool::new(normalize_loads),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            fade_in_cancel: std::sync::Mutex::new(None),
            overlay_nodes: std::sync::Mutex::new(Some(NodePair {
                player: overlay_player,
                mixer: overlay_mixer,
            })),
            effect_nodes: std::sync::Mutex::new(Some(NodePair {
                player: effect_player,
                mixer: effect_mixer,
            })),
        })
    }

    fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.index()]
    }

    pub fn active_slot(&self) -> SlotId {
        *self.active.read().expect("active lock")
    }

    pub fn inactive_slot(&self) -> SlotId {
        self.active_slot().other()
    }

    pub fn target_volume(&self) -> f32 {
        *self.target_volume.read().expect("volume lock")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clear the running flag without touching the graph (reset recovery)
    pub fn mark_not_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_crossfade_active(&self) -> bool {
        self.crossfade_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_crossfade_active(&self, active: bool) {
        self.crossfade_active.store(active, Ordering::SeqCst);
    }

    pub fn set_normalize_loads(&self, normalize: bool) {
        self.normalize_loads.store(normalize, Ordering::SeqCst);
    }

    pub fn current_generation(&self, slot: SlotId) -> u64 {
        self.slot(slot).current_generation()
    }

    /// Overlay node pair; present exactly once, taken by the overlay layer
    pub fn take_overlay_nodes(&self) -> Option<NodePair> {
        self.overlay_nodes.lock().expect("overlay nodes lock").take()
    }

    /// Effects node pair; present exactly once, taken by the effects layer
    pub fn take_effect_nodes(&self) -> Option<NodePair> {
        self.effect_nodes.lock().expect("effect nodes lock").take()
    }

    pub fn mixer_volume(&self, slot: SlotId) -> f32 {
        self.slot(slot).mixer.volume()
    }

    /// Start the host graph
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.graph
            .start()
            .map_err(|e| Error::EngineStartFailed { reason: e.to_string() })?;
        self.running.store(true, Ordering::SeqCst);
        info!("engine started");
        Ok(())
    }

    /// Halt everything: generations bump first so in-flight completions go
    /// stale, then players stop, mixers and offsets reset.
    pub async fn stop(&self) {
        self.cancel_fade_in();
        for slot in &self.slots {
            slot.bump_generation();
        }
        for slot in &self.slots {
            slot.player.stop();
            slot.mixer.set_volume(0.0);
            let mut data = slot.data.lock().await;
            data.offset_frames = 0;
        }
        self.set_crossfade_active(false);
        self.graph.stop();
        self.running.store(false, Ordering::SeqCst);
        info!("engine stopped");
    }

    /// Load a track's audio into a slot, pinning it in the cache. Returns the
    /// track augmented with duration and format.
    pub async fn load_into_slot(&self, slot_id: SlotId, track: &Track) -> Result<Track> {
        let normalize = self.normalize_loads.load(Ordering::SeqCst);
        let audio = self
            .cache
            .get(&track.uri, normalize, LoadPriority::Playback)
            .await?;
        self.cache.pin(&track.uri, normalize).await;

        let mut loaded = track.clone();
        loaded.info = Some(TrackInfo {
            duration: audio.buffer.duration_secs(),
            sample_rate: audio.buffer.sample_rate,
            channels: audio.buffer.channel_count() as u16,
            interleaved: audio.was_interleaved,
        });

        let slot = self.slot(slot_id);
        let mut data = slot.data.lock().await;
        if let Some(previous) = data.audio.take() {
            self.cache.unpin(&previous.track.uri, previous.normalized).await;
        }
        data.audio = Some(SlotAudio {
            track: loaded.clone(),
            buffer: Arc::clone(&audio.buffer),
            normalized: normalize,
        });
        data.offset_frames = 0;
        debug!(slot = %slot_id, uri = %track.uri, "loaded into slot");
        Ok(loaded)
    }

    /// The track currently loaded in a slot
    pub async fn slot_track(&self, slot_id: SlotId) -> Option<Track> {
        let data = self.slot(slot_id).data.lock().await;
        data.audio.as_ref().map(|a| a.track.clone())
    }

    fn tagged_completion(&self, slot_id: SlotId, generation: u64) -> crate::host::CompletionHandler {
        let tx = self.completion_tx.clone();
        Box::new(move || {
            let _ = tx.send((slot_id, generation));
        })
    }

    /// Schedule the active slot's file from the top and begin playback,
    /// optionally fading the mixer in from silence.
    pub async fn schedule_active(&self, fade_in: Option<(Duration, FadeCurve)>) -> Result<()> {
        let slot_id = self.active_slot();
        let slot = self.slot(slot_id);
        let buffer = {
            let mut data = slot.data.lock().await;
            data.offset_frames = 0;
            Arc::clone(
                &data
                    .audio
                    .as_ref()
                    .ok_or_else(|| Error::invalid_state("empty slot", "schedule"))?
                    .buffer,
            )
        };

        let generation = slot.bump_generation();
        slot.player.stop();
        slot.player
            .schedule_file(buffer, self.tagged_completion(slot_id, generation));
        slot.player.play();

        let target = self.target_volume();
        match fade_in {
            Some((duration, curve)) if !duration.is_zero() => {
                slot.mixer.set_volume(0.0);
                self.spawn_fade_in(slot_id, target, duration, curve);
            }
            _ => slot.mixer.set_volume(target),
        }
        debug!(slot = %slot_id, generation, "scheduled active slot");
        Ok(())
    }

    fn spawn_fade_in(&self, slot_id: SlotId, target: f32, duration: Duration, curve: FadeCurve) {
        self.cancel_fade_in();
        let cancel = Arc::new(AtomicBool::new(false));
        *self.fade_in_cancel.lock().expect("fade-in lock") = Some(Arc::clone(&cancel));
        let mixer = Arc::clone(&self.slot(slot_id).mixer);
        tokio::spawn(async move {
            fade_mixer(&mixer, 0.0, target, duration, curve, Some(&cancel)).await;
        });
    }

    /// Cancel an in-flight fade-in, leaving the mixer where it is
    pub fn cancel_fade_in(&self) {
        if let Some(cancel) = self.fade_in_cancel.lock().expect("fade-in lock").take() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Seek the active slot, clamped to [0, duration). Cancels a fade-in,
    /// bumps the generation, and reschedules the file tail from the target
    /// frame. Playback resumes if the player was playing.
    pub async fn seek(&self, time: Duration) -> Result<f64> {
        self.cancel_fade_in();
        let slot_id = self.active_slot();
        let slot = self.slot(slot_id);
        let was_playing = slot.player.is_playing();

        let mut data = slot.data.lock().await;
        let audio = data
            .audio
            .as_ref()
            .ok_or_else(|| Error::invalid_state("empty slot", "seek"))?;
        let buffer = Arc::clone(&audio.buffer);
        let file_rate = buffer.sample_rate as f64;
        let max_frame = buffer.frames().saturating_sub(1) as u64;
        let frame = ((time.as_secs_f64() * file_rate) as u64).min(max_frame);

        let generation = slot.bump_generation();
        slot.player.stop();
        data.offset_frames = frame;
        slot.player.schedule_segment(
            buffer,
            frame,
            self.tagged_completion(slot_id, generation),
        );
        if was_playing {
            slot.player.play();
        }
        let seconds = frame as f64 / file_rate;
        debug!(slot = %slot_id, seconds, "seek");
        Ok(seconds)
    }

    /// Position within a slot's file in seconds: captured offset plus live
    /// render progress while playing
    pub async fn slot_position(&self, slot_id: SlotId) -> f64 {
        let slot = self.slot(slot_id);
        let data = slot.data.lock().await;
        let Some(audio) = data.audio.as_ref() else {
            return 0.0;
        };
        let base = data.offset_frames as f64 / audio.buffer.sample_rate as f64;
        let rendered = if slot.player.is_playing() {
            slot.player
                .last_render_time()
                .map(|t| t.seconds())
                .unwrap_or(0.0)
        } else {
            0.0
        };
        (base + rendered).min(audio.buffer.duration_secs())
    }

    /// Fold live render progress into a slot's offset and pause its player
    async fn capture_and_pause_slot(&self, slot_id: SlotId) -> f64 {
        let position = self.slot_position(slot_id).await;
        let slot = self.slot(slot_id);
        let mut data = slot.data.lock().await;
        if let Some(audio) = data.audio.as_ref() {
            data.offset_frames = (position * audio.buffer.sample_rate as f64) as u64;
        }
        slot.player.pause();
        position
    }

    /// Capture the current position into the slot offset and pause both
    /// players. A pending fade-in is cancelled before the capture.
    pub async fn pause(&self) {
        self.cancel_fade_in();
        let at = self.capture_and_pause_slot(self.active_slot()).await;
        self.slot(self.inactive_slot()).player.pause();
        debug!(at, "paused");
    }

    /// Pause both players mid-crossfade, capturing both offsets. Returns the
    /// (active, inactive) positions in seconds for the pause snapshot.
    pub async fn pause_crossfading(&self) -> (f64, f64) {
        self.cancel_fade_in();
        let active = self.capture_and_pause_slot(self.active_slot()).await;
        let inactive = self.capture_and_pause_slot(self.inactive_slot()).await;
        debug!(active, inactive, "paused mid-crossfade");
        (active, inactive)
    }

    /// Reschedule both slots from their captured offsets and play them, for
    /// resuming a paused crossfade.
    pub async fn resume_both(&self) -> Result<()> {
        for slot in &self.slots {
            let (buffer, offset) = {
                let data = slot.data.lock().await;
                match data.audio.as_ref() {
                    Some(audio) => (Arc::clone(&audio.buffer), data.offset_frames),
                    None => continue,
                }
            };
            let generation = slot.bump_generation();
            slot.player.stop();
            slot.player
                .schedule_segment(buffer, offset, self.tagged_completion(slot.id, generation));
            slot.player.play();
        }
        Ok(())
    }

    /// Whether the active slot's player is rendering
    pub fn active_player_playing(&self) -> bool {
        self.slot(self.active_slot()).player.is_playing()
    }

    /// Resume from pause: reschedule the active file tail from the captured
    /// offset and play.
    pub async fn play(&self) -> Result<()> {
        let slot_id = self.active_slot();
        let slot = self.slot(slot_id);
        if slot.player.is_playing() {
            return Ok(());
        }
        let (buffer, offset) = {
            let data = slot.data.lock().await;
            let audio = data
                .audio
                .as_ref()
                .ok_or_else(|| Error::invalid_state("empty slot", "play"))?;
            (Arc::clone(&audio.buffer), data.offset_frames)
        };
        let generation = slot.bump_generation();
        slot.player.stop();
        slot.player
            .schedule_segment(buffer, offset, self.tagged_completion(slot_id, generation));
        slot.player.play();
        debug!(slot = %slot_id, offset, "resumed");
        Ok(())
    }

    /// Clamp and apply the target volume. The main mixer updates immediately;
    /// the active mixer follows only when no crossfade is in flight.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.target_volume.write().expect("volume lock") = volume;
        self.graph.main_mixer().set_volume(volume);
        if !self.is_crossfade_active() {
            self.slot(self.active_slot()).mixer.set_volume(volume);
        }
    }

    /// Fade the active mixer to an explicit level (facade pause/stop paths)
    pub async fn fade_active_to(&self, to: f32, duration: Duration, curve: FadeCurve) {
        let mixer = Arc::clone(&self.slot(self.active_slot()).mixer);
        let from = mixer.volume();
        fade_mixer(&mixer, from, to, duration, curve, None).await;
    }

    // ------------------------------------------------------------------
    // Crossfade primitives (driven by the orchestrator)
    // ------------------------------------------------------------------

    /// Schedule the inactive slot's loaded file at volume 0 without playing
    pub async fn prepare_inactive(&self) -> Result<()> {
        let slot_id = self.inactive_slot();
        let slot = self.slot(slot_id);
        let buffer = {
            let mut data = slot.data.lock().await;
            data.offset_frames = 0;
            Arc::clone(
                &data
                    .audio
                    .as_ref()
                    .ok_or_else(|| Error::invalid_state("empty inactive slot", "prepare"))?
                    .buffer,
            )
        };
        let generation = slot.bump_generation();
        slot.player.reset();
        slot.mixer.set_volume(0.0);
        slot.player
            .schedule_file(buffer, self.tagged_completion(slot_id, generation));
        debug!(slot = %slot_id, generation, "prepared inactive slot");
        Ok(())
    }

    /// Future render-timeline anchor for phase-locked starts
    pub fn synced_start_time(&self) -> Option<RenderTime> {
        let slot = self.slot(self.active_slot());
        slot.player.last_render_time().map(|t| RenderTime {
            sample_time: t.sample_time + SYNC_LEAD_SAMPLES,
            sample_rate: t.sample_rate,
        })
    }

    /// Run the crossfade volume ramp: active follows the fade-out curve,
    /// inactive the fade-in curve, both scaled by the target volume.
    /// `progress` is invoked once per substep with p ∈ [0, 1].
    pub async fn execute_crossfade(
        &self,
        duration: Duration,
        curve: FadeCurve,
        control: &CrossfadeControl,
        progress: impl Fn(f32) + Send,
    ) -> FadeOutcome {
        let active = self.slot(self.active_slot());
        let inactive = self.slot(self.inactive_slot());

        self.set_crossfade_active(true);
        match self.synced_start_time() {
            Some(at) => inactive.player.play_at(at),
            None => inactive.player.play(),
        }

        let outcome = self
            .crossfade_ramp(duration, control, &progress, |p, target| {
                (curve.fade_out(p) * target, curve.fade_in(p) * target)
            })
            .await;

        match outcome {
            FadeOutcome::Completed => {
                active.mixer.set_volume(0.0);
                inactive.mixer.set_volume(self.target_volume());
                FadeOutcome::Completed
            }
            other => other,
        }
    }

    /// Resume ramp after a paused crossfade: linear from the captured
    /// volumes to (0, target) over the remaining duration.
    pub async fn fade_from_volumes(
        &self,
        active_from: f32,
        inactive_from: f32,
        remaining: Duration,
        control: &CrossfadeControl,
        progress: impl Fn(f32) + Send,
    ) -> FadeOutcome {
        self.set_crossfade_active(true);
        let outcome = self
            .crossfade_ramp(remaining, control, &progress, move |p, target| {
                (
                    active_from + (0.0 - active_from) * p,
                    inactive_from + (target - inactive_from) * p,
                )
            })
            .await;

        match outcome {
            FadeOutcome::Completed => {
                let active = self.slot(self.active_slot());
                let inactive = self.slot(self.inactive_slot());
                active.mixer.set_volume(0.0);
                inactive.mixer.set_volume(self.target_volume());
                FadeOutcome::Completed
            }
            other => other,
        }
    }

    async fn crossfade_ramp(
        &self,
        duration: Duration,
        control: &CrossfadeControl,
        progress: &(impl Fn(f32) + Send),
        volumes_at: impl Fn(f32, f32) -> (f32, f32),
    ) -> FadeOutcome {
        let active = self.slot(self.active_slot());
        let inactive = self.slot(self.inactive_slot());
        let steps = ((steps_per_second(duration) as f32 * duration.as_secs_f32()).ceil() as u32).max(1);
        let step_duration = duration / steps;

        for step in 0..=steps {
            if control.is_cancelled() {
                return FadeOutcome::Cancelled;
            }
            if control.pause_requested() {
                return FadeOutcome::Paused {
                    active_volume: active.mixer.volume(),
                    inactive_volume: inactive.mixer.volume(),
                    elapsed: step_duration * step,
                };
            }
            let p = step as f32 / steps as f32;
            let target = self.target_volume();
            let (active_volume, inactive_volume) = volumes_at(p, target);
            active.mixer.set_volume(active_volume);
            inactive.mixer.set_volume(inactive_volume);
            progress(p);
            if step < steps {
                tokio::time::sleep(step_duration).await;
            }
        }
        FadeOutcome::Completed
    }

    /// Cancel an in-flight crossfade by restoring the outgoing track: two
    /// parallel linear fades bring the active mixer back to target and the
    /// inactive down to 0, then the inactive player stops. Returns the active
    /// mixer volume observed before the restore.
    pub async fn rollback(&self, duration: Duration) -> f32 {
        let active = self.slot(self.active_slot());
        let inactive = self.slot(self.inactive_slot());
        let pre_rollback = active.mixer.volume();
        let target = self.target_volume();

        let up = fade_mixer(
            &active.mixer,
            pre_rollback,
            target,
            duration,
            FadeCurve::Linear,
            None,
        );
        let down = fade_mixer(
            &inactive.mixer,
            inactive.mixer.volume(),
            0.0,
            duration,
            FadeCurve::Linear,
            None,
        );
        tokio::join!(up, down);

        self.halt_slot(self.inactive_slot()).await;
        self.set_crossfade_active(false);
        info!("crossfade rolled back");
        pre_rollback
    }

    /// Complete an in-flight crossfade early: parallel fades to (0, target),
    /// then the active slot flips.
    pub async fn fast_forward(&self, duration: Duration) {
        let active = self.slot(self.active_slot());
        let inactive = self.slot(self.inactive_slot());
        let target = self.target_volume();

        let down = fade_mixer(
            &active.mixer,
            active.mixer.volume(),
            0.0,
            duration,
            FadeCurve::Linear,
            None,
        );
        let up = fade_mixer(
            &inactive.mixer,
            inactive.mixer.volume(),
            target,
            duration,
            FadeCurve::Linear,
            None,
        );
        tokio::join!(down, up);

        self.switch_active();
        self.set_crossfade_active(false);
        info!("crossfade fast-forwarded");
    }

    /// Flip which slot is active
    pub fn switch_active(&self) {
        let mut active = self.active.write().expect("active lock");
        *active = active.other();
        debug!(active = %*active, "switched active slot");
    }

    /// Silence and halt the inactive player: 20 ms safety fade, then stop,
    /// reset, zero volume and offset.
    pub async fn stop_inactive(&self) {
        let slot_id = self.inactive_slot();
        let slot = self.slot(slot_id);
        fade_mixer(
            &slot.mixer,
            slot.mixer.volume(),
            0.0,
            STOP_FADE,
            FadeCurve::Linear,
            None,
        )
        .await;
        self.halt_slot(slot_id).await;
    }

    async fn halt_slot(&self, slot_id: SlotId) {
        let slot = self.slot(slot_id);
        slot.bump_generation();
        slot.player.stop();
        slot.player.reset();
        slot.mixer.set_volume(0.0);
        let mut data = slot.data.lock().await;
        data.offset_frames = 0;
    }

    // ------------------------------------------------------------------
    // Position and natural-end
    // ------------------------------------------------------------------

    /// Current position in the active track.
    ///
    /// While playing: `offset/file_rate + rendered/engine_rate` — the render
    /// clock runs at the output rate, which differs from the file rate for
    /// resampled material. While paused the captured offset stands alone.
    pub async fn position(&self) -> PositionInfo {
        let slot_id = self.active_slot();
        let duration = {
            let data = self.slot(slot_id).data.lock().await;
            match data.audio.as_ref() {
                Some(audio) => audio.buffer.duration_secs(),
                None => return PositionInfo::zero(),
            }
        };
        PositionInfo {
            current_time: self.slot_position(slot_id).await,
            duration,
        }
    }

    /// Await the next natural end of the active slot.
    ///
    /// Raw completions are filtered here: a completion yields iff its
    /// generation still matches the slot's current generation and the slot is
    /// still active. Single consumer.
    pub async fn next_natural_end(&self) -> Option<SlotId> {
        let mut rx = self.completion_rx.lock().await;
        loop {
            let (slot_id, generation) = rx.recv().await?;
            let current = self.slot(slot_id).current_generation();
            if generation != current {
                debug!(slot = %slot_id, generation, current, "discarding stale completion");
                continue;
            }
            if slot_id != self.active_slot() {
                debug!(slot = %slot_id, "discarding completion for inactive slot");
                continue;
            }
            return Some(slot_id);
        }
    }
}

//! Crossfade orchestrator
//!
//! Wraps every cross-slot transition in a state machine:
//! Preparing → Fading → Switching → Cleanup. The fade itself runs as a
//! background task so user operations (pause, skip, stop) can interrupt it;
//! interruption is cooperative through [`CrossfadeControl`] and resolves to
//! one of pause-with-snapshot, rollback, or fast-forward.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::PlayerEvent;
use crate::state::SharedState;
use crate::types::{CrossfadeKind, CrossfadePhase, CrossfadeProgress, SlotId, Track};

use super::curves::FadeCurve;
use super::engine::{AudioEngine, CrossfadeControl, FadeOutcome};

/// Pause after the switch before declaring the transition done
const CLEANUP_SETTLE: Duration = Duration::from_millis(50);
/// How long an incoming change waits for an almost-finished crossfade
const NEAR_END_WAIT: Duration = Duration::from_millis(1500);
/// Replacement policy boundaries on fractional progress
const ROLLBACK_BELOW: f32 = 0.2;
const WAIT_ABOVE: f32 = 0.9;

/// How a requested transition ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossfadeOutcome {
    Completed,
    Paused,
    Cancelled,
}

/// Everything needed to resume a crossfade that was paused mid-fade
#[derive(Debug, Clone)]
pub struct PausedCrossfade {
    pub active_volume: f32,
    pub inactive_volume: f32,
    pub active_position: f64,
    pub inactive_position: f64,
    pub active_slot: SlotId,
    pub remaining: Duration,
    pub curve: FadeCurve,
    pub kind: CrossfadeKind,
}

/// What an in-flight manual change should do about an existing crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePlan {
    /// Early: restore the outgoing track, then crossfade from it
    Rollback,
    /// Late: wait briefly for natural completion
    WaitForCompletion,
    /// Middle: complete early to the incoming track, then crossfade onward
    FastForward,
}

/// Pick the replacement plan for a manual change at fade progress `p`
pub fn replace_plan(progress: f32) -> ReplacePlan {
    if progress < ROLLBACK_BELOW {
        ReplacePlan::Rollback
    } else if progress > WAIT_ABOVE {
        ReplacePlan::WaitForCompletion
    } else {
        ReplacePlan::FastForward
    }
}

struct ActiveFade {
    control: Arc<CrossfadeControl>,
    done: watch::Receiver<Option<CrossfadeOutcome>>,
    duration: Duration,
    kind: CrossfadeKind,
}

async fn wait_done(done: &mut watch::Receiver<Option<CrossfadeOutcome>>) -> Option<CrossfadeOutcome> {
    loop {
        if let Some(outcome) = *done.borrow() {
            return Some(outcome);
        }
        if done.changed().await.is_err() {
            return *done.borrow();
        }
    }
}

/// The transition state machine
pub struct Crossfader {
    engine: Arc<AudioEngine>,
    shared: Arc<SharedState>,
    fade: Mutex<Option<ActiveFade>>,
    snapshot: Mutex<Option<PausedCrossfade>>,
    progress: watch::Sender<CrossfadeProgress>,
}

impl Crossfader {
    pub fn new(engine: Arc<AudioEngine>, shared: Arc<SharedState>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            shared,
            fade: Mutex::new(None),
            snapshot: Mutex::new(None),
            progress: watch::Sender::new(CrossfadeProgress::idle()),
        })
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<CrossfadeProgress> {
        self.progress.subscribe()
    }

    pub fn current_progress(&self) -> CrossfadeProgress {
        *self.progress.borrow()
    }

    pub async fn is_in_progress(&self) -> bool {
        self.fade.lock().await.is_some()
    }

    pub async fn has_paused_snapshot(&self) -> bool {
        self.snapshot.lock().await.is_some()
    }

    pub async fn paused_snapshot(&self) -> Option<PausedCrossfade> {
        self.snapshot.lock().await.clone()
    }

    /// Drop a recorded snapshot (stop while paused mid-crossfade)
    pub async fn clear_snapshot(&self) {
        self.snapshot.lock().await.take();
    }

    fn publish_phase(
        &self,
        phase: CrossfadePhase,
        duration: Duration,
        elapsed: Duration,
        kind: CrossfadeKind,
    ) {
        let progress = CrossfadeProgress {
            phase,
            duration,
            elapsed,
        };
        self.progress.send_replace(progress);
        // only phase boundaries reach the event stream; per-step progress
        // stays on the watch channel
        if !matches!(phase, CrossfadePhase::Fading(p) if p > 0.0 && p < 1.0) {
            self.shared.events.emit(PlayerEvent::CrossfadeProgressed {
                progress,
                kind,
                timestamp: Utc::now(),
            });
        }
    }

    /// Load `to_track` into the inactive slot and launch the fade. Returns
    /// once the fade is running; completion is observed via
    /// [`Crossfader::await_outcome`] or the progress channel.
    pub async fn begin(
        self: &Arc<Self>,
        to_track: &Track,
        duration: Duration,
        curve: FadeCurve,
        kind: CrossfadeKind,
    ) -> Result<()> {
        let mut fade = self.fade.lock().await;
        if fade.is_some() {
            return Err(Error::invalid_state("crossfade in progress", "start crossfade"));
        }
        if !self.engine.active_player_playing() {
            return Err(Error::invalid_state("active player stopped", "start crossfade"));
        }

        self.publish_phase(CrossfadePhase::Preparing, duration, Duration::ZERO, kind);
        let inactive = self.engine.inactive_slot();
        if let Err(error) = self.engine.load_into_slot(inactive, to_track).await {
            self.publish_phase(CrossfadePhase::Idle, duration, Duration::ZERO, kind);
            return Err(error);
        }
        if let Err(error) = self.engine.prepare_inactive().await {
            self.publish_phase(CrossfadePhase::Idle, duration, Duration::ZERO, kind);
            return Err(error);
        }

        self.launch_fade(&mut fade, duration, curve, kind, None);
        info!(uri = %to_track.uri, ?kind, "crossfade started");
        Ok(())
    }

    /// Resume a paused crossfade from its snapshot. Returns false when no
    /// snapshot exists.
    pub async fn resume(self: &Arc<Self>) -> Result<bool> {
        let mut fade = self.fade.lock().await;
        if fade.is_some() {
            return Err(Error::invalid_state("crossfade in progress", "resume crossfade"));
        }
        let Some(snapshot) = self.snapshot.lock().await.take() else {
            return Ok(false);
        };

        self.engine.resume_both().await?;
        self.launch_fade(
            &mut fade,
            snapshot.remaining,
            snapshot.curve,
            snapshot.kind,
            Some((snapshot.active_volume, snapshot.inactive_volume)),
        );
        info!(remaining = ?snapshot.remaining, "crossfade resumed from snapshot");
        Ok(true)
    }

    /// Record the fade guard, then spawn the ramp task. The guard is in
    /// place before the task can possibly finish, so its cleanup never races
    /// the registration.
    fn launch_fade(
        self: &Arc<Self>,
        slot: &mut Option<ActiveFade>,
        duration: Duration,
        curve: FadeCurve,
        kind: CrossfadeKind,
        resume_from: Option<(f32, f32)>,
    ) {
        let control = CrossfadeControl::new();
        let (done_tx, done_rx) = watch::channel(None);
        *slot = Some(ActiveFade {
            control: Arc::clone(&control),
            done: done_rx,
            duration,
            kind,
        });
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this
                .run_fade(control, duration, curve, kind, resume_from)
                .await;
            // clear the guard before signalling so observers never see
            // "done" while still "in progress"
            this.fade.lock().await.take();
            let _ = done_tx.send(Some(outcome));
        });
    }

    async fn run_fade(
        self: &Arc<Self>,
        control: Arc<CrossfadeControl>,
        duration: Duration,
        curve: FadeCurve,
        kind: CrossfadeKind,
        resume_from: Option<(f32, f32)>,
    ) -> CrossfadeOutcome {
        self.publish_phase(CrossfadePhase::Fading(0.0), duration, Duration::ZERO, kind);
        let progress_tx = self.progress.clone();
        let report = move |p: f32| {
            progress_tx.send_replace(CrossfadeProgress {
                phase: CrossfadePhase::Fading(p),
                duration,
                elapsed: duration.mul_f32(p),
            });
        };

        let outcome = match resume_from {
            None => {
                self.engine
                    .execute_crossfade(duration, curve, &control, report)
                    .await
            }
            Some((active_from, inactive_from)) => {
                self.engine
                    .fade_from_volumes(active_from, inactive_from, duration, &control, report)
                    .await
            }
        };

        match outcome {
            FadeOutcome::Completed => {
                self.publish_phase(CrossfadePhase::Switching, duration, duration, kind);
                self.engine.switch_active();
                self.publish_phase(CrossfadePhase::Cleanup, duration, duration, kind);
                self.engine.set_crossfade_active(false);
                self.engine.stop_inactive().await;
                tokio::time::sleep(CLEANUP_SETTLE).await;
                self.publish_phase(CrossfadePhase::Idle, duration, duration, kind);
                CrossfadeOutcome::Completed
            }
            FadeOutcome::Paused {
                active_volume,
                inactive_volume,
                elapsed,
            } => {
                let (active_position, inactive_position) = self.engine.pause_crossfading().await;
                let snapshot = PausedCrossfade {
                    active_volume,
                    inactive_volume,
                    active_position,
                    inactive_position,
                    active_slot: self.engine.active_slot(),
                    remaining: duration.saturating_sub(elapsed),
                    curve,
                    kind,
                };
                debug!(
                    remaining = ?snapshot.remaining,
                    active_volume, inactive_volume, "crossfade paused, snapshot recorded"
                );
                *self.snapshot.lock().await = Some(snapshot);
                CrossfadeOutcome::Paused
            }
            FadeOutcome::Cancelled => {
                debug!("crossfade ramp cancelled");
                // the canceller owns engine restoration and the Idle publish
                CrossfadeOutcome::Cancelled
            }
        }
    }

    /// Ask the running fade to pause and wait until the snapshot is in
    /// place. Returns false when no fade was in flight (or it completed
    /// before the pause landed).
    pub async fn pause_active(&self) -> Result<bool> {
        let handle = {
            let fade = self.fade.lock().await;
            fade.as_ref()
                .map(|f| (Arc::clone(&f.control), f.done.clone()))
        };
        let Some((control, mut done)) = handle else {
            return Ok(false);
        };
        control.request_pause();
        match wait_done(&mut done).await {
            Some(CrossfadeOutcome::Paused) => Ok(true),
            other => {
                debug!(?other, "pause raced crossfade completion");
                Ok(false)
            }
        }
    }

    /// Await the outcome of the running fade, if any
    pub async fn await_outcome(&self) -> Option<CrossfadeOutcome> {
        let done = {
            let fade = self.fade.lock().await;
            fade.as_ref().map(|f| f.done.clone())
        };
        match done {
            Some(mut rx) => wait_done(&mut rx).await,
            None => None,
        }
    }

    async fn cancel_running(&self) -> Option<(Duration, CrossfadeKind)> {
        let handle = {
            let fade = self.fade.lock().await;
            fade.as_ref()
                .map(|f| (Arc::clone(&f.control), f.done.clone(), f.duration, f.kind))
        };
        let (control, mut done, duration, kind) = handle?;
        control.cancel();
        wait_done(&mut done).await;
        Some((duration, kind))
    }

    /// Cancel the running (or paused) crossfade and restore the outgoing
    /// track. Returns the active mixer volume seen before the restore.
    pub async fn rollback_current(&self, duration: Duration) -> Result<f32> {
        let had_snapshot = self.snapshot.lock().await.take().is_some();
        let (fade_duration, kind) = match self.cancel_running().await {
            Some(info) => info,
            None if had_snapshot => (duration, CrossfadeKind::ManualChange),
            None => return Err(Error::invalid_state("no crossfade", "rollback")),
        };
        let volume = self.engine.rollback(duration).await;
        self.publish_phase(CrossfadePhase::Idle, fade_duration, Duration::ZERO, kind);
        Ok(volume)
    }

    /// Cancel the running (or paused) crossfade by completing it early.
    pub async fn fast_forward_current(&self, duration: Duration) -> Result<()> {
        let had_snapshot = self.snapshot.lock().await.take().is_some();
        let (fade_duration, kind) = match self.cancel_running().await {
            Some(info) => info,
            None if had_snapshot => (duration, CrossfadeKind::ManualChange),
            None => return Err(Error::invalid_state("no crossfade", "fast-forward")),
        };
        self.engine.fast_forward(duration).await;
        self.publish_phase(CrossfadePhase::Idle, fade_duration, Duration::ZERO, kind);
        Ok(())
    }

    /// Cancel any running fade and drop any snapshot without restoring the
    /// engine; used on the stop path where the engine halts right after.
    pub async fn abort(&self) {
        self.snapshot.lock().await.take();
        if self.cancel_running().await.is_some() {
            self.engine.set_crossfade_active(false);
        }
        self.progress.send_replace(CrossfadeProgress::idle());
    }

    /// Wait up to [`NEAR_END_WAIT`] for an almost-done crossfade to finish
    pub async fn wait_near_completion(&self) -> Option<CrossfadeOutcome> {
        match tokio::time::timeout(NEAR_END_WAIT, self.await_outcome()).await {
            Ok(outcome) => outcome,
            Err(_) => None,
        }
    }

    /// Fade out, seek, fade back in: used for skips within a track.
    pub async fn fade_seek_fade(
        &self,
        target: Duration,
        fade_out: Duration,
        fade_in: Duration,
        curve: FadeCurve,
    ) -> Result<f64> {
        self.engine.fade_active_to(0.0, fade_out, curve).await;
        let landed = self.engine.seek(target).await?;
        self.engine
            .fade_active_to(self.engine.target_volume(), fade_in, curve)
            .await;
        Ok(landed)
    }

    /// Fade the active mixer to silence (pause/finish paths without a
    /// paused crossfade)
    pub async fn simple_fade_out(&self, duration: Duration, curve: FadeCurve) {
        self.engine.fade_active_to(0.0, duration, curve).await;
    }

    /// Fade the active mixer back to the target volume
    pub async fn simple_fade_in(&self, duration: Duration, curve: FadeCurve) {
        self.engine
            .fade_active_to(self.engine.target_volume(), duration, curve)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AudioFileCache;
    use crate::host::sim::{SimGraph, SimMediaSource};
    use crate::host::{AudioGraph, MediaSource};
    use crate::types::PlayerState;

    const RATE: u32 = 44100;

    async fn fixture() -> (Arc<Crossfader>, Arc<AudioEngine>, Arc<SimGraph>) {
        let graph = SimGraph::new(RATE);
        let source = SimMediaSource::new();
        source.add_sine("one", RATE, 220.0, 10.0, 0.5);
        source.add_sine("two", RATE, 330.0, 10.0, 0.5);
        let cache = Arc::new(AudioFileCache::new(
            Arc::clone(&source) as Arc<dyn MediaSource>,
            None,
            8,
            Duration::from_secs(5),
        ));
        let engine = Arc::new(
            AudioEngine::new(Arc::clone(&graph) as Arc<dyn AudioGraph>, cache, false).unwrap(),
        );
        engine.start().unwrap();
        engine
            .load_into_slot(SlotId::A, &Track::new("one"))
            .await
            .unwrap();
        engine.schedule_active(None).await.unwrap();

        let shared = Arc::new(SharedState::new());
        shared.set_state(PlayerState::Playing);
        let crossfader = Crossfader::new(Arc::clone(&engine), shared);
        (crossfader, engine, graph)
    }

    #[tokio::test(start_paused = true)]
    async fn full_transition_switches_slots() {
        let (crossfader, engine, _) = fixture().await;
        crossfader
            .begin(
                &Track::new("two"),
                Duration::from_secs(2),
                FadeCurve::EqualPower,
                CrossfadeKind::ManualChange,
            )
            .await
            .unwrap();
        let outcome = crossfader.await_outcome().await;
        assert_eq!(outcome, Some(CrossfadeOutcome::Completed));
        assert_eq!(engine.active_slot(), SlotId::B);
        assert_eq!(engine.mixer_volume(SlotId::A), 0.0);
        assert!((engine.mixer_volume(SlotId::B) - 1.0).abs() < 1e-6);
        assert_eq!(crossfader.current_progress().phase, CrossfadePhase::Idle);
        assert!(!crossfader.is_in_progress().await);
    }

    #[tokio::test(start_paused = true)]
    async fn reentrancy_guarded() {
        let (crossfader, _, _) = fixture().await;
        crossfader
            .begin(
                &Track::new("two"),
                Duration::from_secs(5),
                FadeCurve::Linear,
                CrossfadeKind::ManualChange,
            )
            .await
            .unwrap();
        let err = crossfader
            .begin(
                &Track::new("two"),
                Duration::from_secs(5),
                FadeCurve::Linear,
                CrossfadeKind::ManualChange,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        crossfader.await_outcome().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_then_resume_completes_from_snapshot() {
        let (crossfader, engine, _) = fixture().await;
        crossfader
            .begin(
                &Track::new("two"),
                Duration::from_secs(5),
                FadeCurve::Linear,
                CrossfadeKind::ManualChange,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(crossfader.pause_active().await.unwrap());

        let snapshot = crossfader.paused_snapshot().await.unwrap();
        assert!((snapshot.active_volume - 0.6).abs() < 0.1, "{}", snapshot.active_volume);
        assert!((snapshot.inactive_volume - 0.4).abs() < 0.1, "{}", snapshot.inactive_volume);
        assert!((snapshot.remaining.as_secs_f32() - 3.0).abs() < 0.2);
        assert!(!engine.active_player_playing());

        // resume finishes the remaining ramp and switches
        assert!(crossfader.resume().await.unwrap());
        let outcome = crossfader.await_outcome().await;
        assert_eq!(outcome, Some(CrossfadeOutcome::Completed));
        assert_eq!(engine.active_slot(), SlotId::B);
        assert!(!crossfader.has_paused_snapshot().await);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_snapshot_is_false() {
        let (crossfader, _, _) = fixture().await;
        assert!(!crossfader.resume().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_mid_fade_restores_outgoing() {
        let (crossfader, engine, _) = fixture().await;
        crossfader
            .begin(
                &Track::new("two"),
                Duration::from_secs(5),
                FadeCurve::Linear,
                CrossfadeKind::AutomaticLoop,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        crossfader.rollback_current(Duration::from_millis(300)).await.unwrap();
        assert_eq!(engine.active_slot(), SlotId::A);
        assert!((engine.mixer_volume(SlotId::A) - 1.0).abs() < 1e-6);
        assert_eq!(engine.mixer_volume(SlotId::B), 0.0);
        assert_eq!(crossfader.current_progress().phase, CrossfadePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_forward_switches_to_incoming() {
        let (crossfader, engine, _) = fixture().await;
        crossfader
            .begin(
                &Track::new("two"),
                Duration::from_secs(5),
                FadeCurve::Linear,
                CrossfadeKind::ManualChange,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        crossfader
            .fast_forward_current(Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(engine.active_slot(), SlotId::B);
        assert!((engine.mixer_volume(SlotId::B) - 1.0).abs() < 1e-6);
        assert_eq!(engine.mixer_volume(SlotId::A), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_seek_fade_lands_on_target() {
        let (crossfader, engine, _) = fixture().await;
        let landed = crossfader
            .fade_seek_fade(
                Duration::from_secs(6),
                Duration::from_millis(300),
                Duration::from_millis(300),
                FadeCurve::Linear,
            )
            .await
            .unwrap();
        assert!((landed - 6.0).abs() < 0.05);
        assert!((engine.mixer_volume(SlotId::A) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn replacement_policy_boundaries() {
        assert_eq!(replace_plan(0.1), ReplacePlan::Rollback);
        assert_eq!(replace_plan(0.5), ReplacePlan::FastForward);
        assert_eq!(replace_plan(0.95), ReplacePlan::WaitForCompletion);
        assert_eq!(replace_plan(0.2), ReplacePlan::FastForward);
        assert_eq!(replace_plan(0.9), ReplacePlan::FastForward);
    }
}

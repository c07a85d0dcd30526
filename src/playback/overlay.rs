//! Overlay layer: looping ambience and timed bells
//!
//! A single player/mixer pair (handed off by the engine at setup) driven by a
//! cooperative loop task: per-iteration fade-in, schedule, completion wait,
//! drain guard, fade-out, inter-iteration delay. Pause and resume act on the
//! player node only; the task survives them. Stop cancels the task at its
//! next suspension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::cache::{AudioFileCache, LoadPriority};
use crate::config::OverlayConfig;
use crate::dsp::resample::resample_planar;
use crate::error::{Error, Result};
use crate::host::{MixerNode, PlayerNode};
use crate::types::{DecodedBuffer, LoopMode, OverlayState};

use super::curves::FadeCurve;
use super::engine::fade_mixer;

/// Wait after a completion callback for the hardware buffer to drain
const DRAIN_GUARD: Duration = Duration::from_millis(600);
/// Fade-out applied when the overlay file is replaced mid-cycle
const REPLACE_FADE: Duration = Duration::from_secs(1);

/// Cooperative cancellation: flag for tight loops, notify for selects
struct CancelToken {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Sleep that returns early on cancellation; true when it slept through
async fn cancellable_sleep(duration: Duration, token: &CancelToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}

fn should_continue(mode: LoopMode, iteration: u32) -> bool {
    match mode {
        LoopMode::Once => iteration < 1,
        LoopMode::Count(n) => iteration < n,
        LoopMode::Infinite => true,
    }
}

struct LoopHandle {
    token: Arc<CancelToken>,
    task: tokio::task::JoinHandle<()>,
}

/// The overlay scheduler
pub struct OverlayPlayer {
    player: Arc<dyn PlayerNode>,
    mixer: Arc<dyn MixerNode>,
    cache: Arc<AudioFileCache>,
    output_sample_rate: u32,
    state: watch::Sender<OverlayState>,
    config: std::sync::Mutex<OverlayConfig>,
    current: Mutex<Option<CurrentOverlay>>,
    run: Mutex<Option<LoopHandle>>,
}

struct CurrentOverlay {
    uri: String,
    normalized: bool,
    buffer: Arc<DecodedBuffer>,
}

impl OverlayPlayer {
    pub fn new(
        player: Arc<dyn PlayerNode>,
        mixer: Arc<dyn MixerNode>,
        cache: Arc<AudioFileCache>,
        output_sample_rate: u32,
        config: OverlayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            player,
            mixer,
            cache,
            output_sample_rate,
            state: watch::Sender::new(OverlayState::Idle),
            config: std::sync::Mutex::new(config),
            current: Mutex::new(None),
            run: Mutex::new(None),
        })
    }

    pub fn state(&self) -> OverlayState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OverlayState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> OverlayConfig {
        *self.config.lock().expect("overlay config lock")
    }

    pub fn set_config(&self, config: OverlayConfig) -> Result<()> {
        config.validate()?;
        *self.config.lock().expect("overlay config lock") = config;
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.config.lock().expect("overlay config lock").volume = volume;
        // live update outside fades
        if matches!(self.state(), OverlayState::Playing | OverlayState::Paused) {
            self.mixer.set_volume(volume);
        }
    }

    pub fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        if matches!(mode, LoopMode::Count(0)) {
            return Err(Error::InvalidConfiguration {
                reason: "overlay loop count must be greater than zero".to_string(),
            });
        }
        self.config.lock().expect("overlay config lock").loop_mode = mode;
        Ok(())
    }

    pub fn set_loop_delay(&self, delay: Duration) {
        self.config.lock().expect("overlay config lock").loop_delay = delay;
    }

    /// Load a file and enter the loop cycle. Replaces a running overlay with
    /// a 1 s fade-out first.
    pub async fn play(self: &Arc<Self>, uri: &str) -> Result<()> {
        if matches!(self.state(), OverlayState::Playing | OverlayState::Paused) {
            return self.replace_file(uri).await;
        }

        self.state.send_replace(OverlayState::Preparing);
        let buffer = match self.load(uri).await {
            Ok(buffer) => buffer,
            Err(error) => {
                self.state.send_replace(OverlayState::Idle);
                return Err(error);
            }
        };
        self.start_cycle(buffer).await;
        Ok(())
    }

    /// 1 s fade-out of the running cycle, then re-enter with the new file
    pub async fn replace_file(self: &Arc<Self>, uri: &str) -> Result<()> {
        info!(uri, "replacing overlay file");
        self.cancel_cycle().await;
        fade_mixer(
            &self.mixer,
            self.mixer.volume(),
            0.0,
            REPLACE_FADE,
            FadeCurve::Linear,
            None,
        )
        .await;
        self.player.stop();
        self.player.reset();
        self.release_current().await;

        self.state.send_replace(OverlayState::Preparing);
        let buffer = match self.load(uri).await {
            Ok(buffer) => buffer,
            Err(error) => {
                self.state.send_replace(OverlayState::Idle);
                return Err(error);
            }
        };
        self.start_cycle(buffer).await;
        Ok(())
    }

    /// Pause the player node; the loop task stays parked where it is
    pub fn pause(&self) {
        if self.state() == OverlayState::Playing {
            self.player.pause();
            self.state.send_replace(OverlayState::Paused);
            debug!("overlay paused");
        }
    }

    pub fn resume(&self) {
        if self.state() == OverlayState::Paused {
            self.player.play();
            self.state.send_replace(OverlayState::Playing);
            debug!("overlay resumed");
        }
    }

    /// Cancel the cycle, fade out from the current mixer level, halt the
    /// player, and dispose the loaded buffer.
    pub async fn stop(&self) {
        if self.state() == OverlayState::Idle {
            return;
        }
        self.state.send_replace(OverlayState::Stopping);
        self.cancel_cycle().await;

        let fade_out = self.config().fade_out;
        if !fade_out.is_zero() && self.mixer.volume() > 0.0 {
            fade_mixer(
                &self.mixer,
                self.mixer.volume(),
                0.0,
                fade_out,
                self.config().fade_curve,
                None,
            )
            .await;
        }
        self.player.stop();
        self.player.reset();
        self.mixer.set_volume(0.0);
        self.release_current().await;
        self.state.send_replace(OverlayState::Idle);
        info!("overlay stopped");
    }

    async fn load(&self, uri: &str) -> Result<Arc<DecodedBuffer>> {
        let normalized = self.config().normalized;
        let audio = self
            .cache
            .get(uri, normalized, LoadPriority::Playback)
            .await?;
        self.cache.pin(uri, normalized).await;

        // never hand the player a buffer at a foreign rate
        let buffer = if audio.buffer.sample_rate != self.output_sample_rate {
            debug!(
                from = audio.buffer.sample_rate,
                to = self.output_sample_rate,
                "converting overlay buffer to the output rate"
            );
            let channels = resample_planar(
                &audio.buffer.channels,
                audio.buffer.sample_rate,
                self.output_sample_rate,
            )
            .map_err(Error::Dsp)?;
            Arc::new(DecodedBuffer::new(channels, self.output_sample_rate))
        } else {
            Arc::clone(&audio.buffer)
        };

        *self.current.lock().await = Some(CurrentOverlay {
            uri: uri.to_string(),
            normalized,
            buffer: Arc::clone(&buffer),
        });
        Ok(buffer)
    }

    async fn release_current(&self) {
        if let Some(current) = self.current.lock().await.take() {
            self.cache.unpin(&current.uri, current.normalized).await;
        }
    }

    async fn start_cycle(self: &Arc<Self>, buffer: Arc<DecodedBuffer>) {
        let token = CancelToken::new();
        let this = Arc::clone(self);
        let task_token = Arc::clone(&token);
        self.state.send_replace(OverlayState::Playing);
        let task = tokio::spawn(async move {
            this.run_cycle(buffer, task_token).await;
        });
        *self.run.lock().await = Some(LoopHandle { token, task });
    }

    async fn cancel_cycle(&self) {
        // take the handle before awaiting so the lock is not held across the
        // join (the task itself locks `run` when a finite cycle winds down)
        let handle = self.run.lock().await.take();
        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(join_error) = handle.task.await {
                warn!(%join_error, "overlay cycle task failed");
            }
        }
    }

    async fn run_cycle(self: Arc<Self>, buffer: Arc<DecodedBuffer>, token: Arc<CancelToken>) {
        let (complete_tx, mut complete_rx) = mpsc::unbounded_channel::<()>();
        let mut iteration: u32 = 0;

        loop {
            let config = self.config();
            if !should_continue(config.loop_mode, iteration)
                || token.is_cancelled()
                || matches!(self.state(), OverlayState::Stopping | OverlayState::Idle)
            {
                break;
            }

            if !config.fade_in.is_zero() {
                self.mixer.set_volume(0.0);
            } else if iteration == 0 {
                self.mixer.set_volume(config.volume);
            }

            let tx = complete_tx.clone();
            self.player
                .schedule_buffer(Arc::clone(&buffer), Box::new(move || {
                    let _ = tx.send(());
                }));
            self.player.play();

            if !config.fade_in.is_zero() {
                fade_mixer(
                    &self.mixer,
                    0.0,
                    config.volume,
                    config.fade_in,
                    config.fade_curve,
                    Some(&token.flag),
                )
                .await;
            }

            // wait for the buffer to play out
            tokio::select! {
                _ = complete_rx.recv() => {}
                _ = token.cancelled() => break,
            }
            if !cancellable_sleep(DRAIN_GUARD, &token).await {
                break;
            }

            if !config.fade_out.is_zero() {
                fade_mixer(
                    &self.mixer,
                    self.mixer.volume(),
                    0.0,
                    config.fade_out,
                    config.fade_curve,
                    Some(&token.flag),
                )
                .await;
            }

            iteration += 1;
            if should_continue(config.loop_mode, iteration) && !config.loop_delay.is_zero() {
                if !cancellable_sleep(config.loop_delay, &token).await {
                    break;
                }
            }
        }

        // a finite cycle that ran out ends the overlay on its own
        if !token.is_cancelled() {
            debug!(iteration, "overlay cycle finished");
            self.player.stop();
            self.player.reset();
            self.mixer.set_volume(0.0);
            self.release_current().await;
            self.state.send_replace(OverlayState::Idle);
            self.run.lock().await.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::{SimGraph, SimMediaSource};
    use crate::host::{AudioGraph, MediaSource};

    const RATE: u32 = 44100;

    fn fixture() -> (Arc<OverlayPlayer>, Arc<SimGraph>, Arc<SimMediaSource>) {
        let graph = SimGraph::new(RATE);
        let player = graph.attach_player("overlay");
        let mixer = graph.attach_mixer("overlay-mixer");
        let source = SimMediaSource::new();
        source.add_sine("bell", RATE, 880.0, 2.0, 0.5);
        source.add_sine("rain", RATE, 110.0, 5.0, 0.3);
        let cache = Arc::new(AudioFileCache::new(
            Arc::clone(&source) as Arc<dyn MediaSource>,
            None,
            8,
            Duration::from_secs(5),
        ));
        let overlay = OverlayPlayer::new(player, mixer, cache, RATE, OverlayConfig::default());
        (overlay, graph, source)
    }

    #[tokio::test(start_paused = true)]
    async fn plays_and_sets_volume_on_first_iteration() {
        let (overlay, graph, _) = fixture();
        overlay.set_volume(0.7);
        overlay.play("bell").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(overlay.state(), OverlayState::Playing);
        let player = graph.player("overlay").unwrap();
        assert!(player.is_playing());
        assert!((graph.mixer("overlay-mixer").unwrap().volume() - 0.7).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn once_mode_ends_after_single_iteration() {
        let (overlay, graph, _) = fixture();
        let mut config = OverlayConfig::default();
        config.loop_mode = LoopMode::Once;
        overlay.set_config(config).unwrap();
        overlay.play("bell").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let player = graph.player("overlay").unwrap();
        assert!(player.finish_scheduled());
        // drain guard, then the cycle winds down on its own
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(overlay.state(), OverlayState::Idle);
        assert_eq!(player.scheduled_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn count_mode_schedules_n_iterations() {
        let (overlay, graph, _) = fixture();
        let mut config = OverlayConfig::default();
        config.loop_mode = LoopMode::Count(3);
        config.loop_delay = Duration::from_millis(100);
        overlay.set_config(config).unwrap();
        overlay.play("bell").await.unwrap();

        let player = graph.player("overlay").unwrap();
        let mut completed = 0;
        for _ in 0..3 {
            // let the cycle schedule, then finish that iteration
            for _ in 0..200 {
                if player.scheduled_count() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(player.finish_scheduled(), "iteration {completed} not scheduled");
            completed += 1;
            tokio::time::sleep(Duration::from_millis(800)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(completed, 3);
        assert_eq!(overlay.state(), OverlayState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_keep_cycle_alive() {
        let (overlay, graph, _) = fixture();
        overlay.play("rain").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        overlay.pause();
        assert_eq!(overlay.state(), OverlayState::Paused);
        assert!(!graph.player("overlay").unwrap().is_playing());

        overlay.resume();
        assert_eq!(overlay.state(), OverlayState::Playing);
        assert!(graph.player("overlay").unwrap().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fades_and_resets() {
        let (overlay, graph, _) = fixture();
        let mut config = OverlayConfig::default();
        config.fade_out = Duration::from_millis(200);
        config.volume = 0.8;
        overlay.set_config(config).unwrap();
        overlay.play("rain").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        overlay.stop().await;
        assert_eq!(overlay.state(), OverlayState::Idle);
        let mixer = graph.mixer("overlay-mixer").unwrap();
        assert_eq!(mixer.volume(), 0.0);
        assert!(!graph.player("overlay").unwrap().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn replace_file_swaps_buffer() {
        let (overlay, graph, _) = fixture();
        overlay.play("bell").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = graph.player("overlay").unwrap().current_buffer().unwrap();

        overlay.play("rain").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = graph.player("overlay").unwrap().current_buffer().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(overlay.state(), OverlayState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_returns_to_idle() {
        let (overlay, _, _) = fixture();
        let err = overlay.play("missing").await.unwrap_err();
        assert!(matches!(err, Error::FileLoadFailed { .. }));
        assert_eq!(overlay.state(), OverlayState::Idle);
    }

    #[test]
    fn loop_bounds() {
        assert!(should_continue(LoopMode::Once, 0));
        assert!(!should_continue(LoopMode::Once, 1));
        assert!(should_continue(LoopMode::Count(2), 1));
        assert!(!should_continue(LoopMode::Count(2), 2));
        assert!(should_continue(LoopMode::Infinite, 1_000_000));
    }

}

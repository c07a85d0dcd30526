//! Simulated host graph
//!
//! An in-memory implementation of the host traits: players record their
//! schedules and render time against the tokio clock, mixers record volume
//! writes, the session fans out scripted notifications. Completions fire when
//! a test (or an embedder's harness) asks a player to finish its scheduled
//! audio, and on `stop()` the way real platforms fire them — stale, so the
//! engine's generation filtering is exercised for real.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::types::DecodedBuffer;

use super::{
    AudioGraph, CompletionHandler, GraphError, LoadedAudio, MediaReadError, MediaSource,
    MixerNode, PlayerNode, RenderTime, SessionCategory, SessionHost, SessionHostEvent,
    SessionOptions,
};

/// Audio scheduled on a [`SimPlayer`], waiting for completion
struct ScheduledAudio {
    buffer: Arc<DecodedBuffer>,
    from_frame: u64,
    completion: Option<CompletionHandler>,
}

#[derive(Default)]
struct PlayerInner {
    playing: bool,
    rendered_samples: u64,
    started: bool,
    play_started: Option<Instant>,
    scheduled: Vec<ScheduledAudio>,
}

/// Simulated player node
pub struct SimPlayer {
    label: String,
    sample_rate: u32,
    inner: Mutex<PlayerInner>,
}

impl SimPlayer {
    fn new(label: &str, sample_rate: u32) -> Self {
        Self {
            label: label.to_string(),
            sample_rate,
            inner: Mutex::new(PlayerInner::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of schedules still awaiting completion
    pub fn scheduled_count(&self) -> usize {
        self.inner.lock().unwrap().scheduled.len()
    }

    /// The most recently scheduled buffer
    pub fn current_buffer(&self) -> Option<Arc<DecodedBuffer>> {
        let inner = self.inner.lock().unwrap();
        inner.scheduled.last().map(|s| Arc::clone(&s.buffer))
    }

    /// Start frame of the most recent schedule
    pub fn last_scheduled_from_frame(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.scheduled.last().map(|s| s.from_frame)
    }

    /// Fire the completion of the oldest scheduled item, as the host would
    /// when its audio finishes rendering. Returns false when nothing was
    /// scheduled.
    pub fn finish_scheduled(&self) -> bool {
        let completion = {
            let mut inner = self.inner.lock().unwrap();
            if inner.scheduled.is_empty() {
                return false;
            }
            let mut item = inner.scheduled.remove(0);
            item.completion.take()
        };
        if let Some(complete) = completion {
            complete();
        }
        true
    }

    fn schedule(&self, buffer: Arc<DecodedBuffer>, from_frame: u64, completion: CompletionHandler) {
        let mut inner = self.inner.lock().unwrap();
        inner.scheduled.push(ScheduledAudio {
            buffer,
            from_frame,
            completion: Some(completion),
        });
    }

    fn rendered_now(&self, inner: &PlayerInner) -> u64 {
        let live = inner
            .play_started
            .map(|t| (t.elapsed().as_secs_f64() * self.sample_rate as f64) as u64)
            .unwrap_or(0);
        inner.rendered_samples + live
    }
}

impl PlayerNode for SimPlayer {
    fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.playing {
            inner.playing = true;
            inner.started = true;
            inner.play_started = Some(Instant::now());
        }
    }

    fn play_at(&self, _when: RenderTime) {
        // the sim starts immediately; anchor offsets are sub-frame detail
        // the engine never reads back
        self.play();
    }

    fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.playing {
            let rendered = self.rendered_now(&inner);
            inner.rendered_samples = rendered;
            inner.play_started = None;
            inner.playing = false;
        }
    }

    fn stop(&self) {
        // real hosts fire pending completions on stop; the engine relies on
        // generation tokens to discard them
        let completions: Vec<CompletionHandler> = {
            let mut inner = self.inner.lock().unwrap();
            inner.playing = false;
            inner.started = false;
            inner.play_started = None;
            inner.rendered_samples = 0;
            inner
                .scheduled
                .drain(..)
                .filter_map(|mut s| s.completion.take())
                .collect()
        };
        for complete in completions {
            complete();
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.playing = false;
        inner.started = false;
        inner.play_started = None;
        inner.rendered_samples = 0;
        inner.scheduled.clear();
    }

    fn schedule_file(&self, buffer: Arc<DecodedBuffer>, on_complete: CompletionHandler) {
        self.schedule(buffer, 0, on_complete);
    }

    fn schedule_segment(
        &self,
        buffer: Arc<DecodedBuffer>,
        from_frame: u64,
        on_complete: CompletionHandler,
    ) {
        self.schedule(buffer, from_frame, on_complete);
    }

    fn schedule_buffer(&self, buffer: Arc<DecodedBuffer>, on_complete: CompletionHandler) {
        self.schedule(buffer, 0, on_complete);
    }

    fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().playing
    }

    fn last_render_time(&self) -> Option<RenderTime> {
        let inner = self.inner.lock().unwrap();
        if !inner.started {
            return None;
        }
        Some(RenderTime {
            sample_time: self.rendered_now(&inner),
            sample_rate: self.sample_rate,
        })
    }
}

/// Simulated mixer node: records its volume and counts writes
pub struct SimMixer {
    label: String,
    volume: Mutex<f32>,
    writes: AtomicU64,
}

impl SimMixer {
    fn new(label: &str, volume: f32) -> Self {
        Self {
            label: label.to_string(),
            volume: Mutex::new(volume),
            writes: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Total `set_volume` calls, for asserting fade activity (or silence)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl MixerNode for SimMixer {
    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume;
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }
}

/// Simulated node graph
pub struct SimGraph {
    sample_rate: u32,
    running: AtomicBool,
    players: Mutex<HashMap<String, Arc<SimPlayer>>>,
    mixers: Mutex<HashMap<String, Arc<SimMixer>>>,
    main: Arc<SimMixer>,
    connects: AtomicU64,
    start_failure: Mutex<Option<String>>,
}

impl SimGraph {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            running: AtomicBool::new(false),
            players: Mutex::new(HashMap::new()),
            mixers: Mutex::new(HashMap::new()),
            main: Arc::new(SimMixer::new("main", 1.0)),
            connects: AtomicU64::new(0),
            start_failure: Mutex::new(None),
        })
    }

    /// Look up an attached player by label
    pub fn player(&self, label: &str) -> Option<Arc<SimPlayer>> {
        self.players.lock().unwrap().get(label).cloned()
    }

    /// Look up an attached mixer by label
    pub fn mixer(&self, label: &str) -> Option<Arc<SimMixer>> {
        self.mixers.lock().unwrap().get(label).cloned()
    }

    pub fn sim_main_mixer(&self) -> Arc<SimMixer> {
        Arc::clone(&self.main)
    }

    pub fn connection_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Script the next `start()` call to fail
    pub fn fail_next_start(&self, message: &str) {
        *self.start_failure.lock().unwrap() = Some(message.to_string());
    }
}

impl AudioGraph for SimGraph {
    fn attach_player(&self, label: &str) -> Arc<dyn PlayerNode> {
        let player = Arc::new(SimPlayer::new(label, self.sample_rate));
        self.players
            .lock()
            .unwrap()
            .insert(label.to_string(), Arc::clone(&player));
        player
    }

    fn attach_mixer(&self, label: &str) -> Arc<dyn MixerNode> {
        let mixer = Arc::new(SimMixer::new(label, 0.0));
        self.mixers
            .lock()
            .unwrap()
            .insert(label.to_string(), Arc::clone(&mixer));
        mixer
    }

    fn connect(
        &self,
        _player: &Arc<dyn PlayerNode>,
        _mixer: &Arc<dyn MixerNode>,
    ) -> Result<(), GraphError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn main_mixer(&self) -> Arc<dyn MixerNode> {
        Arc::clone(&self.main) as Arc<dyn MixerNode>
    }

    fn start(&self) -> Result<(), GraphError> {
        if let Some(message) = self.start_failure.lock().unwrap().take() {
            return Err(GraphError(message));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn output_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

struct SessionInner {
    category: SessionCategory,
    options: SessionOptions,
    active: bool,
    preferred_sample_rate: f64,
    preferred_io_buffer: f64,
    activation_failure: Option<String>,
    set_category_calls: u32,
    set_active_calls: u32,
}

/// Simulated audio session
pub struct SimSession {
    inner: Mutex<SessionInner>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionHostEvent>>>,
}

impl SimSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SessionInner {
                category: SessionCategory::SoloAmbient,
                options: SessionOptions::default(),
                active: false,
                preferred_sample_rate: 0.0,
                preferred_io_buffer: 0.0,
                activation_failure: None,
                set_category_calls: 0,
                set_active_calls: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Deliver a notification to every subscriber
    pub fn post(&self, event: SessionHostEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event).is_ok());
    }

    /// Script an externally-owned session state (External mode tests)
    pub fn script(&self, category: SessionCategory, options: SessionOptions, active: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.category = category;
        inner.options = options;
        inner.active = active;
    }

    pub fn fail_next_activation(&self, message: &str) {
        self.inner.lock().unwrap().activation_failure = Some(message.to_string());
    }

    pub fn set_category_calls(&self) -> u32 {
        self.inner.lock().unwrap().set_category_calls
    }

    pub fn set_active_calls(&self) -> u32 {
        self.inner.lock().unwrap().set_active_calls
    }

    pub fn preferred_sample_rate(&self) -> f64 {
        self.inner.lock().unwrap().preferred_sample_rate
    }

    pub fn preferred_io_buffer(&self) -> f64 {
        self.inner.lock().unwrap().preferred_io_buffer
    }
}

impl SessionHost for SimSession {
    fn category(&self) -> SessionCategory {
        self.inner.lock().unwrap().category
    }

    fn options(&self) -> SessionOptions {
        self.inner.lock().unwrap().options
    }

    fn set_category(&self, category: SessionCategory, options: SessionOptions) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        inner.category = category;
        inner.options = options;
        inner.set_category_calls += 1;
        Ok(())
    }

    fn set_preferred_sample_rate(&self, rate: f64) -> Result<(), String> {
        self.inner.lock().unwrap().preferred_sample_rate = rate;
        Ok(())
    }

    fn set_preferred_io_buffer_duration(&self, seconds: f64) -> Result<(), String> {
        self.inner.lock().unwrap().preferred_io_buffer = seconds;
        Ok(())
    }

    fn set_active(&self, active: bool) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_active_calls += 1;
        if active {
            if let Some(message) = inner.activation_failure.take() {
                return Err(message);
            }
        }
        inner.active = active;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }

    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SessionHostEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// Simulated media reader with programmable fixtures
pub struct SimMediaSource {
    files: Mutex<HashMap<String, LoadedAudio>>,
    read_delay: Mutex<Option<std::time::Duration>>,
    read_counts: Mutex<HashMap<String, u32>>,
}

impl SimMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            read_delay: Mutex::new(None),
            read_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn add(&self, uri: &str, buffer: DecodedBuffer) {
        self.files.lock().unwrap().insert(
            uri.to_string(),
            LoadedAudio {
                buffer,
                was_interleaved: true,
            },
        );
    }

    /// Register a sine fixture
    pub fn add_sine(&self, uri: &str, sample_rate: u32, freq: f64, seconds: f64, amplitude: f64) {
        let frames = (sample_rate as f64 * seconds) as usize;
        let channel: Vec<f32> = (0..frames)
            .map(|i| {
                ((2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin()
                    * amplitude) as f32
            })
            .collect();
        self.add(uri, DecodedBuffer::new(vec![channel.clone(), channel], sample_rate));
    }

    /// Register a silent fixture
    pub fn add_silence(&self, uri: &str, sample_rate: u32, seconds: f64) {
        let frames = (sample_rate as f64 * seconds) as usize;
        self.add(uri, DecodedBuffer::silent(2, frames, sample_rate));
    }

    /// Delay every read, for exercising the load timeout race
    pub fn set_read_delay(&self, delay: Option<std::time::Duration>) {
        *self.read_delay.lock().unwrap() = delay;
    }

    /// How many times a URI has been decoded (coalescing assertions)
    pub fn read_count(&self, uri: &str) -> u32 {
        self.read_counts
            .lock()
            .unwrap()
            .get(uri)
            .copied()
            .unwrap_or(0)
    }
}

impl MediaSource for SimMediaSource {
    fn read(&self, uri: &str) -> Result<LoadedAudio, MediaReadError> {
        *self
            .read_counts
            .lock()
            .unwrap()
            .entry(uri.to_string())
            .or_insert(0) += 1;
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| MediaReadError::NotFound(uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn player_schedule_and_finish() {
        let graph = SimGraph::new(44100);
        let player = graph.attach_player("slot-a");
        let sim = graph.player("slot-a").unwrap();

        let buffer = Arc::new(DecodedBuffer::silent(2, 4410, 44100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        player.schedule_file(buffer, Box::new(move || tx.send(()).unwrap()));
        assert_eq!(sim.scheduled_count(), 1);

        assert!(sim.finish_scheduled());
        rx.recv().await.unwrap();
        assert_eq!(sim.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn stop_fires_pending_completions() {
        let graph = SimGraph::new(44100);
        let player = graph.attach_player("slot-a");

        let buffer = Arc::new(DecodedBuffer::silent(2, 4410, 44100));
        let (tx, mut rx) = mpsc::unbounded_channel();
        player.schedule_file(buffer, Box::new(move || tx.send(()).unwrap()));
        player.stop();
        rx.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn render_time_advances_while_playing() {
        let graph = SimGraph::new(44100);
        let player = graph.attach_player("slot-a");
        assert!(player.last_render_time().is_none());

        player.play();
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        let t = player.last_render_time().unwrap();
        assert!(t.sample_time >= 44100 && t.sample_time <= 44542, "{}", t.sample_time);

        player.pause();
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        let t2 = player.last_render_time().unwrap();
        assert_eq!(t.sample_time, t2.sample_time);
    }

    #[tokio::test]
    async fn session_fans_out_events() {
        let session = SimSession::new();
        let mut rx1 = session.subscribe_events();
        let mut rx2 = session.subscribe_events();
        session.post(SessionHostEvent::InterruptionBegan);
        assert_eq!(rx1.recv().await, Some(SessionHostEvent::InterruptionBegan));
        assert_eq!(rx2.recv().await, Some(SessionHostEvent::InterruptionBegan));
    }

    #[test]
    fn media_source_counts_reads() {
        let source = SimMediaSource::new();
        source.add_sine("sine", 44100, 440.0, 0.1, 0.5);
        assert!(source.read("sine").is_ok());
        assert!(source.read("sine").is_ok());
        assert_eq!(source.read_count("sine"), 2);
        assert!(matches!(
            source.read("missing"),
            Err(MediaReadError::NotFound(_))
        ));
    }
}

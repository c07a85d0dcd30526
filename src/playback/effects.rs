//! One-shot sound effects
//!
//! A single player/mixer pair plays at most one effect at a time; starting a
//! new effect stops the current one. Effects are preloaded into a small LRU
//! set backed by the shared cache, and a master volume multiplies each
//! effect's intrinsic level.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::{AudioFileCache, LoadPriority};
use crate::error::Result;
use crate::host::{MixerNode, PlayerNode};
use crate::types::DecodedBuffer;

use super::curves::FadeCurve;
use super::engine::fade_mixer;

/// A playable effect: source plus intrinsic level
#[derive(Debug, Clone, PartialEq)]
pub struct SoundEffect {
    pub uri: String,
    /// Per-effect level in [0, 1], multiplied by the master volume
    pub volume: f32,
}

impl SoundEffect {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            volume: 1.0,
        }
    }

    pub fn with_volume(uri: impl Into<String>, volume: f32) -> Self {
        Self {
            uri: uri.into(),
            volume: volume.clamp(0.0, 1.0),
        }
    }
}

struct EffectsInner {
    /// Preloaded buffers, LRU order in `order` (oldest first)
    loaded: HashMap<String, Arc<DecodedBuffer>>,
    order: Vec<String>,
    /// The effect currently sounding, if any
    current: Option<SoundEffect>,
    master_volume: f32,
}

/// The one-shot effects layer
pub struct EffectsPlayer {
    player: Arc<dyn PlayerNode>,
    mixer: Arc<dyn MixerNode>,
    cache: Arc<AudioFileCache>,
    capacity: usize,
    inner: Mutex<EffectsInner>,
}

impl EffectsPlayer {
    pub fn new(
        player: Arc<dyn PlayerNode>,
        mixer: Arc<dyn MixerNode>,
        cache: Arc<AudioFileCache>,
        capacity: usize,
    ) -> Self {
        Self {
            player,
            mixer,
            cache,
            capacity: capacity.max(1),
            inner: Mutex::new(EffectsInner {
                loaded: HashMap::new(),
                order: Vec::new(),
                current: None,
                master_volume: 1.0,
            }),
        }
    }

    pub async fn master_volume(&self) -> f32 {
        self.inner.lock().await.master_volume
    }

    pub async fn set_master_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        let mut inner = self.inner.lock().await;
        inner.master_volume = volume;
        if let Some(current) = &inner.current {
            self.mixer.set_volume(volume * current.volume);
        }
    }

    pub async fn is_playing(&self) -> bool {
        self.inner.lock().await.current.is_some() && self.player.is_playing()
    }

    pub async fn loaded_count(&self) -> usize {
        self.inner.lock().await.loaded.len()
    }

    /// Warm the effect set. Loading past capacity evicts the least recently
    /// used effect (stopping it first if it is the one playing).
    pub async fn preload(&self, effects: &[SoundEffect]) -> Result<()> {
        for effect in effects {
            let audio = self
                .cache
                .get(&effect.uri, false, LoadPriority::Prefetch)
                .await?;
            self.cache.pin(&effect.uri, false).await;

            let evicted = {
                let mut inner = self.inner.lock().await;
                if !inner.loaded.contains_key(&effect.uri) {
                    inner.loaded.insert(effect.uri.clone(), Arc::clone(&audio.buffer));
                    inner.order.push(effect.uri.clone());
                }
                if inner.loaded.len() > self.capacity {
                    let victim = inner.order.remove(0);
                    inner.loaded.remove(&victim);
                    let playing_victim = inner
                        .current
                        .as_ref()
                        .is_some_and(|c| c.uri == victim);
                    Some((victim, playing_victim))
                } else {
                    None
                }
            };
            if let Some((victim, was_playing)) = evicted {
                if was_playing {
                    self.halt().await;
                }
                self.cache.unpin(&victim, false).await;
                debug!(uri = %victim, "evicted preloaded effect");
            }
        }
        Ok(())
    }

    /// Drop effects from the preload set, stopping playback first when the
    /// evicted effect is the one sounding.
    pub async fn unload(&self, uris: &[String]) {
        for uri in uris {
            let removed = {
                let mut inner = self.inner.lock().await;
                if inner.loaded.remove(uri).is_some() {
                    inner.order.retain(|u| u != uri);
                    let was_playing = inner.current.as_ref().is_some_and(|c| &c.uri == uri);
                    Some(was_playing)
                } else {
                    None
                }
            };
            if let Some(was_playing) = removed {
                if was_playing {
                    self.halt().await;
                }
                self.cache.unpin(uri, false).await;
            }
        }
    }

    /// Play an effect, stopping whatever is currently sounding. Cache miss
    /// falls back to a synchronous load.
    pub async fn play(&self, effect: &SoundEffect, fade_in: Duration) -> Result<()> {
        let buffer = {
            let mut inner = self.inner.lock().await;
            if let Some(buffer) = inner.loaded.get(&effect.uri) {
                let buffer = Arc::clone(buffer);
                // refresh recency
                inner.order.retain(|u| u != &effect.uri);
                inner.order.push(effect.uri.clone());
                Some(buffer)
            } else {
                None
            }
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                let audio = self
                    .cache
                    .get(&effect.uri, false, LoadPriority::Playback)
                    .await?;
                Arc::clone(&audio.buffer)
            }
        };

        // one at a time
        self.player.stop();
        self.player.reset();

        let master = {
            let mut inner = self.inner.lock().await;
            inner.current = Some(effect.clone());
            inner.master_volume
        };
        let level = master * effect.volume;

        self.player.schedule_buffer(buffer, Box::new(|| {}));
        if fade_in.is_zero() {
            self.mixer.set_volume(level);
        } else {
            self.mixer.set_volume(0.0);
        }
        self.player.play();
        if !fade_in.is_zero() {
            fade_mixer(&self.mixer, 0.0, level, fade_in, FadeCurve::Linear, None).await;
        }
        info!(uri = %effect.uri, level, "effect playing");
        Ok(())
    }

    /// Fade out (linear) and halt the current effect
    pub async fn stop(&self, fade_out: Duration) {
        let playing = self.inner.lock().await.current.is_some();
        if !playing {
            return;
        }
        if !fade_out.is_zero() {
            fade_mixer(
                &self.mixer,
                self.mixer.volume(),
                0.0,
                fade_out,
                FadeCurve::Linear,
                None,
            )
            .await;
        }
        self.halt().await;
    }

    async fn halt(&self) {
        self.player.stop();
        self.player.reset();
        self.mixer.set_volume(0.0);
        self.inner.lock().await.current = None;
        debug!("effect stopped");
    }
}

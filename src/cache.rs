//! Decoded-audio cache
//!
//! Keyed store of shared PCM buffers. Concurrent requests for the same key
//! share one decode; completed entries are LRU-evicted past capacity, except
//! while pinned by a playing slot, the overlay, or an effect. Loads run on
//! the blocking pool under a timeout race and optionally pass through
//! loudness normalization.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::dsp::normalizer::LoudnessNormalizer;
use crate::error::{Error, Result};
use crate::host::{MediaReadError, MediaSource};

/// Who is asking for the load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPriority {
    /// Needed for imminent playback; failures are errors
    Playback,
    /// Warming the cache; failures are warnings and recency is not touched
    Prefetch,
}

/// A cache hit: shared buffer plus source format detail
#[derive(Debug, Clone)]
pub struct CachedAudio {
    pub buffer: Arc<crate::types::DecodedBuffer>,
    pub was_interleaved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    uri: String,
    normalized: bool,
}

enum CacheEntry {
    Ready { audio: CachedAudio, pins: usize },
    Loading { done: broadcast::Sender<std::result::Result<CachedAudio, Error>> },
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// LRU order, oldest first; only Ready entries appear here
    order: VecDeque<CacheKey>,
}

/// Content-addressed store of decoded buffers
pub struct AudioFileCache {
    source: Arc<dyn MediaSource>,
    normalizer: Option<LoudnessNormalizer>,
    capacity: std::sync::atomic::AtomicUsize,
    load_timeout: std::sync::Mutex<Duration>,
    inner: Mutex<CacheInner>,
}

impl AudioFileCache {
    pub fn new(
        source: Arc<dyn MediaSource>,
        normalizer: Option<LoudnessNormalizer>,
        capacity: usize,
        load_timeout: Duration,
    ) -> Self {
        Self {
            source,
            normalizer,
            capacity: std::sync::atomic::AtomicUsize::new(capacity.max(1)),
            load_timeout: std::sync::Mutex::new(load_timeout),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Retune the entry bound; excess entries evict on the next access
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity
            .store(capacity.max(1), std::sync::atomic::Ordering::SeqCst);
    }

    /// Retune the per-load deadline
    pub fn set_load_timeout(&self, timeout: Duration) {
        *self.load_timeout.lock().expect("timeout lock") = timeout;
    }

    fn capacity(&self) -> usize {
        self.capacity.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn timeout(&self) -> Duration {
        *self.load_timeout.lock().expect("timeout lock")
    }

    fn key(&self, uri: &str, normalize: bool) -> CacheKey {
        CacheKey {
            uri: uri.to_string(),
            normalized: normalize && self.normalizer.is_some(),
        }
    }

    /// Fetch a buffer, decoding (and optionally normalizing) on miss.
    ///
    /// Concurrent callers for the same `(uri, normalize)` key share a single
    /// decode.
    pub async fn get(&self, uri: &str, normalize: bool, priority: LoadPriority) -> Result<CachedAudio> {
        let key = self.key(uri, normalize);

        let mut inner = self.inner.lock().await;
        let hit = match inner.entries.get(&key) {
            Some(CacheEntry::Ready { audio, .. }) => Some(audio.clone()),
            _ => None,
        };
        if let Some(audio) = hit {
            if priority == LoadPriority::Playback {
                touch(&mut inner.order, &key);
            }
            debug!(uri, "cache hit");
            return Ok(audio);
        }

        let waiter = match inner.entries.get(&key) {
            Some(CacheEntry::Loading { done }) => Some(done.subscribe()),
            _ => None,
        };
        match waiter {
            Some(mut rx) => {
                debug!(uri, "joining in-flight load");
                drop(inner);
                match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::FileLoadFailed {
                        uri: uri.to_string(),
                        cause: "load cancelled".to_string(),
                    }),
                }
            }
            None => {
                let (done, _) = broadcast::channel(8);
                inner.entries.insert(key.clone(), CacheEntry::Loading { done });
                drop(inner);
                self.load_and_publish(key, priority).await
            }
        }
    }

    /// Warm the cache without keeping the buffer
    pub async fn preload(&self, uri: &str, normalize: bool) -> Result<()> {
        self.get(uri, normalize, LoadPriority::Prefetch).await.map(|_| ())
    }

    /// Protect an entry against eviction while its buffer is scheduled
    pub async fn pin(&self, uri: &str, normalize: bool) {
        let key = self.key(uri, normalize);
        let mut inner = self.inner.lock().await;
        if let Some(CacheEntry::Ready { pins, .. }) = inner.entries.get_mut(&key) {
            *pins += 1;
        }
    }

    /// Release an eviction pin
    pub async fn unpin(&self, uri: &str, normalize: bool) {
        let key = self.key(uri, normalize);
        let mut inner = self.inner.lock().await;
        if let Some(CacheEntry::Ready { pins, .. }) = inner.entries.get_mut(&key) {
            *pins = pins.saturating_sub(1);
        }
        self.evict_excess(&mut inner);
    }

    /// Number of resident (Ready) entries
    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every unpinned entry
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let retained: Vec<CacheKey> = inner
            .order
            .iter()
            .filter(|key| {
                matches!(
                    inner.entries.get(*key),
                    Some(CacheEntry::Ready { pins, .. }) if *pins > 0
                )
            })
            .cloned()
            .collect();
        inner.entries.retain(|_, entry| match entry {
            CacheEntry::Ready { pins, .. } => *pins > 0,
            CacheEntry::Loading { .. } => true,
        });
        inner.order = retained.into();
    }

    async fn load_and_publish(&self, key: CacheKey, priority: LoadPriority) -> Result<CachedAudio> {
        let uri = key.uri.clone();
        info!(uri = %uri, normalized = key.normalized, "loading audio file");

        let result = self.load_blocking(&key).await;

        let mut inner = self.inner.lock().await;
        let done = match inner.entries.remove(&key) {
            Some(CacheEntry::Loading { done }) => Some(done),
            Some(other) => {
                // a clear() raced the load; keep whatever state won
                inner.entries.insert(key.clone(), other);
                None
            }
            None => None,
        };

        match &result {
            Ok(audio) => {
                inner.entries.insert(
                    key.clone(),
                    CacheEntry::Ready {
                        audio: audio.clone(),
                        pins: 0,
                    },
                );
                match priority {
                    LoadPriority::Playback => inner.order.push_back(key.clone()),
                    // prefetched entries are first in line for eviction
                    LoadPriority::Prefetch => inner.order.push_front(key.clone()),
                }
                self.evict_excess(&mut inner);
            }
            Err(error) => match priority {
                LoadPriority::Playback => warn!(uri = %uri, %error, "audio load failed"),
                LoadPriority::Prefetch => debug!(uri = %uri, %error, "prefetch failed"),
            },
        }
        drop(inner);

        if let Some(done) = done {
            let _ = done.send(result.clone());
        }
        result
    }

    async fn load_blocking(&self, key: &CacheKey) -> Result<CachedAudio> {
        let source = Arc::clone(&self.source);
        let uri = key.uri.clone();
        let normalizer = if key.normalized {
            self.normalizer.clone()
        } else {
            None
        };

        let load = tokio::task::spawn_blocking(move || -> Result<CachedAudio> {
            let loaded = source.read(&uri).map_err(|e| match e {
                MediaReadError::NotFound(uri) => Error::FileLoadFailed {
                    uri,
                    cause: "not found".to_string(),
                },
                MediaReadError::Decode { uri, detail } => Error::FileLoadFailed { uri, cause: detail },
            })?;
            let buffer = match &normalizer {
                Some(normalizer) => normalizer.normalize(&loaded.buffer)?,
                None => loaded.buffer,
            };
            Ok(CachedAudio {
                buffer: Arc::new(buffer),
                was_interleaved: loaded.was_interleaved,
            })
        });

        let deadline = self.timeout();
        match tokio::time::timeout(deadline, load).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::FileLoadFailed {
                uri: key.uri.clone(),
                cause: format!("decoder task failed: {join_error}"),
            }),
            Err(_) => Err(Error::FileLoadTimeout {
                uri: key.uri.clone(),
                duration: deadline,
            }),
        }
    }

    fn evict_excess(&self, inner: &mut CacheInner) {
        while inner.order.len() > self.capacity() {
            let Some(victim_pos) = inner.order.iter().position(|key| {
                matches!(
                    inner.entries.get(key),
                    Some(CacheEntry::Ready { pins, .. }) if *pins == 0
                )
            }) else {
                // everything resident is pinned; allow temporary overshoot
                break;
            };
            let key = inner.order.remove(victim_pos).expect("position valid");
            inner.entries.remove(&key);
            debug!(uri = %key.uri, "evicted from cache");
        }
    }
}

fn touch(order: &mut VecDeque<CacheKey>, key: &CacheKey) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let key = order.remove(pos).expect("position valid");
        order.push_back(key);
    }
}

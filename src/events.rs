//! Event system
//!
//! One-to-many broadcasting for lifecycle events (file loads, crossfade
//! phases, session warnings). Current-value observation (state, track,
//! position) lives on watch channels in [`crate::state`]; this bus is for
//! discrete happenings, buffered to the last few for slow consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::SessionValidation;
use crate::types::{CrossfadeKind, CrossfadeProgress, Track};

/// Events published on the engine's broadcast stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// A file load began (cache miss)
    FileLoadStarted {
        uri: String,
        timestamp: DateTime<Utc>,
    },

    /// A file load finished and the track gained format info
    FileLoadFinished {
        uri: String,
        duration: f64,
        timestamp: DateTime<Utc>,
    },

    /// A file load failed or timed out
    FileLoadFailed {
        uri: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A transition phase change or fade progress step
    CrossfadeProgressed {
        progress: CrossfadeProgress,
        kind: CrossfadeKind,
        timestamp: DateTime<Utc>,
    },

    /// A new track became current
    TrackChanged {
        track: Option<Track>,
        timestamp: DateTime<Utc>,
    },

    /// Session coordinator noticed something worth surfacing
    SessionWarning {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// The session category changed underneath the engine (External mode)
    SessionCategoryChanged {
        validation: SessionValidation,
        timestamp: DateTime<Utc>,
    },
}

impl PlayerEvent {
    /// Event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::FileLoadStarted { .. } => "FileLoadStarted",
            PlayerEvent::FileLoadFinished { .. } => "FileLoadFinished",
            PlayerEvent::FileLoadFailed { .. } => "FileLoadFailed",
            PlayerEvent::CrossfadeProgressed { .. } => "CrossfadeProgressed",
            PlayerEvent::TrackChanged { .. } => "TrackChanged",
            PlayerEvent::SessionWarning { .. } => "SessionWarning",
            PlayerEvent::SessionCategoryChanged { .. } => "SessionCategoryChanged",
        }
    }
}

/// Broadcast bus with a bounded replay buffer.
///
/// Slow subscribers lose the oldest events rather than applying backpressure
/// to the engine.
pub struct EventBus {
    tx: broadcast::Sender<PlayerEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    /// Emit without caring whether anyone is listening
    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    /// Bounded to the last 10 events
    fn default() -> Self {
        Self::new(10)
    }
}

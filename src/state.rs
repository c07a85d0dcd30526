//! Shared observable state
//!
//! Mirror of the facade's current state, track, and position on watch
//! channels. Components write through here; embedders subscribe for
//! current-value semantics (a new subscriber immediately sees the latest
//! value).

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::events::EventBus;
use crate::types::{PlayerState, Track};

/// A point in the current track
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    /// Seconds into the track
    pub current_time: f64,
    /// Track duration in seconds (0 when unknown)
    pub duration: f64,
}

impl PositionInfo {
    pub fn zero() -> Self {
        Self {
            current_time: 0.0,
            duration: 0.0,
        }
    }

    /// Seconds left before the track ends
    pub fn remaining(&self) -> f64 {
        (self.duration - self.current_time).max(0.0)
    }
}

/// Shared state accessible by all components
pub struct SharedState {
    state: watch::Sender<PlayerState>,
    track: watch::Sender<Option<Track>>,
    position: watch::Sender<PositionInfo>,
    /// Discrete lifecycle events, bounded to the last 10
    pub events: EventBus,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(PlayerState::Idle),
            track: watch::Sender::new(None),
            position: watch::Sender::new(PositionInfo::zero()),
            events: EventBus::default(),
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state.borrow().clone()
    }

    pub fn set_state(&self, state: PlayerState) -> PlayerState {
        let old = self.state();
        if old != state {
            tracing::info!(from = %old, to = %state, "player state changed");
            self.state.send_replace(state);
        }
        old
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.track.borrow().clone()
    }

    pub fn set_current_track(&self, track: Option<Track>) {
        self.track.send_replace(track);
    }

    pub fn subscribe_track(&self) -> watch::Receiver<Option<Track>> {
        self.track.subscribe()
    }

    pub fn position(&self) -> PositionInfo {
        *self.position.borrow()
    }

    pub fn set_position(&self, position: PositionInfo) {
        self.position.send_replace(position);
    }

    pub fn subscribe_position(&self) -> watch::Receiver<PositionInfo> {
        self.position.subscribe()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_transitions_observable() {
        let shared = SharedState::new();
        let mut rx = shared.subscribe_state();
        assert_eq!(*rx.borrow(), PlayerState::Idle);

        let old = shared.set_state(PlayerState::Playing);
        assert_eq!(old, PlayerState::Idle);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn unchanged_state_not_republished() {
        let shared = SharedState::new();
        shared.set_state(PlayerState::Playing);
        let mut rx = shared.subscribe_state();
        rx.mark_unchanged();
        shared.set_state(PlayerState::Playing);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn new_subscriber_sees_latest_position() {
        let shared = SharedState::new();
        shared.set_position(PositionInfo {
            current_time: 12.5,
            duration: 60.0,
        });
        let rx = shared.subscribe_position();
        assert_eq!(rx.borrow().current_time, 12.5);
        assert_eq!(rx.borrow().remaining(), 47.5);
    }
}

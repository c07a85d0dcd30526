//! Playlist with cursor and repeat semantics

use tracing::debug;
use uuid::Uuid;

use crate::types::{RepeatMode, Track, TrackInfo};

/// Ordered track sequence with a cursor.
///
/// `peek_*` never mutates; `advance_*` moves the cursor according to the
/// repeat mode. A wrap in Playlist mode counts one completed cycle so the
/// facade can honor a bounded repeat count.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    tracks: Vec<Track>,
    cursor: usize,
    completed_cycles: u32,
}

impl Playlist {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            cursor: 0,
            completed_cycles: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn completed_cycles(&self) -> u32 {
        self.completed_cycles
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// The track under the cursor
    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.cursor)
    }

    /// Replace the sequence; cursor and cycle count reset
    pub fn replace(&mut self, tracks: Vec<Track>) {
        debug!(count = tracks.len(), "replacing playlist");
        self.tracks = tracks;
        self.cursor = 0;
        self.completed_cycles = 0;
    }

    /// Move the cursor to an explicit index (clamped)
    pub fn set_cursor(&mut self, index: usize) {
        if !self.tracks.is_empty() {
            self.cursor = index.min(self.tracks.len() - 1);
        }
    }

    /// Attach format info gained from a load to the matching entry
    pub fn attach_info(&mut self, track_id: Uuid, info: TrackInfo) {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) {
            track.info = Some(info);
        }
    }

    /// Next track without moving the cursor
    pub fn peek_next(&self, repeat: RepeatMode) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current(),
            RepeatMode::Off => self.tracks.get(self.cursor + 1),
            RepeatMode::Playlist => {
                let next = (self.cursor + 1) % self.tracks.len();
                self.tracks.get(next)
            }
        }
    }

    /// Previous track without moving the cursor
    pub fn peek_previous(&self, repeat: RepeatMode) -> Option<&Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current(),
            RepeatMode::Off => self.cursor.checked_sub(1).and_then(|i| self.tracks.get(i)),
            RepeatMode::Playlist => {
                let prev = (self.cursor + self.tracks.len() - 1) % self.tracks.len();
                self.tracks.get(prev)
            }
        }
    }

    /// Advance the cursor and return the new current track
    pub fn advance_next(&mut self, repeat: RepeatMode) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current().cloned(),
            RepeatMode::Off => {
                if self.cursor + 1 < self.tracks.len() {
                    self.cursor += 1;
                    self.current().cloned()
                } else {
                    None
                }
            }
            RepeatMode::Playlist => {
                if self.cursor + 1 < self.tracks.len() {
                    self.cursor += 1;
                } else {
                    self.cursor = 0;
                    self.completed_cycles += 1;
                }
                self.current().cloned()
            }
        }
    }

    /// Step the cursor backwards and return the new current track
    pub fn advance_previous(&mut self, repeat: RepeatMode) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match repeat {
            RepeatMode::SingleTrack => self.current().cloned(),
            RepeatMode::Off => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.current().cloned()
                } else {
                    None
                }
            }
            RepeatMode::Playlist => {
                self.cursor = (self.cursor + self.tracks.len() - 1) % self.tracks.len();
                self.current().cloned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(n: usize) -> Playlist {
        Playlist::new((0..n).map(|i| Track::new(format!("uri-{i}"))).collect())
    }

    #[test]
    fn peek_does_not_move_cursor() {
        let pl = playlist(3);
        assert_eq!(pl.peek_next(RepeatMode::Off).unwrap().uri, "uri-1");
        assert_eq!(pl.cursor(), 0);
        assert!(pl.peek_previous(RepeatMode::Off).is_none());
    }

    #[test]
    fn off_stops_at_ends() {
        let mut pl = playlist(2);
        assert_eq!(pl.advance_next(RepeatMode::Off).unwrap().uri, "uri-1");
        assert!(pl.advance_next(RepeatMode::Off).is_none());
        assert_eq!(pl.cursor(), 1);
        assert_eq!(pl.advance_previous(RepeatMode::Off).unwrap().uri, "uri-0");
        assert!(pl.advance_previous(RepeatMode::Off).is_none());
    }

    #[test]
    fn playlist_mode_wraps_and_counts_cycles() {
        let mut pl = playlist(2);
        pl.advance_next(RepeatMode::Playlist);
        assert_eq!(pl.completed_cycles(), 0);
        let wrapped = pl.advance_next(RepeatMode::Playlist).unwrap();
        assert_eq!(wrapped.uri, "uri-0");
        assert_eq!(pl.completed_cycles(), 1);
        // backwards wrap does not count a cycle
        pl.advance_previous(RepeatMode::Playlist);
        assert_eq!(pl.completed_cycles(), 1);
    }

    #[test]
    fn single_track_repeats_in_place() {
        let mut pl = playlist(3);
        pl.set_cursor(1);
        assert_eq!(pl.peek_next(RepeatMode::SingleTrack).unwrap().uri, "uri-1");
        assert_eq!(pl.advance_next(RepeatMode::SingleTrack).unwrap().uri, "uri-1");
        assert_eq!(pl.cursor(), 1);
    }

    #[test]
    fn replace_resets_cursor() {
        let mut pl = playlist(3);
        pl.set_cursor(2);
        pl.replace(vec![Track::new("fresh")]);
        assert_eq!(pl.cursor(), 0);
        assert_eq!(pl.current().unwrap().uri, "fresh");
    }

    #[test]
    fn attach_info_by_id() {
        let mut pl = playlist(2);
        let id = pl.tracks()[1].id;
        pl.attach_info(
            id,
            TrackInfo {
                duration: 42.0,
                sample_rate: 44100,
                channels: 2,
                interleaved: true,
            },
        );
        assert_eq!(pl.tracks()[1].duration(), Some(42.0));
        assert!(pl.tracks()[0].info.is_none());
    }

    #[test]
    fn empty_playlist_is_inert() {
        let mut pl = Playlist::default();
        assert!(pl.peek_next(RepeatMode::Playlist).is_none());
        assert!(pl.advance_next(RepeatMode::Playlist).is_none());
        assert!(pl.current().is_none());
    }
}

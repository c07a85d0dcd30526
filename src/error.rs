//! Error types for the lumiere playback engine
//!
//! Every public operation returns `Result`; no error crosses the crate
//! boundary as a panic. Variants carry enough structure for an embedder to
//! branch on without parsing messages.

use std::time::Duration;
use thiserror::Error;

use crate::dsp::DspError;

/// Main error type for the playback engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Start requested with no playlist loaded
    #[error("playlist is empty")]
    EmptyPlaylist,

    /// Advance past the end with repeat off
    #[error("no next track available")]
    NoNextTrack,

    /// Advance before the start with repeat off
    #[error("no previous track available")]
    NoPreviousTrack,

    /// Operation not legal in the current facade state
    #[error("invalid state: cannot {attempted} while {current}")]
    InvalidState { current: String, attempted: String },

    /// Cache or host reader failed to produce a buffer
    #[error("failed to load {uri}: {cause}")]
    FileLoadFailed { uri: String, cause: String },

    /// The load race against the caller-supplied deadline was lost
    #[error("loading {uri} timed out after {duration:?}")]
    FileLoadTimeout { uri: String, duration: Duration },

    /// Session category/activation problem; in External mode carries the
    /// incompatible category name
    #[error("audio session configuration failed: {reason}")]
    SessionConfigurationFailed { reason: String },

    /// Graph prepare/start failure
    #[error("engine start failed: {reason}")]
    EngineStartFailed { reason: String },

    /// Skip called within the minimum interval, with another skip in flight,
    /// or the operation queue is at depth
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Rejected by `update_configuration` validation
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Loudness normalization failure during buffer load
    #[error(transparent)]
    Dsp(#[from] DspError),
}

impl Error {
    pub(crate) fn invalid_state(current: impl std::fmt::Display, attempted: &str) -> Self {
        Error::InvalidState {
            current: current.to_string(),
            attempted: attempted.to_string(),
        }
    }
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

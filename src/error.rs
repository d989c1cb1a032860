//! Error types for the PCM player

use thiserror::Error;

use crate::audio::buffer::BufferState;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors: assets, buffers and output devices
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Invalid asset name: {0}")]
    InvalidAssetName(String),

    #[error("IO error on asset {asset}: {source}")]
    Io {
        asset: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Output queue full")]
    QueueFull,

    #[error("Invalid buffer pool: {0}")]
    InvalidPool(String),

    #[error("Buffer {id} is {found:?}, expected {expected}")]
    BufferState {
        id: usize,
        expected: &'static str,
        found: BufferState,
    },

    #[error("Buffer {0} does not belong to this pool")]
    ForeignBuffer(usize),
}

impl AudioError {
    pub fn io(asset: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            asset: asset.into(),
            source,
        }
    }
}

/// Playback controller errors
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("A playback session is already active")]
    AlreadyPlaying,

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("Failed to spawn refill thread: {0}")]
    ThreadSpawn(String),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_display() {
        let err = AudioError::AssetNotFound("song.pcm".to_string());
        assert_eq!(err.to_string(), "Asset not found: song.pcm");
    }

    #[test]
    fn test_buffer_state_error_display() {
        let err = AudioError::BufferState {
            id: 3,
            expected: "Filling",
            found: BufferState::Free,
        };
        assert_eq!(err.to_string(), "Buffer 3 is Free, expected Filling");
    }

    #[test]
    fn test_playback_error_wraps_audio() {
        let err: PlaybackError = AudioError::QueueFull.into();
        assert_eq!(err.to_string(), "Output queue full");

        let top: Error = err.into();
        assert!(matches!(top, Error::Playback(PlaybackError::Audio(AudioError::QueueFull))));
    }
}

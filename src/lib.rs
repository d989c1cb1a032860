//! # PCM Stream Player
//!
//! Low-latency playback of raw PCM assets through a queued audio output.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Caller thread                                                        │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │        PlaybackController (playback::controller)               │  │
//! │  │        start(asset, format) / stop() / status()                │  │
//! │  └──────────────┬─────────────────────────────────────────────────┘  │
//! └─────────────────┼─────────────────────────────────────────────────────┘
//!                   │ spawns
//!                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Refill thread                                                        │
//! │  ┌──────────────┐    ┌───────────────┐    ┌────────────────────────┐ │
//! │  │AssetByteSource│──▶│  RingFeeder   │──▶│ OutputSink::enqueue     │ │
//! │  │(audio::source)│   │(playback::    │    │ (audio::sink)          │ │
//! │  └──────────────┘    │ feeder)       │    └───────────┬────────────┘ │
//! │                      └───────▲───────┘                │              │
//! └──────────────────────────────┼────────────────────────┼──────────────┘
//!                   BufferFreed  │                        │ FIFO
//! ┌──────────────────────────────┼────────────────────────▼──────────────┐
//! │  Device thread               │                                        │
//! │  ┌───────────────────────────┴────────────────────────────────────┐  │
//! │  │ completion callback: generation check, BufferPool::mark_free,  │  │
//! │  │ non-blocking signal to the refill thread                       │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod event;
pub mod playback;

pub use audio::{
    AssetByteSource, AssetStore, BufferPool, BufferState, ByteOrder, DirAssetStore,
    MemoryAssetStore, OutputSink, PcmBuffer, PcmFormat, SimulatedOutputSink, SinkCallbacks,
    SinkFactory,
};
pub use config::PlayerConfig;
pub use error::{AudioError, ConfigError, Error, PlaybackError, Result};
pub use event::{event_callback, EventCallback, PlaybackEvent, StopReason};
pub use playback::{PlaybackController, PlaybackState, PlayerStatus, SessionStats};

/// Application-wide constants
pub mod constants {
    /// Default sample rate of raw assets
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u8 = 2;

    /// Default sample width
    pub const DEFAULT_BITS_PER_SAMPLE: u8 = 16;

    /// Default number of buffers cycling between feeder and device
    pub const DEFAULT_BUFFER_COUNT: usize = 4;

    /// Default audio held by one buffer in milliseconds
    pub const DEFAULT_BUFFER_MS: u32 = 20;

    /// Double buffering is the minimum
    pub const MIN_BUFFER_COUNT: usize = 2;

    pub const MAX_BUFFER_COUNT: usize = 32;

    /// Default directory of the packaged asset store
    pub const DEFAULT_ASSET_DIR: &str = "assets";
}

//! Playback lifecycle events.
//!
//! Events are delivered in the order the state changed, on the caller thread
//! or the refill thread, never from the device callback. Handlers may log,
//! block briefly, or call `start`/`stop`/`status`; a `stop` issued from
//! inside a teardown returns at once and the teardown completes after the
//! handler does. `wait_for_idle` must not be called from a handler.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::playback::{PlaybackState, SessionStats};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// The asset was fully played
    EndOfStream,
    /// An asset read or the output device failed
    Failed { error: String },
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "stopped"),
            Self::EndOfStream => write!(f, "end of stream"),
            Self::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Notifications about a playback session
///
/// # Example
///
/// ```
/// use pcm_stream_player::{PlaybackEvent, StopReason};
///
/// fn handle_event(event: PlaybackEvent) {
///     match event {
///         PlaybackEvent::StateChanged { generation, state } => {
///             eprintln!("session {} is now {:?}", generation, state);
///         }
///         PlaybackEvent::Finished { reason: StopReason::Failed { error }, .. } => {
///             eprintln!("playback failed: {}", error);
///         }
///         PlaybackEvent::Finished { stats, .. } => {
///             eprintln!("played {} bytes", stats.bytes_queued);
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlaybackEvent {
    StateChanged {
        generation: u64,
        state: PlaybackState,
    },

    /// A session was torn down. Always followed by `StateChanged` to `Idle`.
    Finished {
        generation: u64,
        reason: StopReason,
        stats: SessionStats,
    },
}

impl PlaybackEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::StateChanged { generation, .. } | Self::Finished { generation, .. } => {
                *generation
            }
        }
    }
}

/// Callback type for receiving playback events.
///
/// Register via [`PlaybackController::on_event()`](crate::PlaybackController::on_event).
pub type EventCallback = Arc<dyn Fn(PlaybackEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(PlaybackEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_as_tagged_json() {
        let event = PlaybackEvent::Finished {
            generation: 3,
            reason: StopReason::Failed {
                error: "disk gone".to_string(),
            },
            stats: SessionStats::default(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"finished""#));
        assert!(json.contains(r#""kind":"failed""#));
        assert!(json.contains("disk gone"));

        let parsed: PlaybackEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.generation(), 3);
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::EndOfStream.to_string(), "end of stream");
        assert!(StopReason::Failed {
            error: "x".to_string()
        }
        .is_failure());
        assert!(!StopReason::Requested.is_failure());
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(PlaybackEvent::StateChanged {
            generation: 1,
            state: PlaybackState::Playing,
        });
        assert!(called.load(Ordering::SeqCst));
    }
}

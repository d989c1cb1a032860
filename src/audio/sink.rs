//! Output sink abstraction over a queued low-latency audio device
//!
//! A sink accepts filled [`PcmBuffer`]s in order, plays them in that same
//! order, and hands each one back through the registered completion callback
//! once the device has consumed it. The callback runs on the device's own
//! real-time thread, so implementations must not hold locks while calling it.

use std::fmt;
use std::sync::Arc;

use crate::audio::buffer::PcmBuffer;
use crate::audio::format::PcmFormat;
use crate::error::AudioError;

/// Invoked on the device thread with each fully consumed buffer
pub type CompletionCallback = Arc<dyn Fn(PcmBuffer) + Send + Sync>;

/// Invoked when the device reports an unrecoverable stream error
pub type FaultCallback = Arc<dyn Fn(AudioError) + Send + Sync>;

/// Callbacks a session registers with its sink
#[derive(Clone)]
pub struct SinkCallbacks {
    pub on_complete: CompletionCallback,
    pub on_fault: FaultCallback,
}

impl SinkCallbacks {
    pub fn new<C, F>(on_complete: C, on_fault: F) -> Self
    where
        C: Fn(PcmBuffer) + Send + Sync + 'static,
        F: Fn(AudioError) + Send + Sync + 'static,
    {
        Self {
            on_complete: Arc::new(on_complete),
            on_fault: Arc::new(on_fault),
        }
    }
}

impl fmt::Debug for SinkCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkCallbacks").finish_non_exhaustive()
    }
}

/// A buffer the sink refused, handed back so it is not lost from the pool
#[derive(Debug)]
pub struct EnqueueError {
    pub buffer: PcmBuffer,
    pub error: AudioError,
}

impl EnqueueError {
    pub fn new(buffer: PcmBuffer, error: AudioError) -> Self {
        Self { buffer, error }
    }

    pub fn into_parts(self) -> (PcmBuffer, AudioError) {
        (self.buffer, self.error)
    }
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {} rejected: {}", self.buffer.id(), self.error)
    }
}

impl std::error::Error for EnqueueError {}

/// Platform low-latency queued audio output.
///
/// `configure` and `register_callbacks` run once on the controller thread
/// before the sink is shared; the remaining methods may be called from the
/// refill and controller threads concurrently.
pub trait OutputSink: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Prepare the device for `format` with room for `queue_depth` buffers.
    ///
    /// Fails with [`AudioError::UnsupportedFormat`] when the device cannot
    /// honour the sample rate, channel count or bit depth.
    fn configure(&mut self, format: &PcmFormat, queue_depth: usize) -> Result<(), AudioError>;

    fn register_callbacks(&mut self, callbacks: SinkCallbacks);

    /// Append a filled buffer to the play queue
    fn enqueue(&self, buffer: PcmBuffer) -> Result<(), EnqueueError>;

    /// Start consuming queued buffers
    fn activate(&self) -> Result<(), AudioError>;

    /// Stop the device. No completion callback fires after this returns.
    fn deactivate(&self);

    /// No further buffers will be queued. An empty queue after this is the
    /// tail of the stream and not an underrun.
    fn mark_end_of_stream(&self) {}

    /// Buffers queued or draining on the device side
    fn queued_len(&self) -> usize;

    /// Times the device found the queue empty while active
    fn underruns(&self) -> u64 {
        0
    }
}

/// Creates a fresh sink for each playback session
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn OutputSink>, AudioError>;
}

impl<F> SinkFactory for F
where
    F: Fn() -> Result<Box<dyn OutputSink>, AudioError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn OutputSink>, AudioError> {
        self()
    }
}

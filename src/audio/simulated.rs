//! Simulated output device for running the player without audio hardware.
//!
//! In manual mode the caller plays the part of the device and decides when
//! each buffer finishes (`complete_next`, or `begin_draining` followed by
//! `finish_draining`). In clocked mode a device thread consumes one buffer per
//! period, much like a real buffer-queue callback.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::PcmBuffer;
use crate::audio::format::PcmFormat;
use crate::audio::sink::{EnqueueError, OutputSink, SinkCallbacks};
use crate::error::AudioError;

/// Formats the simulated device accepts
#[derive(Debug, Clone)]
pub struct SimulatedCapabilities {
    pub channels: Vec<u8>,
    pub bits_per_sample: Vec<u8>,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
}

impl Default for SimulatedCapabilities {
    fn default() -> Self {
        Self {
            channels: vec![1, 2],
            bits_per_sample: vec![8, 16, 24, 32],
            min_sample_rate: 8000,
            max_sample_rate: 192_000,
        }
    }
}

impl SimulatedCapabilities {
    fn check(&self, format: &PcmFormat) -> Result<(), AudioError> {
        if !self.channels.contains(&format.channel_count) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels",
                format.channel_count
            )));
        }
        if !self.bits_per_sample.contains(&format.bits_per_sample) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}-bit samples",
                format.bits_per_sample
            )));
        }
        if !(self.min_sample_rate..=self.max_sample_rate).contains(&format.sample_rate_hz) {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}Hz",
                format.sample_rate_hz
            )));
        }
        Ok(())
    }
}

struct DeviceThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    name: String,
    capabilities: SimulatedCapabilities,
    clock: Option<Duration>,
    queue: Mutex<VecDeque<PcmBuffer>>,
    queue_depth: AtomicUsize,
    draining: AtomicUsize,
    callbacks: Mutex<Option<SinkCallbacks>>,
    /// Held for reading while a completion is delivered; deactivation takes
    /// it for writing to wait out in-flight callbacks.
    dispatch: RwLock<()>,
    active: AtomicBool,
    fail_activation: AtomicBool,
    format: Mutex<Option<PcmFormat>>,
    played: Mutex<Vec<u8>>,
    enqueued: AtomicU64,
    completed: AtomicU64,
    underruns: AtomicU64,
    end_of_stream: AtomicBool,
    device: Mutex<Option<DeviceThread>>,
}

/// Cloneable handle to a simulated buffer-queue device
#[derive(Clone)]
pub struct SimulatedOutputSink {
    inner: Arc<Inner>,
}

impl SimulatedOutputSink {
    /// Device driven entirely by the caller
    pub fn manual() -> Self {
        Self::build(None, SimulatedCapabilities::default())
    }

    /// Device that consumes one queued buffer every `period` once active
    pub fn clocked(period: Duration) -> Self {
        Self::build(Some(period), SimulatedCapabilities::default())
    }

    pub fn with_capabilities(self, capabilities: SimulatedCapabilities) -> Self {
        Self::build(self.inner.clock, capabilities)
    }

    fn build(clock: Option<Duration>, capabilities: SimulatedCapabilities) -> Self {
        let name = match clock {
            Some(period) => format!("simulated({:?})", period),
            None => "simulated(manual)".to_string(),
        };
        Self {
            inner: Arc::new(Inner {
                name,
                capabilities,
                clock,
                queue: Mutex::new(VecDeque::new()),
                queue_depth: AtomicUsize::new(0),
                draining: AtomicUsize::new(0),
                callbacks: Mutex::new(None),
                dispatch: RwLock::new(()),
                active: AtomicBool::new(false),
                fail_activation: AtomicBool::new(false),
                format: Mutex::new(None),
                played: Mutex::new(Vec::new()),
                enqueued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
                end_of_stream: AtomicBool::new(false),
                device: Mutex::new(None),
            }),
        }
    }

    /// Play the oldest queued buffer to completion. Returns `false` when the
    /// device is inactive or nothing is queued.
    pub fn complete_next(&self) -> bool {
        self.inner.complete_next()
    }

    /// Take the oldest queued buffer off the queue as the device would when
    /// it starts playing it.
    pub fn begin_draining(&self) -> Option<PcmBuffer> {
        self.inner.begin_draining()
    }

    /// Report a buffer from [`begin_draining`](Self::begin_draining) as played.
    ///
    /// The completion is delivered even if the device was deactivated in the
    /// meantime, which models a callback already in flight during teardown.
    pub fn finish_draining(&self, buffer: PcmBuffer) {
        self.inner.finish_draining(buffer);
    }

    /// Report a device fault through the registered callback
    pub fn inject_fault(&self, message: impl Into<String>) {
        let callbacks = self.inner.callbacks.lock().clone();
        if let Some(callbacks) = callbacks {
            (callbacks.on_fault)(AudioError::DeviceError(message.into()));
        }
    }

    /// Make the next `activate` calls fail with a device error
    pub fn fail_activation(&self, fail: bool) {
        self.inner.fail_activation.store(fail, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Every byte the device has played, in play order
    pub fn played(&self) -> Vec<u8> {
        self.inner.played.lock().clone()
    }

    pub fn enqueued_count(&self) -> u64 {
        self.inner.enqueued.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn configured_format(&self) -> Option<PcmFormat> {
        *self.inner.format.lock()
    }

    /// Sink factory handing out clones of this device
    pub fn factory(&self) -> impl Fn() -> Result<Box<dyn OutputSink>, AudioError> + Send + Sync {
        let sink = self.clone();
        move || Ok(Box::new(sink.clone()) as Box<dyn OutputSink>)
    }
}

impl Inner {
    fn begin_draining(&self) -> Option<PcmBuffer> {
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        let mut queue = self.queue.lock();
        let Some(buffer) = queue.pop_front() else {
            if !self.end_of_stream.load(Ordering::SeqCst) {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        };
        self.draining.fetch_add(1, Ordering::SeqCst);
        drop(queue);

        if let Err(e) = buffer.mark_draining() {
            tracing::warn!("Simulated device drained buffer in unexpected state: {}", e);
        }
        Some(buffer)
    }

    fn finish_draining(&self, buffer: PcmBuffer) {
        let _dispatch = self.dispatch.read();
        self.deliver(buffer);
    }

    fn complete_next(&self) -> bool {
        let _dispatch = self.dispatch.read();
        match self.begin_draining() {
            Some(buffer) => {
                self.deliver(buffer);
                true
            }
            None => false,
        }
    }

    /// Caller must hold `dispatch` for reading
    fn deliver(&self, buffer: PcmBuffer) {
        self.played.lock().extend_from_slice(buffer.bytes());
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.draining.fetch_sub(1, Ordering::SeqCst);

        let callbacks = self.callbacks.lock().clone();
        if let Some(callbacks) = callbacks {
            (callbacks.on_complete)(buffer);
        }
    }
}

impl OutputSink for SimulatedOutputSink {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn configure(&mut self, format: &PcmFormat, queue_depth: usize) -> Result<(), AudioError> {
        format.validate()?;
        self.inner.capabilities.check(format)?;
        if queue_depth == 0 {
            return Err(AudioError::InvalidPool("queue depth must be non-zero".to_string()));
        }

        self.inner.queue.lock().clear();
        self.inner.draining.store(0, Ordering::SeqCst);
        self.inner.end_of_stream.store(false, Ordering::SeqCst);
        self.inner.queue_depth.store(queue_depth, Ordering::SeqCst);
        *self.inner.format.lock() = Some(*format);
        tracing::debug!(sink = %self.inner.name, ?format, queue_depth, "Configured simulated device");
        Ok(())
    }

    fn register_callbacks(&mut self, callbacks: SinkCallbacks) {
        *self.inner.callbacks.lock() = Some(callbacks);
    }

    fn enqueue(&self, buffer: PcmBuffer) -> Result<(), EnqueueError> {
        let mut queue = self.inner.queue.lock();
        let depth = self.inner.queue_depth.load(Ordering::SeqCst);
        if queue.len() + self.inner.draining.load(Ordering::SeqCst) >= depth {
            return Err(EnqueueError::new(buffer, AudioError::QueueFull));
        }
        queue.push_back(buffer);
        self.inner.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn activate(&self) -> Result<(), AudioError> {
        if self.inner.fail_activation.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceError(
                "simulated activation failure".to_string(),
            ));
        }
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(period) = self.inner.clock {
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name("simulated-device".to_string())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            inner.complete_next();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .map_err(|e| AudioError::DeviceError(e.to_string()))?;
            *self.inner.device.lock() = Some(DeviceThread { stop_tx, handle });
        }
        Ok(())
    }

    fn deactivate(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        // Wait for completions already being delivered
        drop(self.inner.dispatch.write());

        if let Some(device) = self.inner.device.lock().take() {
            let _ = device.stop_tx.send(());
            let _ = device.handle.join();
        }
    }

    fn mark_end_of_stream(&self) {
        self.inner.end_of_stream.store(true, Ordering::SeqCst);
    }

    fn queued_len(&self) -> usize {
        self.inner.queue.lock().len() + self.inner.draining.load(Ordering::SeqCst)
    }

    fn underruns(&self) -> u64 {
        self.inner.underruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{BufferPool, BufferState};
    use std::sync::atomic::AtomicUsize;

    fn filled(pool: &BufferPool, bytes: &[u8]) -> PcmBuffer {
        let mut buffer = pool.acquire_free().unwrap();
        buffer.spare_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.set_len(bytes.len());
        pool.mark_queued(&buffer).unwrap();
        buffer
    }

    #[test]
    fn test_manual_device_plays_in_order() {
        let pool = Arc::new(BufferPool::new(3, 4).unwrap());
        let mut sink = SimulatedOutputSink::manual();
        sink.configure(&PcmFormat::new(8000, 1, 8), 3).unwrap();

        let returned = Arc::new(AtomicUsize::new(0));
        let (p, r) = (pool.clone(), returned.clone());
        sink.register_callbacks(SinkCallbacks::new(
            move |buffer| {
                p.mark_free(buffer).unwrap();
                r.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));

        sink.enqueue(filled(&pool, &[1, 2])).unwrap();
        sink.enqueue(filled(&pool, &[3, 4])).unwrap();
        assert!(!sink.complete_next(), "inactive device plays nothing");

        sink.activate().unwrap();
        assert!(sink.complete_next());
        assert!(sink.complete_next());
        assert!(!sink.complete_next());

        assert_eq!(sink.played(), vec![1, 2, 3, 4]);
        assert_eq!(returned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.free_len(), 3);
        assert_eq!(sink.underruns(), 1);

        // Running dry after the last buffer is just the end of the stream
        sink.mark_end_of_stream();
        assert!(!sink.complete_next());
        assert_eq!(sink.underruns(), 1);
    }

    #[test]
    fn test_queue_full_returns_buffer() {
        let pool = BufferPool::new(3, 4).unwrap();
        let mut sink = SimulatedOutputSink::manual();
        sink.configure(&PcmFormat::new(8000, 1, 8), 1).unwrap();

        sink.enqueue(filled(&pool, &[1])).unwrap();
        let err = sink.enqueue(filled(&pool, &[2])).unwrap_err();
        assert!(matches!(err.error, AudioError::QueueFull));
        assert_eq!(err.buffer.state(), BufferState::Queued);
    }

    #[test]
    fn test_begin_draining_marks_state() {
        let pool = BufferPool::new(2, 4).unwrap();
        let mut sink = SimulatedOutputSink::manual();
        sink.configure(&PcmFormat::new(8000, 1, 8), 2).unwrap();
        sink.enqueue(filled(&pool, &[7])).unwrap();
        sink.activate().unwrap();

        let buffer = sink.begin_draining().unwrap();
        assert_eq!(buffer.state(), BufferState::Draining);
        assert_eq!(sink.queued_len(), 1);

        sink.finish_draining(buffer);
        assert_eq!(sink.queued_len(), 0);
    }

    #[test]
    fn test_unsupported_format() {
        let caps = SimulatedCapabilities {
            channels: vec![2],
            bits_per_sample: vec![16],
            min_sample_rate: 44100,
            max_sample_rate: 48000,
        };
        let mut sink = SimulatedOutputSink::manual().with_capabilities(caps);
        assert!(matches!(
            sink.configure(&PcmFormat::new(44100, 1, 16), 2),
            Err(AudioError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            sink.configure(&PcmFormat::new(96000, 2, 16), 2),
            Err(AudioError::UnsupportedFormat(_))
        ));
        assert!(sink.configure(&PcmFormat::new(48000, 2, 16), 2).is_ok());
    }

    #[test]
    fn test_clocked_device_drains_queue() {
        let pool = Arc::new(BufferPool::new(2, 4).unwrap());
        let mut sink = SimulatedOutputSink::clocked(Duration::from_millis(1));
        sink.configure(&PcmFormat::new(8000, 1, 8), 2).unwrap();
        let p = pool.clone();
        sink.register_callbacks(SinkCallbacks::new(
            move |buffer| {
                let _ = p.mark_free(buffer);
            },
            |_| {},
        ));

        sink.enqueue(filled(&pool, &[1, 1])).unwrap();
        sink.enqueue(filled(&pool, &[2, 2])).unwrap();
        sink.activate().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.completed_count() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        sink.deactivate();

        assert_eq!(sink.played(), vec![1, 1, 2, 2]);
        assert_eq!(pool.free_len(), 2);
        assert!(!sink.is_active());
    }

    #[test]
    fn test_activation_failure() {
        let sink = SimulatedOutputSink::manual();
        sink.fail_activation(true);
        assert!(matches!(sink.activate(), Err(AudioError::DeviceError(_))));
        assert!(!sink.is_active());
    }
}

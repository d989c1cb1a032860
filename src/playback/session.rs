//! Resources of one playback session and the generation gate that fences
//! them off from the device thread once the session is torn down.

use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::buffer::{BufferPool, BufferState, PcmBuffer};
use crate::audio::format::PcmFormat;
use crate::audio::sink::{OutputSink, SinkCallbacks, SinkFactory};
use crate::audio::source::{AssetByteSource, AssetStore};
use crate::config::BufferConfig;
use crate::error::AudioError;
use crate::playback::feeder::{FeederSignal, RingFeeder};

/// Generation value meaning "no live session"
pub const NO_SESSION: u64 = 0;

/// The generation currently allowed to touch session resources.
///
/// The refill thread and the device callback enter the gate before mutating
/// buffers; teardown retires the generation under the write lock, which
/// waits for every holder to leave. After `retire` returns no holder of the
/// old generation can get in again.
pub struct GenerationGate {
    live: RwLock<u64>,
}

/// Proof that the session was live when entered; retirement waits for it
pub struct GateGuard<'a> {
    _live: RwLockReadGuard<'a, u64>,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(NO_SESSION),
        }
    }

    pub fn open(&self, generation: u64) {
        *self.live.write() = generation;
    }

    /// Close the gate for `generation`. Returns `false` if it was not live.
    pub fn retire(&self, generation: u64) -> bool {
        let mut live = self.live.write();
        if *live == generation {
            *live = NO_SESSION;
            true
        } else {
            false
        }
    }

    pub fn live(&self) -> u64 {
        *self.live.read()
    }

    pub fn is_live(&self, generation: u64) -> bool {
        self.live() == generation
    }

    /// Enter for `generation`, waiting out a retirement in progress
    pub fn enter(&self, generation: u64) -> Option<GateGuard<'_>> {
        let live = self.live.read();
        (*live == generation).then_some(GateGuard { _live: live })
    }

    /// Non-blocking enter for the device thread. Contention with a
    /// retirement counts as stale.
    pub fn try_enter(&self, generation: u64) -> Option<GateGuard<'_>> {
        let live = self.live.try_read()?;
        (*live == generation).then_some(GateGuard { _live: live })
    }
}

impl Default for GenerationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GenerationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationGate")
            .field("live", &self.live.try_read().map(|g| *g))
            .finish()
    }
}

/// Live counters shared by the refill thread and the device callback
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub primed: AtomicU64,
    pub refills: AtomicU64,
    pub completed: AtomicU64,
    pub bytes_queued: AtomicU64,
}

/// Snapshot of a session's counters, taken at teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub generation: u64,
    pub buffer_count: usize,
    pub buffer_capacity: usize,
    /// Buffers enqueued before the device was activated
    pub primed: u64,
    /// Buffers enqueued after priming
    pub refills: u64,
    /// Completions accepted for the live generation
    pub completed: u64,
    pub bytes_queued: u64,
    pub underruns: u64,
    /// Buffers back in the pool's free set at teardown
    pub buffers_returned: usize,
}

/// Room for a wakeup per buffer plus device faults
const SIGNAL_SLACK: usize = 4;

/// Everything one `start` allocates: pool, configured sink and the counters.
/// The asset itself is owned by the session's [`RingFeeder`].
pub struct PlaybackSession {
    generation: u64,
    asset: String,
    format: PcmFormat,
    pool: Arc<BufferPool>,
    sink: Arc<dyn OutputSink>,
    counters: Arc<SessionCounters>,
    gate: Arc<GenerationGate>,
    signals: Sender<FeederSignal>,
    /// Buffers handed back by stale completions, released off the device thread
    reclaimed: Arc<ArrayQueue<PcmBuffer>>,
}

impl PlaybackSession {
    /// Open the asset, allocate the pool and configure a fresh sink.
    ///
    /// Nothing is queued yet; the returned feeder primes the sink once it
    /// runs. The gate must be opened for `generation` before that.
    pub fn open(
        generation: u64,
        asset: &str,
        format: PcmFormat,
        buffers: &BufferConfig,
        store: &dyn AssetStore,
        sinks: &dyn SinkFactory,
        gate: Arc<GenerationGate>,
    ) -> Result<(Self, RingFeeder), AudioError> {
        format.validate()?;
        let source = AssetByteSource::open(store, asset)?;
        let pool = Arc::new(BufferPool::new(buffers.count, buffers.capacity_for(&format))?);

        let mut sink = sinks.create()?;
        sink.configure(&format, pool.len())?;

        let counters = Arc::new(SessionCounters::default());
        let (signals, signal_rx) = bounded(pool.len() + SIGNAL_SLACK);
        let reclaimed = Arc::new(ArrayQueue::new(pool.len()));
        sink.register_callbacks(completion_callbacks(
            generation,
            gate.clone(),
            pool.clone(),
            counters.clone(),
            signals.clone(),
            reclaimed.clone(),
        ));
        let sink: Arc<dyn OutputSink> = Arc::from(sink);

        tracing::debug!(
            generation,
            asset,
            sink = sink.name(),
            buffers = pool.len(),
            capacity = pool.buffer_capacity(),
            "Session resources ready"
        );

        let feeder = RingFeeder::new(
            generation,
            source,
            format,
            pool.clone(),
            sink.clone(),
            gate.clone(),
            counters.clone(),
            signal_rx,
        );
        let session = Self {
            generation,
            asset: asset.to_string(),
            format,
            pool,
            sink,
            counters,
            gate,
            signals,
            reclaimed,
        };
        Ok((session, feeder))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn sink(&self) -> &dyn OutputSink {
        self.sink.as_ref()
    }

    /// Fence off the device: retire the generation, then deactivate the
    /// sink so no completion for it can still be running.
    pub fn retire(&self) {
        self.gate.retire(self.generation);
        self.sink.deactivate();
        tracing::debug!(generation = self.generation, "Session retired");
    }

    /// Wake the refill thread so it notices the retired generation
    pub fn wake_feeder(&self) {
        let _ = self.signals.try_send(FeederSignal::Shutdown);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            generation: self.generation,
            buffer_count: self.pool.len(),
            buffer_capacity: self.pool.buffer_capacity(),
            primed: self.counters.primed.load(Ordering::Relaxed),
            refills: self.counters.refills.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            bytes_queued: self.counters.bytes_queued.load(Ordering::Relaxed),
            underruns: self.sink.underruns(),
            buffers_returned: self.pool.count_in(BufferState::Free),
        }
    }

    /// Release the pool and sink, returning the final statistics
    pub fn finish(self) -> SessionStats {
        while let Some(buffer) = self.reclaimed.pop() {
            if let Err(e) = self.pool.mark_free(buffer) {
                tracing::warn!(generation = self.generation, "Dropping reclaimed buffer: {}", e);
            }
        }
        let stats = self.stats();
        if stats.buffers_returned < stats.buffer_count {
            tracing::debug!(
                generation = self.generation,
                outstanding = stats.buffer_count - stats.buffers_returned,
                "Discarding buffers still queued on the device"
            );
        }
        if stats.underruns > 0 {
            tracing::warn!(
                generation = self.generation,
                underruns = stats.underruns,
                "Device ran out of queued audio during playback"
            );
        }
        stats
    }
}

impl fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("generation", &self.generation)
            .field("asset", &self.asset)
            .field("format", &self.format)
            .field("pool", &self.pool)
            .field("sink", &self.sink.name())
            .finish()
    }
}

/// Device-side callbacks. They run on the device's real-time thread: no
/// blocking, no logging, no allocation or deallocation.
fn completion_callbacks(
    generation: u64,
    gate: Arc<GenerationGate>,
    pool: Arc<BufferPool>,
    counters: Arc<SessionCounters>,
    signals: Sender<FeederSignal>,
    reclaimed: Arc<ArrayQueue<PcmBuffer>>,
) -> SinkCallbacks {
    let fault_gate = gate.clone();
    let fault_signals = signals.clone();

    SinkCallbacks::new(
        move |buffer: PcmBuffer| {
            // Stale completions park their buffer for teardown to release
            let Some(_live) = gate.try_enter(generation) else {
                if let Err(buffer) = reclaimed.push(buffer) {
                    std::mem::forget(buffer);
                }
                return;
            };
            counters.completed.fetch_add(1, Ordering::Relaxed);
            if pool.mark_free(buffer).is_ok() {
                let _ = signals.try_send(FeederSignal::BufferFreed);
            }
        },
        move |error: AudioError| {
            let Some(_live) = fault_gate.try_enter(generation) else {
                return;
            };
            let _ = fault_signals.try_send(FeederSignal::DeviceFault(error));
        },
    )
}

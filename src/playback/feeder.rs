//! Refill thread: moves bytes from the asset into free buffers and hands
//! them to the sink in read order.

use crossbeam_channel::Receiver;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::audio::buffer::{BufferPool, PcmBuffer};
use crate::audio::format::PcmFormat;
use crate::audio::sink::OutputSink;
use crate::audio::source::AssetByteSource;
use crate::error::AudioError;
use crate::playback::session::{GenerationGate, SessionCounters};

/// Wakeups delivered to the refill thread
#[derive(Debug)]
pub enum FeederSignal {
    /// The device handed a buffer back to the pool
    BufferFreed,
    /// The device reported an unrecoverable error
    DeviceFault(AudioError),
    Shutdown,
}

/// How the refill loop ended
#[derive(Debug)]
pub enum FeederExit {
    /// Every byte was played and every buffer is back in the pool
    EndOfStream,
    Failed(AudioError),
    /// The generation was retired by `stop`
    Shutdown,
}

pub struct RingFeeder {
    generation: u64,
    source: AssetByteSource,
    format: PcmFormat,
    pool: Arc<BufferPool>,
    sink: Arc<dyn OutputSink>,
    gate: Arc<GenerationGate>,
    counters: Arc<SessionCounters>,
    signals: Receiver<FeederSignal>,
    at_eof: bool,
    /// The sink has been told nothing more is coming
    eof_announced: bool,
}

impl RingFeeder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generation: u64,
        source: AssetByteSource,
        format: PcmFormat,
        pool: Arc<BufferPool>,
        sink: Arc<dyn OutputSink>,
        gate: Arc<GenerationGate>,
        counters: Arc<SessionCounters>,
        signals: Receiver<FeederSignal>,
    ) -> Self {
        Self {
            generation,
            source,
            format,
            pool,
            sink,
            gate,
            counters,
            signals,
            at_eof: false,
            eof_announced: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Prime the sink, activate it, then refill on every freed buffer until
    /// the asset is drained, the device fails or the generation is retired.
    ///
    /// `on_playing` runs once the device is active; returning `false` means
    /// the session is already being stopped.
    pub fn run<F>(mut self, on_playing: F) -> FeederExit
    where
        F: FnOnce() -> bool,
    {
        let exit = self.play(on_playing);
        self.source.close();
        exit
    }

    fn play<F>(&mut self, on_playing: F) -> FeederExit
    where
        F: FnOnce() -> bool,
    {
        let primed = match self.prime() {
            Ok(primed) => primed,
            Err(e) => return FeederExit::Failed(e),
        };
        if self.is_drained() {
            tracing::info!(generation = self.generation, "Asset is empty, nothing to play");
            return FeederExit::EndOfStream;
        }

        {
            let Some(_live) = self.gate.enter(self.generation) else {
                return FeederExit::Shutdown;
            };
            if let Err(e) = self.sink.activate() {
                return FeederExit::Failed(e);
            }
        }
        tracing::debug!(generation = self.generation, primed, "Output activated");

        if !on_playing() {
            return FeederExit::Shutdown;
        }

        loop {
            match self.signals.recv() {
                Ok(FeederSignal::BufferFreed) => {}
                Ok(FeederSignal::DeviceFault(e)) => return FeederExit::Failed(e),
                Ok(FeederSignal::Shutdown) | Err(_) => return FeederExit::Shutdown,
            }
            if !self.gate.is_live(self.generation) {
                return FeederExit::Shutdown;
            }
            if let Err(e) = self.refill() {
                return FeederExit::Failed(e);
            }
            if self.is_drained() {
                return FeederExit::EndOfStream;
            }
        }
    }

    /// Fill and enqueue every free buffer before the device starts
    pub fn prime(&mut self) -> Result<usize, AudioError> {
        self.fill_free_buffers(true)
    }

    /// Fill and enqueue whatever the device has handed back
    pub fn refill(&mut self) -> Result<usize, AudioError> {
        self.fill_free_buffers(false)
    }

    /// End of asset reached and the device has returned every buffer
    pub fn is_drained(&self) -> bool {
        self.at_eof && self.pool.free_len() == self.pool.len()
    }

    pub fn is_at_eof(&self) -> bool {
        self.at_eof
    }

    fn fill_free_buffers(&mut self, priming: bool) -> Result<usize, AudioError> {
        let mut queued = 0;
        while !self.at_eof {
            let Some(buffer) = self.pool.acquire_free() else {
                break;
            };
            let Some(buffer) = self.fill(buffer)? else {
                break;
            };
            if !self.submit(buffer)? {
                break;
            }

            queued += 1;
            let counter = if priming {
                &self.counters.primed
            } else {
                &self.counters.refills
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        if self.at_eof && !self.eof_announced {
            self.sink.mark_end_of_stream();
            self.eof_announced = true;
        }
        Ok(queued)
    }

    /// Read the next chunk into `buffer`. An empty read returns the buffer
    /// to the pool and yields `None`.
    fn fill(&mut self, mut buffer: PcmBuffer) -> Result<Option<PcmBuffer>, AudioError> {
        let capacity = buffer.capacity();
        let read = match self.source.read(buffer.spare_mut()) {
            Ok(read) => read,
            Err(e) => {
                tracing::error!(generation = self.generation, "Asset read failed: {}", e);
                self.pool.mark_free(buffer)?;
                return Err(e);
            }
        };

        if read < capacity {
            self.at_eof = true;
            tracing::debug!(
                generation = self.generation,
                offset = self.source.offset(),
                "Reached end of asset"
            );
        }

        let whole_frames = self.format.align_to_frame(read);
        if whole_frames < read {
            tracing::warn!(
                generation = self.generation,
                dropped = read - whole_frames,
                "Asset ends with a partial frame, dropping trailing bytes"
            );
        }

        if whole_frames == 0 {
            self.pool.mark_free(buffer)?;
            return Ok(None);
        }
        buffer.set_len(whole_frames);
        Ok(Some(buffer))
    }

    /// Queue `buffer` on the sink. Returns `false` if the generation was
    /// retired in the meantime.
    fn submit(&mut self, buffer: PcmBuffer) -> Result<bool, AudioError> {
        let Some(_live) = self.gate.enter(self.generation) else {
            self.pool.mark_free(buffer)?;
            return Ok(false);
        };

        self.pool.mark_queued(&buffer)?;
        let len = buffer.len() as u64;
        if let Err(rejected) = self.sink.enqueue(buffer) {
            let (buffer, error) = rejected.into_parts();
            self.pool.mark_free(buffer)?;
            tracing::error!(generation = self.generation, "Enqueue failed: {}", error);
            return Err(error);
        }
        self.counters.bytes_queued.fetch_add(len, Ordering::Relaxed);
        Ok(true)
    }
}

impl std::fmt::Debug for RingFeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingFeeder")
            .field("generation", &self.generation)
            .field("asset", &self.source.name())
            .field("offset", &self.source.offset())
            .field("at_eof", &self.at_eof)
            .finish()
    }
}

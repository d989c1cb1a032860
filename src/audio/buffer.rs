//! Fixed pool of reusable PCM buffers
//!
//! All buffers are allocated once when the pool is created. After that a
//! buffer only ever moves by value between the refill thread (Free/Filling),
//! the output sink (Queued/Draining) and the pool's lock-free free list, so
//! nothing on the real-time path allocates.
//!
//! Each buffer also carries a shared handle to the pool's state table, which
//! lets the sink record `Draining` without holding the pool and lets the pool
//! reject buffers that came from a different pool.

use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::constants::{MAX_BUFFER_COUNT, MIN_BUFFER_COUNT};
use crate::error::AudioError;

/// Lifecycle state of a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum BufferState {
    /// In the pool, owned by the feeder
    Free = 0,
    /// Taken by the feeder, being filled from the asset
    Filling = 1,
    /// Handed to the output sink, waiting for the device
    Queued = 2,
    /// Being consumed by the device
    Draining = 3,
}

impl BufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::Filling,
            2 => Self::Queued,
            _ => Self::Draining,
        }
    }
}

type StateTable = Arc<[AtomicU8]>;

/// A fixed-capacity byte buffer owned by exactly one party at a time
pub struct PcmBuffer {
    id: usize,
    data: Box<[u8]>,
    len: usize,
    states: StateTable,
}

impl PcmBuffer {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Valid bytes, i.e. the part of the buffer that will be played
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Whole backing storage, for the feeder to read into
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the number of valid bytes (clamped to capacity)
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.states[self.id].load(Ordering::Acquire))
    }

    /// Record that the device has started consuming this buffer
    pub fn mark_draining(&self) -> Result<(), AudioError> {
        self.transition(&[BufferState::Queued], BufferState::Draining, "Queued")
    }

    fn transition(
        &self,
        from: &[BufferState],
        to: BufferState,
        expected: &'static str,
    ) -> Result<(), AudioError> {
        let cell = &self.states[self.id];
        let current = cell.load(Ordering::Acquire);
        let found = BufferState::from_u8(current);
        if !from.contains(&found) {
            return Err(AudioError::BufferState {
                id: self.id,
                expected,
                found,
            });
        }
        // Only the current owner ever transitions a buffer, so a failed
        // exchange means the table was corrupted from outside.
        cell.compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| AudioError::BufferState {
                id: self.id,
                expected,
                found: BufferState::from_u8(actual),
            })
    }
}

impl fmt::Debug for PcmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcmBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Fixed set of N reusable buffers
pub struct BufferPool {
    free: ArrayQueue<PcmBuffer>,
    states: StateTable,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `buffer_capacity` bytes each
    pub fn new(count: usize, buffer_capacity: usize) -> Result<Self, AudioError> {
        if !(MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT).contains(&count) {
            return Err(AudioError::InvalidPool(format!(
                "buffer count {} outside {}..={}",
                count, MIN_BUFFER_COUNT, MAX_BUFFER_COUNT
            )));
        }
        if buffer_capacity == 0 {
            return Err(AudioError::InvalidPool(
                "buffer capacity must be non-zero".to_string(),
            ));
        }

        let states: StateTable = (0..count)
            .map(|_| AtomicU8::new(BufferState::Free as u8))
            .collect::<Vec<_>>()
            .into();
        let free = ArrayQueue::new(count);
        for id in 0..count {
            let buffer = PcmBuffer {
                id,
                data: vec![0u8; buffer_capacity].into_boxed_slice(),
                len: 0,
                states: states.clone(),
            };
            // Queue has exactly `count` slots
            let _ = free.push(buffer);
        }

        Ok(Self {
            free,
            states,
            buffer_capacity,
        })
    }

    /// Take a free buffer for filling, or `None` if every buffer is in use
    pub fn acquire_free(&self) -> Option<PcmBuffer> {
        let mut buffer = self.free.pop()?;
        buffer.len = 0;
        self.states[buffer.id].store(BufferState::Filling as u8, Ordering::Release);
        Some(buffer)
    }

    /// Filling -> Queued, just before the buffer is handed to the sink
    pub fn mark_queued(&self, buffer: &PcmBuffer) -> Result<(), AudioError> {
        self.check_owner(buffer)?;
        buffer.transition(&[BufferState::Filling], BufferState::Queued, "Filling")
    }

    /// Return a buffer to the free list.
    ///
    /// Called by the consumer once the device has drained it, or by the
    /// feeder for a buffer it acquired but never queued.
    pub fn mark_free(&self, buffer: PcmBuffer) -> Result<(), AudioError> {
        self.check_owner(&buffer)?;
        buffer.transition(
            &[
                BufferState::Filling,
                BufferState::Queued,
                BufferState::Draining,
            ],
            BufferState::Free,
            "Filling, Queued or Draining",
        )?;
        // Cannot overflow: the pool never holds more than its own buffers
        let _ = self.free.push(buffer);
        Ok(())
    }

    fn check_owner(&self, buffer: &PcmBuffer) -> Result<(), AudioError> {
        if Arc::ptr_eq(&self.states, &buffer.states) {
            Ok(())
        } else {
            Err(AudioError::ForeignBuffer(buffer.id))
        }
    }

    /// Number of buffers in the pool
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Buffers currently sitting in the free list
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn state_of(&self, id: usize) -> Option<BufferState> {
        self.states
            .get(id)
            .map(|cell| BufferState::from_u8(cell.load(Ordering::Acquire)))
    }

    /// Snapshot of every buffer's state, indexed by id
    pub fn states(&self) -> Vec<BufferState> {
        self.states
            .iter()
            .map(|cell| BufferState::from_u8(cell.load(Ordering::Acquire)))
            .collect()
    }

    pub fn count_in(&self, state: BufferState) -> usize {
        self.states()
            .into_iter()
            .filter(|s| *s == state)
            .count()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffers", &self.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("free", &self.free_len())
            .finish()
    }
}

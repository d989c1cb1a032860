//! Playback state machine: at most one session, startable and stoppable
//! from any thread.
//!
//! ```text
//! Idle ──start──▶ Starting ──primed──▶ Playing ──stop / end / failure──▶ Stopping ──▶ Idle
//! ```
//!
//! `start` and `stop` are serialised by a transition lock. A session that
//! ends on its own (end of stream, read error, device fault) is torn down by
//! its refill thread using only the state lock, so `stop` can always join
//! that thread without deadlocking. The refill thread never blocks on the
//! transition lock for the same reason.
//!
//! Events are queued under the state lock as the phase changes and handed
//! to observers outside of it, so observers see transitions in order and may
//! call back into the controller.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::audio::format::PcmFormat;
use crate::audio::sink::SinkFactory;
use crate::audio::source::{AssetStore, DirAssetStore};
use crate::config::{BufferConfig, PlayerConfig};
use crate::error::PlaybackError;
use crate::event::{EventCallback, PlaybackEvent, StopReason};
use crate::playback::feeder::FeederExit;
use crate::playback::session::{GenerationGate, PlaybackSession, SessionStats};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    /// Session allocated, buffers being primed
    Starting,
    Playing,
    /// Session being torn down
    Stopping,
}

impl PlaybackState {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Snapshot returned by [`PlaybackController::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    /// Generation of the current or most recent session, 0 before any start
    pub generation: u64,
    pub asset: Option<String>,
    pub last_stop: Option<StopReason>,
}

struct ActiveSession {
    session: PlaybackSession,
    feeder: Option<JoinHandle<()>>,
}

impl ActiveSession {
    /// Full teardown from a thread other than the refill thread
    fn shutdown(mut self) -> SessionStats {
        self.session.retire();
        self.session.wake_feeder();
        if let Some(handle) = self.feeder.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!(
                    generation = self.session.generation(),
                    "Refill thread panicked"
                );
            }
        }
        self.session.finish()
    }

    /// Teardown on the refill thread itself, which is about to exit
    fn finish_in_place(self) -> SessionStats {
        self.session.retire();
        drop(self.feeder);
        self.session.finish()
    }
}

struct ControllerState {
    phase: PlaybackState,
    generation: u64,
    asset: Option<String>,
    last_stop: Option<StopReason>,
    active: Option<ActiveSession>,
    /// Thread that moved the session to Stopping and is tearing it down
    teardown_thread: Option<ThreadId>,
    /// Refill thread of the current session
    refill_thread: Option<ThreadId>,
}

impl ControllerState {
    /// `thread` is the one a teardown in progress is waiting on
    fn is_teardown_thread(&self, thread: ThreadId) -> bool {
        self.teardown_thread == Some(thread) || self.refill_thread == Some(thread)
    }
}

#[derive(Default)]
struct Observers {
    callbacks: Mutex<Vec<EventCallback>>,
    channels: Mutex<Vec<Sender<PlaybackEvent>>>,
    pending: Mutex<VecDeque<PlaybackEvent>>,
    /// Held by the one thread currently delivering `pending`
    dispatch: Mutex<()>,
}

impl Observers {
    /// Record an event. Called with the state lock held so the queue
    /// follows the order of state changes.
    fn queue(&self, event: PlaybackEvent) {
        self.pending.lock().push_back(event);
    }

    /// Deliver queued events. If another thread (or an outer frame of this
    /// one) is already delivering, it picks these up too.
    fn flush(&self) {
        loop {
            let Some(_dispatch) = self.dispatch.try_lock() else {
                return;
            };
            loop {
                let next = self.pending.lock().pop_front();
                match next {
                    Some(event) => self.deliver(event),
                    None => break,
                }
            }
            drop(_dispatch);
            // An event queued after the last pop but before the unlock
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: PlaybackEvent) {
        let callbacks = self.callbacks.lock().clone();
        for callback in &callbacks {
            callback(event.clone());
        }
        self.channels
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

struct ControllerInner {
    store: Arc<dyn AssetStore>,
    sinks: Arc<dyn SinkFactory>,
    buffers: BufferConfig,
    gate: Arc<GenerationGate>,
    transition: ReentrantMutex<()>,
    state: Mutex<ControllerState>,
    idle: Condvar,
    observers: Observers,
}

/// Starts and stops playback sessions.
///
/// Dropping the controller stops any active session.
pub struct PlaybackController {
    inner: Arc<ControllerInner>,
}

impl PlaybackController {
    pub fn new<S, F>(store: S, sinks: F, buffers: BufferConfig) -> Self
    where
        S: AssetStore + 'static,
        F: SinkFactory + 'static,
    {
        Self::with_shared(Arc::new(store), Arc::new(sinks), buffers)
    }

    pub fn with_shared(
        store: Arc<dyn AssetStore>,
        sinks: Arc<dyn SinkFactory>,
        buffers: BufferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                store,
                sinks,
                buffers,
                gate: Arc::new(GenerationGate::new()),
                transition: ReentrantMutex::new(()),
                state: Mutex::new(ControllerState {
                    phase: PlaybackState::Idle,
                    generation: 0,
                    asset: None,
                    last_stop: None,
                    active: None,
                    teardown_thread: None,
                    refill_thread: None,
                }),
                idle: Condvar::new(),
                observers: Observers::default(),
            }),
        }
    }

    /// Controller over the configured asset directory
    pub fn from_config<F>(config: &PlayerConfig, sinks: F) -> Self
    where
        F: SinkFactory + 'static,
    {
        Self::new(
            DirAssetStore::new(&config.assets.root),
            sinks,
            config.buffers.clone(),
        )
    }

    /// Start playing `asset` in `format` and return the session generation.
    ///
    /// Returns once the session is allocated and its refill thread is
    /// running; priming and activation continue on that thread.
    pub fn start(&self, asset: &str, format: PcmFormat) -> Result<u64, PlaybackError> {
        self.inner.start(asset, format)
    }

    /// Stop the active session, if any. Safe to call from any thread at any
    /// time; returns once the session's resources are released.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state.lock().phase
    }

    pub fn status(&self) -> PlayerStatus {
        let state = self.inner.state.lock();
        PlayerStatus {
            state: state.phase,
            generation: state.generation,
            asset: state.asset.clone(),
            last_stop: state.last_stop.clone(),
        }
    }

    /// Block until the controller is idle. Returns `false` on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.phase != PlaybackState::Idle {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return state.phase == PlaybackState::Idle;
            }
        }
        true
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(PlaybackEvent) + Send + Sync + 'static,
    {
        self.inner.observers.callbacks.lock().push(Arc::new(callback));
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = unbounded();
        self.inner.observers.channels.lock().push(tx);
        rx
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PlaybackController")
            .field("state", &state.phase)
            .field("generation", &state.generation)
            .field("asset", &state.asset)
            .finish()
    }
}

impl ControllerInner {
    fn start(self: &Arc<Self>, asset: &str, format: PcmFormat) -> Result<u64, PlaybackError> {
        // Refused up front so a busy controller never queues behind a teardown
        if self.state.lock().phase != PlaybackState::Idle {
            return Err(PlaybackError::AlreadyPlaying);
        }
        let Some(_transition) = self.transition_for(thread::current().id()) else {
            return Err(PlaybackError::AlreadyPlaying);
        };
        let generation = {
            let state = self.state.lock();
            if state.phase != PlaybackState::Idle {
                return Err(PlaybackError::AlreadyPlaying);
            }
            state.generation + 1
        };

        let (session, feeder) = PlaybackSession::open(
            generation,
            asset,
            format,
            &self.buffers,
            self.store.as_ref(),
            self.sinks.as_ref(),
            self.gate.clone(),
        )
        .map_err(|e| {
            tracing::error!(asset, "Failed to start playback: {}", e);
            e
        })?;

        self.gate.open(generation);
        {
            let mut state = self.state.lock();
            state.phase = PlaybackState::Starting;
            state.generation = generation;
            state.asset = Some(asset.to_string());
            state.active = Some(ActiveSession {
                session,
                feeder: None,
            });
            state.teardown_thread = None;
            state.refill_thread = None;
            self.observers.queue(PlaybackEvent::StateChanged {
                generation,
                state: PlaybackState::Starting,
            });
        }
        tracing::info!(generation, asset, ?format, "Starting playback");
        self.observers.flush();

        let weak: Weak<ControllerInner> = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(format!("pcm-refill-{}", generation))
            .spawn(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.register_refill(generation);
                }
                let playing = weak.clone();
                let exit = feeder.run(move || {
                    playing
                        .upgrade()
                        .map(|inner| inner.mark_playing(generation))
                        .unwrap_or(false)
                });
                if let Some(inner) = weak.upgrade() {
                    inner.finish_from_feeder(generation, exit);
                }
            });

        match spawned {
            Ok(handle) => {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                match state.active.as_mut() {
                    Some(active) if state.generation == generation => {
                        active.feeder = Some(handle);
                    }
                    // Already finished on its own
                    _ => drop(handle),
                }
                Ok(generation)
            }
            Err(e) => {
                let stats = self
                    .begin_teardown(generation)
                    .map(ActiveSession::finish_in_place)
                    .unwrap_or_default();
                self.complete_teardown(
                    generation,
                    StopReason::Failed {
                        error: e.to_string(),
                    },
                    stats,
                );
                Err(PlaybackError::ThreadSpawn(e.to_string()))
            }
        }
    }

    fn stop(&self) {
        let me = thread::current().id();
        loop {
            {
                let mut state = self.state.lock();
                match state.phase {
                    PlaybackState::Idle => return,
                    // Called from an event handler of the teardown itself,
                    // which carries on once the handler returns
                    PlaybackState::Stopping if state.is_teardown_thread(me) => return,
                    PlaybackState::Stopping => {
                        while state.phase == PlaybackState::Stopping {
                            self.idle.wait(&mut state);
                        }
                        return;
                    }
                    PlaybackState::Starting | PlaybackState::Playing => {}
                }
            }

            let Some(_transition) = self.transition_for(me) else {
                continue;
            };
            let taken = {
                let mut state = self.state.lock();
                if matches!(state.phase, PlaybackState::Starting | PlaybackState::Playing) {
                    state.phase = PlaybackState::Stopping;
                    state.teardown_thread = Some(me);
                    self.observers.queue(PlaybackEvent::StateChanged {
                        generation: state.generation,
                        state: PlaybackState::Stopping,
                    });
                    Some((state.generation, state.active.take()))
                } else {
                    None
                }
            };
            let Some((generation, active)) = taken else {
                continue;
            };

            tracing::debug!(generation, "Stop requested");
            self.observers.flush();
            let stats = active.map(ActiveSession::shutdown).unwrap_or_default();
            self.complete_teardown(generation, StopReason::Requested, stats);
            return;
        }
    }

    /// Take the transition lock. Whoever holds it may be joining the refill
    /// thread, so that thread only polls for it and gets `None` on timeout.
    fn transition_for(&self, me: ThreadId) -> Option<ReentrantMutexGuard<'_, ()>> {
        if self.state.lock().refill_thread == Some(me) {
            self.transition.try_lock_for(Duration::from_millis(1))
        } else {
            Some(self.transition.lock())
        }
    }

    fn register_refill(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.phase.is_active() {
            state.refill_thread = Some(thread::current().id());
        }
    }

    /// Starting -> Playing, once the device is active
    fn mark_playing(&self, generation: u64) -> bool {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase != PlaybackState::Starting {
                return false;
            }
            state.phase = PlaybackState::Playing;
            self.observers.queue(PlaybackEvent::StateChanged {
                generation,
                state: PlaybackState::Playing,
            });
        }
        tracing::debug!(generation, "Playback running");
        self.observers.flush();
        true
    }

    /// Natural end or failure detected on the refill thread
    fn finish_from_feeder(&self, generation: u64, exit: FeederExit) {
        let reason = match exit {
            FeederExit::Shutdown => return,
            FeederExit::EndOfStream => StopReason::EndOfStream,
            FeederExit::Failed(e) => {
                tracing::error!(generation, "Playback failed: {}", e);
                StopReason::Failed {
                    error: e.to_string(),
                }
            }
        };

        // None means stop() got there first and will join this thread
        if let Some(active) = self.begin_teardown(generation) {
            let stats = active.finish_in_place();
            self.complete_teardown(generation, reason, stats);
        }
    }

    /// Starting/Playing -> Stopping for `generation`, taking the session out
    /// of the shared state. `None` if that session is not running anymore.
    fn begin_teardown(&self, generation: u64) -> Option<ActiveSession> {
        let active = {
            let mut state = self.state.lock();
            let running =
                matches!(state.phase, PlaybackState::Starting | PlaybackState::Playing);
            if state.generation != generation || !running {
                return None;
            }
            state.phase = PlaybackState::Stopping;
            state.teardown_thread = Some(thread::current().id());
            self.observers.queue(PlaybackEvent::StateChanged {
                generation,
                state: PlaybackState::Stopping,
            });
            state.active.take()
        }?;
        self.observers.flush();
        Some(active)
    }

    fn complete_teardown(&self, generation: u64, reason: StopReason, stats: SessionStats) {
        match &reason {
            StopReason::Failed { error } => {
                tracing::warn!(generation, error = %error, "Playback stopped after failure")
            }
            _ => tracing::info!(
                generation,
                %reason,
                bytes = stats.bytes_queued,
                "Playback finished"
            ),
        }

        {
            let mut state = self.state.lock();
            state.phase = PlaybackState::Idle;
            state.asset = None;
            state.last_stop = Some(reason.clone());
            state.teardown_thread = None;
            state.refill_thread = None;
            self.observers.queue(PlaybackEvent::Finished {
                generation,
                reason,
                stats,
            });
            self.observers.queue(PlaybackEvent::StateChanged {
                generation,
                state: PlaybackState::Idle,
            });
        }
        self.idle.notify_all();
        self.observers.flush();
    }
}

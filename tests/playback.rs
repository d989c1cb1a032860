//! End-to-end playback scenarios against the simulated output device

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use pcm_stream_player::audio::SimulatedCapabilities;
use pcm_stream_player::config::BufferConfig;
use pcm_stream_player::{
    AssetStore, AudioError, MemoryAssetStore, OutputSink, PcmFormat, PlaybackController,
    PlaybackError, PlaybackEvent, PlaybackState, PlayerConfig, SessionStats,
    SimulatedOutputSink, StopReason,
};
use std::io::{self, Read};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn mono8() -> PcmFormat {
    PcmFormat::new(8000, 1, 8)
}

fn ramp(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn manual_player(
    data: Vec<u8>,
    buffers: BufferConfig,
) -> (PlaybackController, SimulatedOutputSink) {
    let store = MemoryAssetStore::new();
    store.insert("tone.pcm", data);
    let sink = SimulatedOutputSink::manual();
    let controller = PlaybackController::new(store, sink.factory(), buffers);
    (controller, sink)
}

fn wait_for_state(controller: &PlaybackController, state: PlaybackState) {
    let deadline = Instant::now() + TIMEOUT;
    while controller.state() != state {
        assert!(Instant::now() < deadline, "never reached {:?}", state);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Act as the device until the controller goes idle
fn drive_to_idle(controller: &PlaybackController, sink: &SimulatedOutputSink) {
    let deadline = Instant::now() + TIMEOUT;
    while controller.state() != PlaybackState::Idle {
        assert!(Instant::now() < deadline, "playback never finished");
        if !sink.complete_next() {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn finished(events: &Receiver<PlaybackEvent>) -> (StopReason, SessionStats) {
    loop {
        match events.recv_timeout(TIMEOUT).expect("no Finished event") {
            PlaybackEvent::Finished { reason, stats, .. } => return (reason, stats),
            PlaybackEvent::StateChanged { .. } => {}
        }
    }
}

#[test]
fn test_three_buffers_of_audio_through_two_buffers() {
    let capacity = 8;
    let data = ramp(3 * capacity);
    let (controller, sink) = manual_player(data.clone(), BufferConfig::with_bytes(2, capacity));
    let events = controller.subscribe();

    let generation = controller.start("tone.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);
    assert_eq!(sink.enqueued_count(), 2, "both buffers primed before playback");

    drive_to_idle(&controller, &sink);

    let (reason, stats) = finished(&events);
    assert_eq!(reason, StopReason::EndOfStream);
    assert_eq!(stats.generation, generation);
    assert_eq!(stats.primed, 2);
    assert_eq!(stats.refills, 1);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.bytes_queued, data.len() as u64);
    assert_eq!(stats.buffers_returned, 2, "no buffer leaked");

    assert_eq!(sink.played(), data);
    assert_eq!(sink.enqueued_count(), 3);
    assert!(!sink.is_active());
    assert_eq!(controller.status().last_stop, Some(StopReason::EndOfStream));
}

#[test]
fn test_concurrent_starts_admit_one_session() {
    let (controller, _sink) = manual_player(ramp(256), BufferConfig::with_bytes(2, 8));
    let controller = Arc::new(controller);
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                controller.start("tone.pcm", mono8())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let started = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(PlaybackError::AlreadyPlaying)))
        .count();

    assert_eq!(started, 1);
    assert_eq!(rejected, 7);
    assert_eq!(controller.status().generation, 1);
    controller.stop();
}

#[test]
fn test_stop_is_idempotent() {
    let (controller, sink) = manual_player(ramp(64), BufferConfig::with_bytes(2, 8));
    let events = controller.subscribe();

    controller.start("tone.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);

    controller.stop();
    controller.stop();

    let (reason, stats) = finished(&events);
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(stats.primed, 2);
    assert_eq!(controller.state(), PlaybackState::Idle);
    assert!(!sink.is_active());

    // Exactly one teardown happened
    thread::sleep(Duration::from_millis(20));
    let more_finishes = events
        .try_iter()
        .filter(|e| matches!(e, PlaybackEvent::Finished { .. }))
        .count();
    assert_eq!(more_finishes, 0);
}

#[test]
fn test_stop_before_any_start() {
    let (controller, sink) = manual_player(ramp(16), BufferConfig::with_bytes(2, 8));
    controller.stop();
    controller.stop();
    assert_eq!(controller.state(), PlaybackState::Idle);
    assert!(controller.status().last_stop.is_none());

    assert_eq!(controller.start("tone.pcm", mono8()).unwrap(), 1);
    wait_for_state(&controller, PlaybackState::Playing);
    drive_to_idle(&controller, &sink);
    assert_eq!(sink.played(), ramp(16));
}

#[test]
fn test_late_callback_after_stop_is_ignored() {
    let (controller, sink) = manual_player(ramp(64), BufferConfig::with_bytes(2, 8));
    let events = controller.subscribe();

    controller.start("tone.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);

    // The device picks up a buffer, then stop() races its completion
    let in_flight = sink.begin_draining().unwrap();
    let enqueued_before = sink.enqueued_count();

    controller.stop();
    sink.finish_draining(in_flight);

    let (_, stats) = finished(&events);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.refills, 0);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(sink.enqueued_count(), enqueued_before);
    assert_eq!(controller.state(), PlaybackState::Idle);
}

#[test]
fn test_stop_concurrent_with_callback() {
    let (controller, sink) = manual_player(ramp(4096), BufferConfig::with_bytes(4, 8));
    let controller = Arc::new(controller);

    for _ in 0..20 {
        controller.start("tone.pcm", mono8()).unwrap();
        wait_for_state(&controller, PlaybackState::Playing);

        let in_flight = sink.begin_draining().unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let stopper = {
            let controller = controller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                controller.stop();
            })
        };
        barrier.wait();
        sink.finish_draining(in_flight);
        stopper.join().unwrap();

        // Whatever won the race, nothing is enqueued after stop() returned
        let enqueued = sink.enqueued_count();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(sink.enqueued_count(), enqueued);
        assert!(!sink.is_active());
    }
}

/// Reader that blocks when it reaches `stall_at` until released
struct StallingReader {
    data: Vec<u8>,
    pos: usize,
    stall_at: usize,
    stalled: Option<Sender<()>>,
    release: Receiver<()>,
}

impl Read for StallingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.stall_at {
            if let Some(stalled) = self.stalled.take() {
                let _ = stalled.send(());
                let _ = self.release.recv();
            }
        }
        let limit = if self.pos < self.stall_at {
            self.stall_at
        } else {
            self.data.len()
        };
        let n = buf.len().min(limit - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct OneShotStore {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl AssetStore for OneShotStore {
    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>, AudioError> {
        self.reader
            .lock()
            .take()
            .ok_or_else(|| AudioError::AssetNotFound(name.to_string()))
    }
}

fn stalling_player(
    data: Vec<u8>,
    stall_at: usize,
    buffers: BufferConfig,
) -> (PlaybackController, SimulatedOutputSink, Receiver<()>, Sender<()>) {
    let (stalled_tx, stalled_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let reader: Box<dyn Read + Send> = Box::new(StallingReader {
        data,
        pos: 0,
        stall_at,
        stalled: Some(stalled_tx),
        release: release_rx,
    });
    let store = OneShotStore {
        reader: Mutex::new(Some(reader)),
    };
    let sink = SimulatedOutputSink::manual();
    let controller = PlaybackController::new(store, sink.factory(), buffers);
    (controller, sink, stalled_rx, release_tx)
}

#[test]
fn test_slow_refill_keeps_device_fed() {
    let capacity = 8;
    let data = ramp(8 * capacity);
    // Stall on the first read after priming three buffers
    let (controller, sink, stalled, release) =
        stalling_player(data.clone(), 3 * capacity, BufferConfig::with_bytes(3, capacity));

    controller.start("tone.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);

    assert!(sink.complete_next());
    stalled.recv_timeout(TIMEOUT).unwrap();

    // Refill thread is blocked in I/O, the device still has audio queued
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert_eq!(sink.queued_len(), 2);
    assert!(sink.complete_next());
    assert!(sink.queued_len() >= 1);
    assert_eq!(sink.underruns(), 0);

    release.send(()).unwrap();
    drive_to_idle(&controller, &sink);
    assert_eq!(sink.played(), data);
    assert_eq!(controller.status().last_stop, Some(StopReason::EndOfStream));
}

#[test]
fn test_slow_priming_read_delays_activation() {
    let capacity = 8;
    let data = ramp(6 * capacity);
    // Stall on the last priming read
    let (controller, sink, stalled, release) =
        stalling_player(data.clone(), 2 * capacity, BufferConfig::with_bytes(3, capacity));

    controller.start("tone.pcm", mono8()).unwrap();
    stalled.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(controller.state(), PlaybackState::Starting);
    assert_eq!(sink.queued_len(), 2);
    assert!(!sink.is_active(), "device must not start before priming ends");

    release.send(()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);
    assert_eq!(sink.enqueued_count(), 3);

    drive_to_idle(&controller, &sink);
    assert_eq!(sink.played(), data);
}

/// Yields `good` bytes, then fails every read
struct FailingReader {
    good: usize,
    pos: usize,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.good {
            return Err(io::Error::new(io::ErrorKind::Other, "medium error"));
        }
        let n = buf.len().min(self.good - self.pos);
        buf[..n].fill(0x55);
        self.pos += n;
        Ok(n)
    }
}

#[test]
fn test_read_error_mid_stream_stops_session() {
    let reader: Box<dyn Read + Send> = Box::new(FailingReader { good: 16, pos: 0 });
    let store = OneShotStore {
        reader: Mutex::new(Some(reader)),
    };
    let sink = SimulatedOutputSink::manual();
    let controller = PlaybackController::new(store, sink.factory(), BufferConfig::with_bytes(2, 8));
    let events = controller.subscribe();

    controller.start("broken.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);

    // Freeing a buffer makes the refill thread hit the failing read
    assert!(sink.complete_next());
    assert!(controller.wait_for_idle(TIMEOUT));

    let (reason, stats) = finished(&events);
    match reason {
        StopReason::Failed { error } => assert!(error.contains("medium error"), "{error}"),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(stats.primed, 2);
    assert_eq!(stats.refills, 0);

    // Nothing plays past the failure
    assert!(!sink.is_active());
    assert!(!sink.complete_next());
    assert_eq!(sink.played(), vec![0x55; 8]);
}

#[test]
fn test_unsupported_format_fails_before_queueing() {
    let store = MemoryAssetStore::new();
    store.insert("tone.pcm", ramp(64));
    let sink = SimulatedOutputSink::manual().with_capabilities(SimulatedCapabilities {
        channels: vec![2],
        bits_per_sample: vec![16],
        min_sample_rate: 44100,
        max_sample_rate: 48000,
    });
    let controller = PlaybackController::new(store, sink.factory(), BufferConfig::default());

    let err = controller
        .start("tone.pcm", PcmFormat::new(44100, 1, 16))
        .unwrap_err();
    assert!(matches!(
        err,
        PlaybackError::Audio(AudioError::UnsupportedFormat(_))
    ));

    // Formats no device could play are rejected too
    let err = controller
        .start("tone.pcm", PcmFormat::new(44100, 2, 12))
        .unwrap_err();
    assert!(matches!(
        err,
        PlaybackError::Audio(AudioError::UnsupportedFormat(_))
    ));

    assert_eq!(sink.enqueued_count(), 0);
    assert_eq!(controller.state(), PlaybackState::Idle);
    assert!(controller.start("tone.pcm", PcmFormat::new(44100, 2, 16)).is_ok());
    controller.stop();
}

#[test]
fn test_missing_asset() {
    let (controller, sink) = manual_player(ramp(16), BufferConfig::with_bytes(2, 8));
    let err = controller.start("other.pcm", mono8()).unwrap_err();
    assert!(matches!(err, PlaybackError::Audio(AudioError::AssetNotFound(_))));
    assert_eq!(controller.state(), PlaybackState::Idle);
    assert_eq!(sink.enqueued_count(), 0);
}

#[test]
fn test_clocked_device_plays_in_fifo_order() {
    let data = ramp(1000);
    let store = MemoryAssetStore::new();
    store.insert("tone.pcm", data.clone());
    let sink = SimulatedOutputSink::clocked(Duration::from_millis(1));
    let controller = PlaybackController::new(store, sink.factory(), BufferConfig::with_bytes(4, 16));
    let events = controller.subscribe();

    controller.start("tone.pcm", mono8()).unwrap();
    assert!(controller.wait_for_idle(Duration::from_secs(10)));

    let (reason, stats) = finished(&events);
    assert_eq!(reason, StopReason::EndOfStream);
    assert_eq!(stats.buffers_returned, 4);
    assert_eq!(stats.bytes_queued, 1000);
    assert_eq!(sink.played(), data);
}

#[test]
fn test_restart_uses_new_generation() {
    let (controller, sink) = manual_player(ramp(64), BufferConfig::with_bytes(2, 8));

    assert_eq!(controller.start("tone.pcm", mono8()).unwrap(), 1);
    wait_for_state(&controller, PlaybackState::Playing);
    controller.stop();

    assert_eq!(controller.start("tone.pcm", mono8()).unwrap(), 2);
    wait_for_state(&controller, PlaybackState::Playing);
    let status = controller.status();
    assert_eq!(status.generation, 2);
    assert_eq!(status.state, PlaybackState::Playing);
    assert!(sink.is_active());
    controller.stop();
}

#[test]
fn test_device_fault_tears_down() {
    let (controller, sink) = manual_player(ramp(64), BufferConfig::with_bytes(2, 8));
    controller.start("tone.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);

    sink.inject_fault("unplugged");
    assert!(controller.wait_for_idle(TIMEOUT));

    match controller.status().last_stop {
        Some(StopReason::Failed { error }) => assert!(error.contains("unplugged")),
        other => panic!("expected device failure, got {:?}", other),
    }
    assert!(!sink.is_active());
}

#[test]
fn test_activation_failure_reported() {
    let (controller, sink) = manual_player(ramp(64), BufferConfig::with_bytes(2, 8));
    sink.fail_activation(true);

    controller.start("tone.pcm", mono8()).unwrap();
    assert!(controller.wait_for_idle(TIMEOUT));
    assert!(controller
        .status()
        .last_stop
        .map(|r| r.is_failure())
        .unwrap_or(false));
    assert!(!sink.is_active());
}

#[test]
fn test_empty_asset_finishes_immediately() {
    let (controller, sink) = manual_player(Vec::new(), BufferConfig::with_bytes(2, 8));
    let events = controller.subscribe();

    controller.start("tone.pcm", mono8()).unwrap();
    assert!(controller.wait_for_idle(TIMEOUT));

    let (reason, stats) = finished(&events);
    assert_eq!(reason, StopReason::EndOfStream);
    assert_eq!(stats.primed, 0);
    assert_eq!(stats.buffers_returned, 2);
    assert_eq!(sink.enqueued_count(), 0);
}

#[test]
fn test_event_callback_sees_lifecycle() {
    let (controller, sink) = manual_player(ramp(16), BufferConfig::with_bytes(2, 8));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    controller.on_event(move |event| {
        if let PlaybackEvent::StateChanged { state, .. } = event {
            log.lock().push(state);
        }
    });

    controller.start("tone.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);
    drive_to_idle(&controller, &sink);

    let deadline = Instant::now() + TIMEOUT;
    while seen.lock().last() != Some(&PlaybackState::Idle) {
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        *seen.lock(),
        vec![
            PlaybackState::Starting,
            PlaybackState::Playing,
            PlaybackState::Stopping,
            PlaybackState::Idle,
        ]
    );
}

#[test]
fn test_plays_from_asset_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("clip.pcm"), ramp(40)).unwrap();

    let mut config = PlayerConfig::default();
    config.assets.root = dir.path().to_path_buf();
    config.buffers = BufferConfig::with_bytes(2, 8);

    let sink = SimulatedOutputSink::manual();
    let controller = PlaybackController::from_config(&config, sink.factory());

    let err = controller.start("../clip.pcm", mono8()).unwrap_err();
    assert!(matches!(err, PlaybackError::Audio(AudioError::InvalidAssetName(_))));

    controller.start("clip.pcm", mono8()).unwrap();
    wait_for_state(&controller, PlaybackState::Playing);
    drive_to_idle(&controller, &sink);
    assert_eq!(sink.played(), ramp(40));
    assert_eq!(sink.name(), "simulated(manual)");
}

//! Hardware output through cpal
//!
//! cpal pulls samples from a callback instead of accepting whole buffers, so
//! the sink keeps a lock-free FIFO of queued [`PcmBuffer`]s and the stream
//! callback walks through them, handing each one back once its last sample
//! has been written to the device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::PcmBuffer;
use crate::audio::format::PcmFormat;
use crate::audio::sink::{EnqueueError, OutputSink, SinkCallbacks, SinkFactory};
use crate::error::AudioError;

/// How long `activate` waits for the output thread to open the stream
const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Output device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available output devices
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.output_devices() else {
        return Vec::new();
    };

    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let (sample_rates, channels) = get_device_capabilities(&device);
            Some(OutputDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                sample_rates,
                channels,
            })
        })
        .collect()
}

fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in [8000u32, 16000, 22050, 44100, 48000, 88200, 96000, 192000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Find an output device by name, or the default one
fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string())),
    }
}

/// Sample format the device should run in for a given PCM bit depth
fn preferred_sample_format(bits_per_sample: u8) -> SampleFormat {
    match bits_per_sample {
        8 => SampleFormat::U8,
        16 => SampleFormat::I16,
        24 | 32 => SampleFormat::I32,
        _ => SampleFormat::F32,
    }
}

/// Pick a stream config that plays `format` without resampling or remixing
fn select_stream_config(
    device: &cpal::Device,
    format: &PcmFormat,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let rate = cpal::SampleRate(format.sample_rate_hz);
    let candidates: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::DeviceError(e.to_string()))?
        .filter(|c| {
            c.channels() == format.channel_count as u16
                && c.min_sample_rate() <= rate
                && rate <= c.max_sample_rate()
        })
        .collect();

    let preferred = preferred_sample_format(format.bits_per_sample);
    let chosen = candidates
        .iter()
        .find(|c| c.sample_format() == preferred)
        .or_else(|| candidates.iter().find(|c| c.sample_format() == SampleFormat::F32))
        .or_else(|| candidates.first())
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!(
                "{}Hz/{}ch not offered by device",
                format.sample_rate_hz, format.channel_count
            ))
        })?;

    let sample_format = chosen.sample_format();
    Ok((chosen.clone().with_sample_rate(rate).config(), sample_format))
}

/// State shared with the stream callback
struct StreamShared {
    queue: Arc<ArrayQueue<PcmBuffer>>,
    active: Arc<AtomicBool>,
    in_device: Arc<AtomicUsize>,
    underruns: Arc<AtomicU64>,
    /// Set once the feeder has queued its last buffer
    end_of_stream: Arc<AtomicBool>,
}

/// Walks queued buffers sample by sample inside the cpal callback
struct BufferCursor {
    shared: StreamShared,
    callbacks: SinkCallbacks,
    format: PcmFormat,
    current: Option<PcmBuffer>,
    offset: usize,
}

impl BufferCursor {
    fn next_sample(&mut self) -> Option<f32> {
        let step = self.format.bytes_per_sample();
        loop {
            if self.current.is_none() {
                let buffer = self.shared.queue.pop()?;
                let _ = buffer.mark_draining();
                self.shared.in_device.store(1, Ordering::Release);
                self.current = Some(buffer);
                self.offset = 0;
            }

            let buffer = self.current.as_ref()?;
            let bytes = buffer.bytes();
            if self.offset + step <= bytes.len() {
                let sample = self.format.sample_to_f32(&bytes[self.offset..self.offset + step]);
                self.offset += step;
                if self.offset + step > bytes.len() {
                    self.finish_current();
                }
                return Some(sample);
            }
            // Empty or short buffer: nothing to play from it
            self.finish_current();
        }
    }

    fn finish_current(&mut self) {
        if let Some(done) = self.current.take() {
            self.shared.in_device.store(0, Ordering::Release);
            (self.callbacks.on_complete)(done);
        }
    }

    fn fill<T>(&mut self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let silence = T::from_sample(0.0f32);
        if !self.shared.active.load(Ordering::Acquire) {
            data.fill(silence);
            return;
        }

        let mut starved = false;
        for out in data.iter_mut() {
            match self.next_sample() {
                Some(sample) => *out = T::from_sample(sample),
                None => {
                    starved = true;
                    *out = silence;
                }
            }
        }
        if starved && !self.shared.end_of_stream.load(Ordering::Acquire) {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut cursor: BufferCursor,
    on_fault: crate::audio::sink::FaultCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| cursor.fill(data),
            move |err| {
                tracing::error!("Output stream error: {}", err);
                on_fault(AudioError::DeviceError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::DeviceError(e.to_string()))
}

struct OutputThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Queued output on a real audio device
pub struct DeviceOutputSink {
    name: String,
    device_name: Option<String>,
    device: Mutex<Option<cpal::Device>>,
    stream_config: Option<(StreamConfig, SampleFormat)>,
    format: PcmFormat,
    queue: Arc<ArrayQueue<PcmBuffer>>,
    callbacks: Option<SinkCallbacks>,
    active: Arc<AtomicBool>,
    in_device: Arc<AtomicUsize>,
    underruns: Arc<AtomicU64>,
    end_of_stream: Arc<AtomicBool>,
    thread: Mutex<Option<OutputThread>>,
}

impl DeviceOutputSink {
    /// Sink for the named output device, or the default device for `None`
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            name: device_name
                .clone()
                .unwrap_or_else(|| "default output".to_string()),
            device_name,
            device: Mutex::new(None),
            stream_config: None,
            format: PcmFormat::default(),
            queue: Arc::new(ArrayQueue::new(1)),
            callbacks: None,
            active: Arc::new(AtomicBool::new(false)),
            in_device: Arc::new(AtomicUsize::new(0)),
            underruns: Arc::new(AtomicU64::new(0)),
            end_of_stream: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }
}

impl OutputSink for DeviceOutputSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &PcmFormat, queue_depth: usize) -> Result<(), AudioError> {
        format.validate()?;
        let device = find_output_device(self.device_name.as_deref())?;
        let (config, sample_format) = select_stream_config(&device, format)?;

        tracing::info!(
            device = %self.name,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "Configured output device"
        );

        self.queue = Arc::new(ArrayQueue::new(queue_depth.max(1)));
        self.end_of_stream.store(false, Ordering::Release);
        self.format = *format;
        *self.device.lock() = Some(device);
        self.stream_config = Some((config, sample_format));
        Ok(())
    }

    fn register_callbacks(&mut self, callbacks: SinkCallbacks) {
        self.callbacks = Some(callbacks);
    }

    fn enqueue(&self, buffer: PcmBuffer) -> Result<(), EnqueueError> {
        self.queue
            .push(buffer)
            .map_err(|buffer| EnqueueError::new(buffer, AudioError::QueueFull))
    }

    fn activate(&self) -> Result<(), AudioError> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Ok(());
        }

        let configured = (self.device.lock().clone(), self.stream_config.clone());
        let (device, (config, sample_format)) = match configured {
            (Some(device), Some(config)) => (device, config),
            _ => return Err(AudioError::DeviceError("sink not configured".to_string())),
        };
        let callbacks = self
            .callbacks
            .clone()
            .ok_or_else(|| AudioError::DeviceError("no callbacks registered".to_string()))?;

        let cursor = BufferCursor {
            shared: StreamShared {
                queue: self.queue.clone(),
                active: self.active.clone(),
                in_device: self.in_device.clone(),
                underruns: self.underruns.clone(),
                end_of_stream: self.end_of_stream.clone(),
            },
            callbacks: callbacks.clone(),
            format: self.format,
            current: None,
            offset: 0,
        };
        let on_fault = callbacks.on_fault;

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let active = self.active.clone();
        active.store(true, Ordering::SeqCst);

        // cpal streams are not Send, so the stream lives on its own thread
        let handle = thread::Builder::new()
            .name("pcm-output".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::F32 => build_stream::<f32>(&device, &config, cursor, on_fault),
                    SampleFormat::I16 => build_stream::<i16>(&device, &config, cursor, on_fault),
                    SampleFormat::I32 => build_stream::<i32>(&device, &config, cursor, on_fault),
                    SampleFormat::U16 => build_stream::<u16>(&device, &config, cursor, on_fault),
                    SampleFormat::U8 => build_stream::<u8>(&device, &config, cursor, on_fault),
                    other => Err(AudioError::UnsupportedFormat(format!(
                        "device sample format {other:?}"
                    ))),
                };

                let stream = match stream.and_then(|s| {
                    s.play()
                        .map_err(|e| AudioError::DeviceError(e.to_string()))
                        .map(|_| s)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep the stream alive until told to stop
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| {
                self.active.store(false, Ordering::SeqCst);
                AudioError::DeviceError(e.to_string())
            })?;

        match ready_rx.recv_timeout(STREAM_OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!(device = %self.name, "Output stream started");
                *thread_slot = Some(OutputThread { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                active.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                active.store(false, Ordering::SeqCst);
                let _ = stop_tx.send(());
                Err(AudioError::DeviceError(
                    "timed out opening output stream".to_string(),
                ))
            }
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.stop_tx.send(());
            let _ = thread.handle.join();
            tracing::debug!(device = %self.name, "Output stream closed");
        }
    }

    fn mark_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
    }

    fn queued_len(&self) -> usize {
        self.queue.len() + self.in_device.load(Ordering::Acquire)
    }

    fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl Drop for DeviceOutputSink {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Creates a [`DeviceOutputSink`] per session
#[derive(Debug, Clone, Default)]
pub struct DeviceSinkFactory {
    pub device: Option<String>,
}

impl DeviceSinkFactory {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

impl SinkFactory for DeviceSinkFactory {
    fn create(&self) -> Result<Box<dyn OutputSink>, AudioError> {
        Ok(Box::new(DeviceOutputSink::new(self.device.clone())))
    }
}

//! PCM Player Application
//!
//! Streams one raw PCM asset from the asset directory to an audio output
//! and exits when it has played to the end or on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_stream_player::{
    audio::{ByteOrder, DirAssetStore, SimulatedOutputSink, SinkFactory},
    config::PlayerConfig,
    PlaybackController, PlaybackEvent, StopReason,
};

/// Stream a raw PCM asset to an audio output
#[derive(Parser, Debug)]
#[command(name = "player", version)]
struct Args {
    /// Asset name, relative to the asset directory
    #[arg(required_unless_present = "list_devices")]
    asset: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, value_name = "FILE", env = "PCM_PLAYER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the assets
    #[arg(long, value_name = "DIR")]
    asset_dir: Option<PathBuf>,

    /// Output device name
    #[arg(long)]
    device: Option<String>,

    /// Sample rate in Hz
    #[arg(long)]
    rate: Option<u32>,

    /// Channel count (1 or 2)
    #[arg(long)]
    channels: Option<u8>,

    /// Bits per sample (8, 16, 24 or 32)
    #[arg(long)]
    bits: Option<u8>,

    /// Samples are big-endian
    #[arg(long)]
    big_endian: bool,

    /// Number of buffers cycling between reader and device
    #[arg(long)]
    buffers: Option<usize>,

    /// Audio per buffer in milliseconds
    #[arg(long, value_name = "MS")]
    buffer_ms: Option<u32>,

    /// Play through a simulated device clocked in real time
    #[arg(long)]
    simulate: bool,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the final playback report as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    fn apply_to(&self, config: &mut PlayerConfig) {
        if let Some(dir) = &self.asset_dir {
            config.assets.root = dir.clone();
        }
        if let Some(device) = &self.device {
            config.output.device = Some(device.clone());
        }
        if let Some(rate) = self.rate {
            config.format.sample_rate_hz = rate;
        }
        if let Some(channels) = self.channels {
            config.format.channel_count = channels;
        }
        if let Some(bits) = self.bits {
            config.format.bits_per_sample = bits;
        }
        if self.big_endian {
            config.format.byte_order = ByteOrder::Big;
        }
        if let Some(count) = self.buffers {
            config.buffers.count = count;
        }
        if let Some(ms) = self.buffer_ms {
            config.buffers.duration_ms = ms;
            config.buffers.bytes = None;
        }
    }
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
    let path = args.config.clone().or_else(PlayerConfig::default_path);
    let mut config = match path {
        Some(path) => PlayerConfig::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PlayerConfig::default(),
    };
    args.apply_to(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn simulated_sinks(config: &PlayerConfig) -> Arc<dyn SinkFactory> {
    let capacity = config.buffers.capacity_for(&config.format);
    let period = config.format.duration_of(capacity);
    tracing::info!("Using simulated output, one buffer every {:?}", period);
    Arc::new(SimulatedOutputSink::clocked(period).factory())
}

#[cfg(feature = "device")]
fn output_sinks(args: &Args, config: &PlayerConfig) -> Arc<dyn SinkFactory> {
    if args.simulate {
        return simulated_sinks(config);
    }
    Arc::new(pcm_stream_player::audio::DeviceSinkFactory::new(
        config.output.device.clone(),
    ))
}

#[cfg(not(feature = "device"))]
fn output_sinks(args: &Args, config: &PlayerConfig) -> Arc<dyn SinkFactory> {
    if !args.simulate {
        tracing::warn!("Built without the `device` feature, falling back to simulated output");
    }
    simulated_sinks(config)
}

#[cfg(feature = "device")]
fn print_devices() {
    println!("\n=== Available Output Devices ===");
    for device in pcm_stream_player::audio::list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[cfg(not(feature = "device"))]
fn print_devices() {
    println!("Built without the `device` feature: no output devices available");
}

/// Block until the session `generation` reports its end
fn wait_finished(events: Receiver<PlaybackEvent>, generation: u64) -> Option<PlaybackEvent> {
    events.iter().find(|event| {
        matches!(event, PlaybackEvent::Finished { .. }) && event.generation() == generation
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let config = load_config(&args)?;
    let asset = args.asset.clone().context("no asset given")?;

    let controller = PlaybackController::with_shared(
        Arc::new(DirAssetStore::new(&config.assets.root)),
        output_sinks(&args, &config),
        config.buffers.clone(),
    );
    let events = controller.subscribe();

    let generation = controller
        .start(&asset, config.format)
        .with_context(|| format!("cannot play {}", asset))?;

    let finished = tokio::task::spawn_blocking(move || wait_finished(events, generation));
    tokio::pin!(finished);

    let report = tokio::select! {
        report = &mut finished => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping playback");
            controller.stop();
            finished.await?
        }
    };

    let Some(report) = report else {
        anyhow::bail!("playback ended without a report");
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    match report {
        PlaybackEvent::Finished {
            reason: StopReason::Failed { error },
            ..
        } => anyhow::bail!("playback of {} failed: {}", asset, error),
        PlaybackEvent::Finished { reason, stats, .. } => {
            tracing::info!(
                "{}: {} ({} bytes, {} underruns)",
                asset,
                reason,
                stats.bytes_queued,
                stats.underruns
            );
            Ok(())
        }
        PlaybackEvent::StateChanged { .. } => Ok(()),
    }
}

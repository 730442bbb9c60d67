//! uvc-capture
//!
//! Negotiates a stream with a USB video-class camera and saves the JPEG
//! frames it sends over its isochronous endpoint.

use anyhow::{Context, Result, anyhow};
use capture::config::CaptureConfig;
use capture::sink::FrameSink;
use capture::usb::manager;
use capture::usb::{RusbHost, ScriptedHost, spawn_capture_worker};
use clap::Parser;
use common::{CaptureBridge, CaptureCommand, CaptureEvent, create_capture_bridge, setup_logging};
use rusb::Context as LibusbContext;
use std::path::PathBuf;
use tokio::signal;
use tokio::time::{Instant, Interval};
use tracing::{error, info, warn};

/// Frame size produced by the simulated camera
const SIMULATED_FRAME_LEN: usize = 6 * 1024;

#[derive(Parser, Debug)]
#[command(name = "uvc-capture")]
#[command(
    author,
    version,
    about = "UVC Capture - Grab JPEG frames from a USB video-class camera"
)]
#[command(long_about = "
Negotiates PROBE/COMMIT with a USB video-class camera, switches its streaming
interface to the isochronous alternate setting and reassembles JPEG frames
from the payload stream.

EXAMPLES:
    # Run with default config (Logitech C270, 640x480 at 5 fps)
    uvc-capture

    # Save five frames to ./frames
    uvc-capture --output ./frames --frames 5

    # Run against the built-in simulated camera
    uvc-capture --simulate --frames 3

    # List USB devices and exit
    uvc-capture --list-devices

    # Run with debug logging
    uvc-capture --log-level debug

CONFIGURATION:
    Configuration files are looked up in the following order:
    1. Path specified with --config
    2. ~/.config/uvc-capture/capture.toml
    3. /etc/uvc-capture/capture.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Use the simulated camera instead of libusb
    #[arg(long)]
    simulate: bool,

    /// Directory to write frames to (overrides config)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Stop after this many frames, 0 = run until Ctrl+C (overrides config)
    #[arg(short, long, value_name = "N")]
    frames: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CaptureConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CaptureConfig::load_or_default()
    };

    // CLI overrides
    if let Some(output) = &args.output {
        config.capture.output_dir = Some(output.to_string_lossy().into_owned());
    }
    if let Some(frames) = args.frames {
        config.stream.capture_limit = frames;
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.capture.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("uvc-capture v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode();
    }

    let session_config = config
        .session_config()
        .context("Invalid device configuration")?;
    let sink = match config.output_dir() {
        Some(dir) => Some(FrameSink::create(dir).await?),
        None => None,
    };

    // Capture worker thread owns the host stack (libusb is polled on it)
    let (bridge, worker) = create_capture_bridge();
    let tick_interval = config.tick_interval();
    let worker_handle = if args.simulate {
        info!("Using simulated camera");
        let (vendor_id, product_id) = (session_config.vendor_id, session_config.product_id);
        spawn_capture_worker(worker, session_config, tick_interval, move || {
            Ok(ScriptedHost::simulated_camera(
                vendor_id,
                product_id,
                SIMULATED_FRAME_LEN,
            ))
        })
    } else {
        spawn_capture_worker(worker, session_config, tick_interval, RusbHost::new)
    }
    .context("Failed to spawn capture worker thread")?;

    let result = run_capture(&config, bridge.clone(), sink).await;

    // Cleanup: Shutdown capture worker thread
    info!("Shutting down capture worker...");
    if let Err(e) = bridge.send_command(CaptureCommand::Shutdown).await {
        warn!("Could not send Shutdown command: {}", e);
    }
    drop(bridge);

    match worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Capture worker failed: {}", e),
        Err(e) => error!("Capture worker thread panicked: {:?}", e),
    }

    result
}

/// List USB devices and exit
fn list_devices_mode() -> Result<()> {
    let context = LibusbContext::new().context("Failed to initialise libusb")?;
    let devices = manager::list_devices(&context).context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }

    Ok(())
}

/// Forward worker events until the frame limit, Ctrl+C, or the worker exits
async fn run_capture(
    config: &CaptureConfig,
    bridge: CaptureBridge,
    mut sink: Option<FrameSink>,
) -> Result<()> {
    let limit = config.stream.capture_limit;
    let mut frames = 0u64;
    let mut status_timer = config
        .status_interval()
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    if let Some(sink) = &sink {
        info!("Writing frames to {}", sink.dir().display());
    }
    if limit > 0 {
        info!("Capturing {} frame(s), press Ctrl+C to stop early", limit);
    } else {
        info!("Capturing until Ctrl+C");
    }

    loop {
        tokio::select! {
            event = bridge.recv_event() => {
                let event = event.map_err(|e| anyhow!("Capture worker stopped: {}", e))?;
                match event {
                    CaptureEvent::DeviceAttached { address, vendor_id, product_id } => {
                        info!("Camera {:04x}:{:04x} attached at address {}", vendor_id, product_id, address);
                    }
                    CaptureEvent::DeviceDetached { address } => {
                        info!("Camera at address {} detached, waiting for it to return", address);
                    }
                    CaptureEvent::StreamingStarted { address } => {
                        info!("Camera at address {} is streaming", address);
                    }
                    CaptureEvent::NegotiationFailed { address, reason, fatal } => {
                        if fatal {
                            error!("Negotiation with {} abandoned: {} (replug the camera to retry)", address, reason);
                        } else {
                            warn!("Negotiation with {} restarted: {}", address, reason);
                        }
                    }
                    CaptureEvent::FrameCompleted { frame } => {
                        frames += 1;
                        info!("Frame {}: {} bytes", frame.sequence, frame.size);
                        if let Some(sink) = sink.as_mut() {
                            sink.write(&frame).await?;
                        }
                        if limit > 0 && frames >= limit {
                            info!("Captured {} frame(s)", frames);
                            return Ok(());
                        }
                    }
                }
            }
            _ = next_status_tick(&mut status_timer) => {
                match bridge.status().await {
                    Ok(status) => info!(
                        "Status: {} ({}), {} frame(s), {} byte(s), {} restart(s)",
                        status.state,
                        status.link,
                        status.stats.frames_completed,
                        status.stats.total_bytes,
                        status.restarts
                    ),
                    Err(e) => warn!("Status request failed: {}", e),
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
        }
    }
}

/// Resolves on the next status tick, never when status logging is off
async fn next_status_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

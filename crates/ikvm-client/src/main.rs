//! iKVM client: headless entry point.
//!
//! Connects to an iKVM server, opens its serial HID device, starts
//! mjpg-streamer and reads video frames until interrupted.
//!
//! # Usage
//!
//! ```text
//! ikvm-client [OPTIONS] [HOST] [PORT]
//!
//! Options:
//!   --config <PATH>             Config file [default: platform config dir]
//!   --mjpg-port <PORT>          Port mjpg-streamer listens on [default: 8080]
//!   --capture-device <NAME>     Substring of the capture device name
//!   --capture-scale <W:H>       Preferred aspect ratio, e.g. 16:9
//!   --capture-quality <Q>       best | worst [default: best]
//!   --serial-port <PATH>        Serial device to open on the server
//!   --serial-usbid <VID:PID>    USB id of the serial adapter to look for
//!   --frames <N>                Stop after N frames
//!   --log-level <FILTER>        Log filter when RUST_LOG is unset
//!   --save                      Remember the chosen devices in the config
//! ```
//!
//! Precedence: command line (or its `IKVM_*` environment variable), then the
//! config file, then built-in defaults.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ikvm_client::application::session::{RetryPolicy, SessionSupervisor};
use ikvm_client::infrastructure::mjpeg::MjpgClient;
use ikvm_client::infrastructure::network::KvmClient;
use ikvm_client::infrastructure::storage::config::{
    config_file_path, load_config, save_config, ClientConfig,
};
use ikvm_core::{AspectRatio, Quality, UsbId};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Headless iKVM client.
#[derive(Debug, Parser)]
#[command(name = "ikvm-client", about = "Remote KVM client for iKVM servers", version)]
struct Cli {
    /// Server host name or IP address.
    #[arg(env = "IKVM_HOST")]
    host: Option<String>,

    /// Server control port.
    #[arg(env = "IKVM_PORT")]
    port: Option<u16>,

    /// Path of the TOML config file.
    #[arg(long, env = "IKVM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "IKVM_MJPG_PORT")]
    mjpg_port: Option<u16>,

    #[arg(long, env = "IKVM_CAPTURE_DEVICE")]
    capture_device: Option<String>,

    #[arg(long, env = "IKVM_CAPTURE_SCALE")]
    capture_scale: Option<AspectRatio>,

    #[arg(long, env = "IKVM_CAPTURE_QUALITY")]
    capture_quality: Option<Quality>,

    #[arg(long, env = "IKVM_SERIAL_PORT")]
    serial_port: Option<String>,

    #[arg(long, env = "IKVM_SERIAL_USBID")]
    serial_usbid: Option<UsbId>,

    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,

    /// `tracing` filter used when `RUST_LOG` is unset.
    #[arg(long, env = "IKVM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write the devices the session settled on back to the config file.
    #[arg(long)]
    save: bool,
}

impl Cli {
    /// Layers the command-line values over `config`.
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(host) = &self.host {
            config.server.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(port) = self.mjpg_port {
            config.mjpg_streamer.port = port;
        }
        if let Some(device) = &self.capture_device {
            config.mjpg_streamer.capture_device = Some(device.clone());
        }
        if let Some(scale) = self.capture_scale {
            config.mjpg_streamer.capture_scale = Some(scale);
        }
        if let Some(quality) = self.capture_quality {
            config.mjpg_streamer.capture_quality = quality;
        }
        if let Some(port) = &self.serial_port {
            config.serial_device.port = Some(port.clone());
        }
        if let Some(usbid) = self.serial_usbid {
            config.serial_device.usbid = Some(usbid);
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }

    fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| config_file_path().ok())
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config_path();
    let mut config = match &path {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    cli.apply(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .init();

    let host = config
        .server
        .host
        .clone()
        .context("no server host given on the command line or in the config file")?;

    let kvm = KvmClient::new(config.to_kvm_config(&host));
    let mut supervisor = SessionSupervisor::new(kvm, MjpgClient::new(), RetryPolicy::default());

    supervisor.establish().await.context("starting KVM session")?;
    let result = run(&mut supervisor, cli.frames).await;

    if cli.save {
        if let Some(path) = &path {
            config.remember(supervisor.kvm().config());
            match save_config(path, &config) {
                Ok(()) => info!(path = %path.display(), "config saved"),
                Err(e) => warn!("cannot save config: {e}"),
            }
        }
    }

    if let Err(e) = supervisor.shutdown().await {
        error!("session did not end cleanly: {e}");
    }
    info!("iKVM client stopped");
    result
}

/// Logs the server's devices, then pulls frames until Ctrl-C or `limit`.
async fn run(
    supervisor: &mut SessionSupervisor<KvmClient, MjpgClient>,
    limit: Option<u64>,
) -> anyhow::Result<()> {
    for device in supervisor.kvm().list_serial_devices().await? {
        info!(name = %device.name, usb_id = %device.usb_id, "serial device");
    }
    for capture in supervisor.kvm().list_captures().await? {
        let modes: Vec<String> = capture.resolutions().map(|r| r.to_string()).collect();
        info!(name = %capture.name, modes = %modes.join(" "), "video capture");
    }

    supervisor.connect_video().await.context("opening video stream")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut frames = 0u64;
    while limit.map_or(true, |n| frames < n) {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received Ctrl+C, shutting down");
                break;
            }
            frame = supervisor.next_frame() => {
                let frame = frame.context("reading video stream")?;
                frames += 1;
                info!(frame = frames, bytes = frame.len(), "frame");
            }
        }
    }
    info!(frames, "video stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

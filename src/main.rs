//! jamlink CLI - run one relay endpoint from the command line.
//!
//! Exit codes: 0 on clean shutdown, 1 for argument errors or an unavailable
//! backend, 2 for runtime initialisation failures.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use jamlink::backend::{self, BackendKind};
use jamlink::config::{
    AudioConfig, EngineConfig, DEFAULT_DEVICE_BUFFER, DEFAULT_LISTEN_PORT,
    DEFAULT_PACKET_BUFFER, DEFAULT_PEER_PORT, DEFAULT_RING_DEPTH, DEFAULT_SAMPLE_RATE,
};
use jamlink::engine::Engine;

#[derive(Debug, Parser)]
#[command(
    name = "jamlink",
    about = "Low-latency bidirectional UDP audio relay",
    version
)]
struct Args {
    /// Audio backend: alsa, pipewire or sim
    #[arg(long, default_value = "pipewire")]
    backend: BackendKind,

    /// Peer IP address
    #[arg(short = 'i', long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    /// Peer UDP port
    #[arg(long, default_value_t = DEFAULT_PEER_PORT)]
    port: u16,

    /// Local UDP port to receive on
    #[arg(long, default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// Sample rate in Hz
    #[arg(short = 'r', long, default_value_t = DEFAULT_SAMPLE_RATE)]
    rate: u32,

    /// Device buffer (period) size in frames
    #[arg(short = 'b', long, default_value_t = DEFAULT_DEVICE_BUFFER)]
    device_buffer: u32,

    /// Peer packet grouping in frames; a positive multiple of the device
    /// buffer
    #[arg(short = 'p', long, default_value_t = DEFAULT_PACKET_BUFFER)]
    packet_buffer: u32,

    /// Play-out ring buffer depth in frames
    #[arg(short = 'd', long, default_value_t = DEFAULT_RING_DEPTH)]
    ring_depth: u32,

    /// Bypass the network: copy capture straight to playback
    #[arg(short = 't', long)]
    passthrough: bool,

    /// Capture device (alsa only)
    #[arg(long, default_value = "default")]
    capture_device: String,

    /// Playback device (alsa only)
    #[arg(long, default_value = "default")]
    playback_device: String,

    /// Optional key=value config file (recognised key: udp_send_ip)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return code;
        }
    };

    if !backend::is_available(args.backend) {
        eprintln!("error: backend `{}` is not available in this build", args.backend);
        eprintln!("available backends:");
        for kind in BackendKind::ALL {
            if backend::is_available(kind) {
                eprintln!("  - {}", kind);
            }
        }
        return 1;
    }

    let mut config = EngineConfig {
        backend: args.backend,
        peer_ip: args.ip,
        peer_port: args.port,
        listen_port: args.listen_port,
        device_buffer: args.device_buffer,
        packet_buffer: args.packet_buffer,
        ring_depth: args.ring_depth,
        passthrough: args.passthrough,
        audio: AudioConfig {
            sample_rate: args.rate,
            frames: args.device_buffer,
            playback_channels: 2,
            capture_channels: 2,
            device_playback: args.playback_device.clone(),
            device_capture: args.capture_device.clone(),
        },
    };

    if let Some(path) = &args.config {
        if let Err(e) = config.apply_config_file(path) {
            eprintln!("error: {}", e);
            return 1;
        }
    }

    if let Err(e) = config.validate() {
        eprintln!("error: {}", e);
        return 1;
    }

    info!(
        "target {}:{}, backend {}, {} Hz, device buffer {} frames ({:.2} ms), \
         packet buffer {} frames ({:.2} ms), ring depth {} frames ({:.2} ms), \
         passthrough {}",
        config.peer_ip,
        config.peer_port,
        config.backend,
        config.audio.sample_rate,
        config.device_buffer,
        config.device_buffer as f64 * 1000.0 / config.audio.sample_rate as f64,
        config.packet_buffer,
        config.packet_buffer as f64 * 1000.0 / config.audio.sample_rate as f64,
        config.ring_depth,
        config.ring_depth as f64 * 1000.0 / config.audio.sample_rate as f64,
        if config.passthrough { "on" } else { "off" },
    );

    // The interrupt handler does one atomic store; the main loop below
    // polls it.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            error!("failed to install interrupt handler: {}", e);
            return 2;
        }
    }

    let mut engine = match Engine::init(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("engine init failed: {}", e);
            return 2;
        }
    };

    if let Err(e) = engine.start() {
        error!("engine start failed: {}", e);
        engine.shutdown();
        return 2;
    }

    info!("running, press ctrl-c to stop");
    while !interrupted.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    let _ = engine.stop();
    engine.shutdown();
    0
}

//! Direct PCM backend (ALSA).
//!
//! Opens separate capture and playback devices in S32LE interleaved mode
//! with the configured period size and a two-period device buffer, then runs
//! one audio thread: read a period, reduce capture to mono float, invoke the
//! process callback, interleave the two outputs back to S32 and write a
//! period. Device xruns recover with a prepare and are counted, never fatal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::AudioConfig;
use crate::{Error, Result};

use super::{AudioBackend, BackendStats, ProcessFn};

const I32_SCALE: f32 = 2147483648.0; // 2^31

#[derive(Default)]
struct SharedStats {
    callbacks: AtomicU64,
    capture_xruns: AtomicU64,
    playback_xruns: AtomicU64,
}

pub struct AlsaBackend {
    config: AudioConfig,
    callback: Arc<Mutex<Option<ProcessFn>>>,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    thread: Option<JoinHandle<()>>,
    initialised: bool,
}

impl AlsaBackend {
    pub fn new() -> Self {
        Self {
            config: AudioConfig::default(),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedStats::default()),
            thread: None,
            initialised: false,
        }
    }

    /// Open one PCM in S32LE interleaved mode with `frames` periods and a
    /// two-period buffer, the geometry the relay's latency math assumes.
    fn open_pcm(
        device: &str,
        direction: Direction,
        rate: u32,
        channels: u32,
        frames: u32,
    ) -> std::result::Result<PCM, alsa::Error> {
        let pcm = PCM::new(device, direction, false)?;
        {
            let hwp = HwParams::any(&pcm)?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(Format::S32LE)?;
            hwp.set_channels(channels)?;
            hwp.set_rate(rate, ValueOr::Nearest)?;
            hwp.set_period_size_near(frames as i64, ValueOr::Nearest)?;
            hwp.set_buffer_size_near(frames as i64 * 2)?;
            pcm.hw_params(&hwp)?;

            let actual_rate = hwp.get_rate()?;
            let period = hwp.get_period_size()?;
            let buffer = hwp.get_buffer_size()?;
            info!(
                "alsa {}: {} Hz, {} ch, period={}, buffer={} ({:.2} ms)",
                match direction {
                    Direction::Playback => "playback",
                    Direction::Capture => "capture",
                },
                actual_rate,
                channels,
                period,
                buffer,
                buffer as f64 * 1000.0 / actual_rate as f64
            );
        }
        {
            let swp = pcm.sw_params_current()?;
            swp.set_start_threshold(frames as i64)?;
            swp.set_avail_min(frames as i64)?;
            pcm.sw_params(&swp)?;
        }
        pcm.prepare()?;
        Ok(pcm)
    }

    fn audio_loop(
        config: AudioConfig,
        callback: Arc<Mutex<Option<ProcessFn>>>,
        running: Arc<AtomicBool>,
        stats: Arc<SharedStats>,
    ) {
        let frames = config.frames as usize;
        let cap_channels = config.capture_channels as usize;
        let play_channels = config.playback_channels as usize;

        let capture = match Self::open_pcm(
            &config.device_capture,
            Direction::Capture,
            config.sample_rate,
            config.capture_channels,
            config.frames,
        ) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("alsa capture open failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let playback = match Self::open_pcm(
            &config.device_playback,
            Direction::Playback,
            config.sample_rate,
            config.playback_channels,
            config.frames,
        ) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!("alsa playback open failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let capture_io = match capture.io_i32() {
            Ok(io) => io,
            Err(e) => {
                warn!("alsa capture io failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let playback_io = match playback.io_i32() {
            Ok(io) => io,
            Err(e) => {
                warn!("alsa playback io failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let mut capture_buf = vec![0i32; frames * cap_channels];
        let mut playback_buf = vec![0i32; frames * play_channels];
        let mut input = vec![0.0f32; frames];
        let mut out_left = vec![0.0f32; frames];
        let mut out_right = vec![0.0f32; frames];

        let mut guard = callback.lock();
        let Some(process) = guard.as_mut() else {
            return;
        };

        // Prime the playback buffer with one silent period so the first
        // write does not start behind the hardware pointer.
        let _ = playback_io.writei(&playback_buf);

        while running.load(Ordering::SeqCst) {
            match capture_io.readi(&mut capture_buf) {
                Ok(n) if n == frames => {}
                Ok(_) => {
                    stats.capture_xruns.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Err(e) => {
                    stats.capture_xruns.fetch_add(1, Ordering::Relaxed);
                    if capture.prepare().is_err() {
                        warn!("alsa capture recovery failed: {}", e);
                        break;
                    }
                    continue;
                }
            }

            // Mono reduction: designated channel 0.
            for i in 0..frames {
                input[i] = capture_buf[i * cap_channels] as f32 / I32_SCALE;
            }

            process(&input, &mut out_left, &mut out_right);
            stats.callbacks.fetch_add(1, Ordering::Relaxed);

            for i in 0..frames {
                let left = out_left[i].clamp(-1.0, 1.0);
                let right = out_right[i].clamp(-1.0, 1.0);
                let at = i * play_channels;
                playback_buf[at] = (left * (I32_SCALE - 1.0)) as i32;
                if play_channels > 1 {
                    playback_buf[at + 1] = (right * (I32_SCALE - 1.0)) as i32;
                }
                for ch in 2..play_channels {
                    playback_buf[at + ch] = 0;
                }
            }

            if let Err(e) = playback_io.writei(&playback_buf) {
                stats.playback_xruns.fetch_add(1, Ordering::Relaxed);
                if playback.prepare().is_err() {
                    warn!("alsa playback recovery failed: {}", e);
                    break;
                }
            }
        }

        running.store(false, Ordering::SeqCst);
    }
}

impl AudioBackend for AlsaBackend {
    fn init(&mut self, config: &AudioConfig, callback: ProcessFn) -> Result<()> {
        if self.initialised {
            return Err(Error::BackendInit("alsa backend already initialised".into()));
        }

        // Probe the devices now so init reports failures instead of the
        // audio thread dying silently at start.
        Self::open_pcm(
            &config.device_capture,
            Direction::Capture,
            config.sample_rate,
            config.capture_channels,
            config.frames,
        )
        .map_err(|e| Error::BackendInit(format!("capture `{}`: {}", config.device_capture, e)))?;
        Self::open_pcm(
            &config.device_playback,
            Direction::Playback,
            config.sample_rate,
            config.playback_channels,
            config.frames,
        )
        .map_err(|e| Error::BackendInit(format!("playback `{}`: {}", config.device_playback, e)))?;

        self.config = config.clone();
        *self.callback.lock() = Some(callback);
        self.initialised = true;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.initialised {
            return Err(Error::BackendInit("alsa backend not initialised".into()));
        }
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let callback = self.callback.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        self.thread = Some(thread::spawn(move || {
            Self::audio_loop(config, callback, running, stats);
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn cleanup(&mut self) {
        self.stop();
        *self.callback.lock() = None;
        self.initialised = false;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            callbacks: self.stats.callbacks.load(Ordering::Relaxed),
            capture_xruns: self.stats.capture_xruns.load(Ordering::Relaxed),
            playback_xruns: self.stats.playback_xruns.load(Ordering::Relaxed),
            glitches: 0,
        }
    }

    fn reported_latency_ms(&self) -> f64 {
        // Two-period buffers on each side of the device.
        let period_ms = self.config.frames as f64 * 1000.0 / self.config.sample_rate as f64;
        period_ms * 4.0
    }
}

impl Drop for AlsaBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

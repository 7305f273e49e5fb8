//! Simulated audio backend.
//!
//! A thread wakes once per period, synthesises a low-frequency sine as the
//! capture input, invokes the process callback and scans the outputs for
//! discontinuities. Gives the engine hardware-like cadence with no devices,
//! which is what the loopback tests and the `--backend sim` CLI mode run on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::{Error, Result};

use super::{AudioBackend, BackendStats, ProcessFn};

/// Test signal frequency (A4).
const SINE_HZ: f64 = 440.0;
const SINE_AMPLITUDE: f32 = 0.3;

/// A jump between adjacent output samples larger than this counts as a
/// glitch; a 440 Hz sine at amplitude 0.3 moves a tiny fraction of it per
/// sample at 48 kHz.
const GLITCH_THRESHOLD: f32 = 0.5;

#[derive(Default)]
struct SharedStats {
    callbacks: AtomicU64,
    glitches: AtomicU64,
}

pub struct SimulatedBackend {
    config: AudioConfig,
    callback: Arc<Mutex<Option<ProcessFn>>>,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    thread: Option<JoinHandle<()>>,
    initialised: bool,
}

impl SimulatedBackend {
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

    fn simulation_loop(
        config: AudioConfig,
        callback: Arc<Mutex<Option<ProcessFn>>>,
        running: Arc<AtomicBool>,
        stats: Arc<SharedStats>,
    ) {
        let frames = config.frames as usize;
        let rate = config.sample_rate;
        let period = Duration::from_nanos(frames as u64 * 1_000_000_000 / rate as u64);

        debug!(
            "simulated audio: {} Hz, {} frames, {:.3} ms period",
            rate,
            frames,
            period.as_secs_f64() * 1000.0
        );

        let mut input = vec![0.0f32; frames];
        let mut out_left = vec![0.0f32; frames];
        let mut out_right = vec![0.0f32; frames];

        let mut phase: f64 = 0.0;
        let step = SINE_HZ / rate as f64;
        let mut prev_left = 0.0f32;
        let mut prev_right = 0.0f32;

        let mut guard = callback.lock();
        let Some(process) = guard.as_mut() else {
            return;
        };

        let mut next_wake = Instant::now() + period;

        while running.load(Ordering::SeqCst) {
            for sample in input.iter_mut() {
                *sample = SINE_AMPLITUDE * (2.0 * std::f64::consts::PI * phase).sin() as f32;
                phase += step;
                if phase >= 1.0 {
                    phase -= 1.0;
                }
            }

            process(&input, &mut out_left, &mut out_right);
            stats.callbacks.fetch_add(1, Ordering::Relaxed);

            let mut glitches = 0u64;
            for i in 0..frames {
                if (out_left[i] - prev_left).abs() > GLITCH_THRESHOLD {
                    glitches += 1;
                }
                if (out_right[i] - prev_right).abs() > GLITCH_THRESHOLD {
                    glitches += 1;
                }
                prev_left = out_left[i];
                prev_right = out_right[i];
            }
            if glitches > 0 {
                stats.glitches.fetch_add(glitches, Ordering::Relaxed);
            }

            // Hardware-like cadence: coarse sleep, then hold the deadline.
            let now = Instant::now();
            if next_wake > now {
                let remaining = next_wake - now;
                if remaining > Duration::from_millis(1) {
                    thread::sleep(remaining - Duration::from_millis(1));
                }
                while Instant::now() < next_wake {
                    std::hint::spin_loop();
                }
            }
            next_wake += period;

            // Fallen too far behind (debugger, suspended VM): resynchronise
            // rather than bursting callbacks.
            if Instant::now() > next_wake + period {
                next_wake = Instant::now() + period;
            }
        }
    }
}

impl AudioBackend for SimulatedBackend {
    fn init(&mut self, config: &AudioConfig, callback: ProcessFn) -> Result<()> {
        if self.initialised {
            return Err(Error::BackendInit("simulated backend already initialised".into()));
        }
        self.config = config.clone();
        *self.callback.lock() = Some(callback);
        self.initialised = true;
        info!(
            "simulated backend ready: {} Hz, {} frames, test signal {:.0} Hz",
            config.sample_rate, config.frames, SINE_HZ
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.initialised {
            return Err(Error::BackendInit("simulated backend not initialised".into()));
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
            Self::simulation_loop(config, callback, running, stats);
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
            capture_xruns: 0,
            playback_xruns: 0,
            glitches: self.stats.glitches.load(Ordering::Relaxed),
        }
    }

    fn reported_latency_ms(&self) -> f64 {
        // One period of scheduling slack, no device buffers behind it.
        self.config.frames as f64 * 1000.0 / self.config.sample_rate as f64
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callback_cadence() {
        let mut backend = SimulatedBackend::new();
        let config = AudioConfig {
            frames: 64,
            ..AudioConfig::default()
        };

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_callback = seen.clone();
        backend
            .init(
                &config,
                Box::new(move |input, out_l, out_r| {
                    assert_eq!(input.len(), 64);
                    assert_eq!(out_l.len(), 64);
                    assert_eq!(out_r.len(), 64);
                    seen_in_callback.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        backend.start().unwrap();
        assert!(backend.is_running());
        thread::sleep(Duration::from_millis(200));
        backend.stop();
        assert!(!backend.is_running());

        // 200 ms at 48 kHz / 64 frames is exactly 150 periods; allow wide
        // scheduling slack either way.
        let callbacks = seen.load(Ordering::Relaxed);
        assert!(callbacks > 50, "only {} callbacks in 200 ms", callbacks);
        assert!(callbacks < 400, "{} callbacks in 200 ms", callbacks);
        assert_eq!(backend.stats().callbacks, callbacks as u64);
    }

    #[test]
    fn test_input_is_bounded_sine() {
        let mut backend = SimulatedBackend::new();
        let peak = Arc::new(Mutex::new(0.0f32));
        let peak_in_callback = peak.clone();
        backend
            .init(
                &AudioConfig::default(),
                Box::new(move |input, _out_l, _out_r| {
                    let mut peak = peak_in_callback.lock();
                    for &s in input {
                        *peak = peak.max(s.abs());
                    }
                }),
            )
            .unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        backend.stop();

        let peak = *peak.lock();
        assert!(peak > 0.1, "sine never reached amplitude, peak {}", peak);
        assert!(peak <= SINE_AMPLITUDE + 1e-6);
    }

    #[test]
    fn test_smooth_output_counts_no_glitches() {
        let mut backend = SimulatedBackend::new();
        backend
            .init(
                &AudioConfig::default(),
                Box::new(|input, out_l, out_r| {
                    out_l.copy_from_slice(input);
                    out_r.copy_from_slice(input);
                }),
            )
            .unwrap();
        backend.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        backend.stop();

        assert_eq!(backend.stats().glitches, 0);
    }

    #[test]
    fn test_start_requires_init() {
        let mut backend = SimulatedBackend::new();
        assert!(backend.start().is_err());
    }

    #[test]
    fn test_cleanup_then_reinit() {
        let mut backend = SimulatedBackend::new();
        backend
            .init(&AudioConfig::default(), Box::new(|_, _, _| {}))
            .unwrap();
        backend.cleanup();
        backend
            .init(&AudioConfig::default(), Box::new(|_, _, _| {}))
            .unwrap();
    }
}

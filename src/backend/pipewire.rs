//! Server-routed backend (PipeWire).
//!
//! The original filter shape - one mono capture port feeding a process
//! callback that fills two mono playback ports - is rendered here as a
//! capture/playback stream pair on one PipeWire main loop: filter bindings
//! do not exist in the pipewire crate, so the capture stream's process
//! callback accumulates input, drives the engine callback once per period
//! and pushes the interleaved result into a shared queue that the playback
//! stream's process callback drains. Both callbacks run on the loop thread,
//! so the queue is plain `Rc<RefCell>` state.
//!
//! The requested period is pinned with `PIPEWIRE_LATENCY`, the same hint
//! the server honours for any client.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use pipewire as pw;
use pw::properties::properties;
use pw::stream::{Stream, StreamFlags};
use tracing::{info, warn};

use crate::config::AudioConfig;
use crate::{Error, Result, CHANNELS};

use super::{AudioBackend, BackendStats, ProcessFn};

/// Playback queue bound: periods of processed audio the playback stream may
/// fall behind before the oldest frames are dropped.
const QUEUE_PERIODS: usize = 8;

#[derive(Default)]
struct SharedStats {
    callbacks: AtomicU64,
    playback_xruns: AtomicU64,
}

/// State shared by the two stream callbacks on the loop thread.
struct Dsp {
    /// Capture samples not yet consumed by a full period.
    pending_in: Vec<f32>,
    /// Interleaved processed frames awaiting the playback stream.
    out_queue: VecDeque<f32>,
    input: Vec<f32>,
    out_left: Vec<f32>,
    out_right: Vec<f32>,
}

pub struct PipewireBackend {
    config: AudioConfig,
    callback: Arc<Mutex<Option<ProcessFn>>>,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    thread: Option<JoinHandle<()>>,
    quit_tx: Option<pw::channel::Sender<()>>,
    initialised: bool,
}

impl PipewireBackend {
    pub fn new() -> Self {
        Self {
            config: AudioConfig::default(),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedStats::default()),
            thread: None,
            quit_tx: None,
            initialised: false,
        }
    }

    /// Connect to the server once so init reports an absent daemon instead
    /// of the loop thread dying silently at start. The loop objects are not
    /// Send, so the probe runs on its own short-lived thread.
    fn probe_server() -> std::result::Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            pw::init();
            let result = (|| {
                let mainloop =
                    pw::main_loop::MainLoop::new(None).map_err(|e| e.to_string())?;
                let context = pw::context::Context::new(&mainloop).map_err(|e| e.to_string())?;
                let _core = context.connect(None).map_err(|e| e.to_string())?;
                Ok(())
            })();
            let _ = tx.send(result);
        });
        rx.recv()
            .map_err(|_| "pipewire probe thread died".to_string())?
    }

    /// Serialised EnumFormat pod for a float stream with `channels`.
    fn format_pod(rate: u32, channels: u32) -> Vec<u8> {
        let mut audio_info = pw::spa::param::audio::AudioInfoRaw::new();
        audio_info.set_format(pw::spa::param::audio::AudioFormat::F32LE);
        audio_info.set_rate(rate);
        audio_info.set_channels(channels);
        pw::spa::pod::serialize::PodSerializer::serialize(
            std::io::Cursor::new(Vec::new()),
            &pw::spa::pod::Value::Object(pw::spa::pod::Object {
                type_: pw::spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
                id: pw::spa::param::ParamType::EnumFormat.as_raw(),
                properties: audio_info.into(),
            }),
        )
        .unwrap()
        .0
        .into_inner()
    }

    fn loop_thread_main(
        config: AudioConfig,
        callback: Arc<Mutex<Option<ProcessFn>>>,
        running: Arc<AtomicBool>,
        stats: Arc<SharedStats>,
        quit_rx: pw::channel::Receiver<()>,
    ) {
        let frames = config.frames as usize;
        let rate = config.sample_rate;

        pw::init();
        let mainloop = match pw::main_loop::MainLoop::new(None) {
            Ok(mainloop) => mainloop,
            Err(e) => {
                warn!("pipewire main loop failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let context = match pw::context::Context::new(&mainloop) {
            Ok(context) => context,
            Err(e) => {
                warn!("pipewire context failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };
        let core = match context.connect(None) {
            Ok(core) => core,
            Err(e) => {
                warn!("pipewire connect failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        // Stop requests arrive from the control thread; quit the loop from
        // inside it.
        let _quit_watch = quit_rx.attach(mainloop.loop_(), {
            let mainloop = mainloop.clone();
            move |_| mainloop.quit()
        });

        let dsp = Rc::new(RefCell::new(Dsp {
            pending_in: Vec::with_capacity(frames * 4),
            out_queue: VecDeque::with_capacity(frames * CHANNELS * QUEUE_PERIODS),
            input: vec![0.0; frames],
            out_left: vec![0.0; frames],
            out_right: vec![0.0; frames],
        }));

        let capture = match Stream::new(
            &core,
            "jamlink-capture",
            properties! {
                "media.type" => "Audio",
                "media.category" => "Capture",
                "media.role" => "DSP",
                "node.name" => "jamlink"
            },
        ) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("pipewire capture stream failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let capture_listener = capture
            .add_local_listener_with_user_data(())
            .process({
                let dsp = dsp.clone();
                let callback = callback.clone();
                let stats = stats.clone();
                move |stream, _| {
                    let Some(mut buffer) = stream.dequeue_buffer() else {
                        return;
                    };
                    let datas = buffer.datas_mut();
                    if datas.is_empty() {
                        return;
                    }
                    let data = &mut datas[0];
                    let n_samples = data.chunk().size() as usize / std::mem::size_of::<f32>();
                    let Some(bytes) = data.data() else {
                        return;
                    };
                    let n_samples = n_samples.min(bytes.len() / std::mem::size_of::<f32>());
                    let samples = unsafe {
                        std::slice::from_raw_parts(bytes.as_ptr() as *const f32, n_samples)
                    };

                    let mut dsp = dsp.borrow_mut();
                    dsp.pending_in.extend_from_slice(samples);

                    let mut guard = callback.lock();
                    let Some(process) = guard.as_mut() else {
                        return;
                    };
                    while dsp.pending_in.len() >= frames {
                        let dsp = &mut *dsp;
                        dsp.input.copy_from_slice(&dsp.pending_in[..frames]);
                        dsp.pending_in.drain(..frames);

                        process(&dsp.input, &mut dsp.out_left, &mut dsp.out_right);
                        stats.callbacks.fetch_add(1, Ordering::Relaxed);

                        for i in 0..frames {
                            dsp.out_queue.push_back(dsp.out_left[i]);
                            dsp.out_queue.push_back(dsp.out_right[i]);
                        }
                        while dsp.out_queue.len() > frames * CHANNELS * QUEUE_PERIODS {
                            dsp.out_queue.pop_front();
                        }
                    }
                }
            })
            .register();
        let _capture_listener = match capture_listener {
            Ok(listener) => listener,
            Err(e) => {
                warn!("pipewire capture listener failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let playback = match Stream::new(
            &core,
            "jamlink-playback",
            properties! {
                "media.type" => "Audio",
                "media.category" => "Playback",
                "media.role" => "DSP",
                "node.name" => "jamlink"
            },
        ) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("pipewire playback stream failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let playback_listener = playback
            .add_local_listener_with_user_data(())
            .process({
                let dsp = dsp.clone();
                let stats = stats.clone();
                move |stream, _| {
                    let Some(mut buffer) = stream.dequeue_buffer() else {
                        return;
                    };
                    let datas = buffer.datas_mut();
                    if datas.is_empty() {
                        return;
                    }
                    let stride = CHANNELS * std::mem::size_of::<f32>();
                    let data = &mut datas[0];
                    let Some(bytes) = data.data() else {
                        return;
                    };
                    let n_frames = bytes.len() / stride;
                    let out = unsafe {
                        std::slice::from_raw_parts_mut(
                            bytes.as_mut_ptr() as *mut f32,
                            n_frames * CHANNELS,
                        )
                    };

                    let mut dsp = dsp.borrow_mut();
                    let mut short = false;
                    for slot in out.iter_mut() {
                        match dsp.out_queue.pop_front() {
                            Some(sample) => *slot = sample,
                            None => {
                                *slot = 0.0;
                                short = true;
                            }
                        }
                    }
                    if short {
                        stats.playback_xruns.fetch_add(1, Ordering::Relaxed);
                    }

                    let chunk = data.chunk_mut();
                    *chunk.offset_mut() = 0;
                    *chunk.stride_mut() = stride as i32;
                    *chunk.size_mut() = (n_frames * stride) as u32;
                }
            })
            .register();
        let _playback_listener = match playback_listener {
            Ok(listener) => listener,
            Err(e) => {
                warn!("pipewire playback listener failed: {}", e);
                running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let capture_format = Self::format_pod(rate, 1);
        let playback_format = Self::format_pod(rate, CHANNELS as u32);
        let mut capture_params =
            [pw::spa::pod::Pod::from_bytes(&capture_format).unwrap()];
        let mut playback_params =
            [pw::spa::pod::Pod::from_bytes(&playback_format).unwrap()];

        let flags = StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS;
        if let Err(e) = capture.connect(
            pw::spa::utils::Direction::Input,
            None,
            flags,
            &mut capture_params,
        ) {
            warn!("pipewire capture connect failed: {}", e);
            running.store(false, Ordering::SeqCst);
            return;
        }
        if let Err(e) = playback.connect(
            pw::spa::utils::Direction::Output,
            None,
            flags,
            &mut playback_params,
        ) {
            warn!("pipewire playback connect failed: {}", e);
            running.store(false, Ordering::SeqCst);
            return;
        }

        info!(
            "pipewire streams connected: {} Hz, {} frames per period",
            rate, frames
        );

        mainloop.run();
    }
}

impl AudioBackend for PipewireBackend {
    fn init(&mut self, config: &AudioConfig, callback: ProcessFn) -> Result<()> {
        if self.initialised {
            return Err(Error::BackendInit("pipewire backend already initialised".into()));
        }

        Self::probe_server().map_err(|e| Error::BackendInit(format!("pipewire: {}", e)))?;

        // Ask the server for the configured period, the same way any client
        // pins its quantum.
        std::env::set_var(
            "PIPEWIRE_LATENCY",
            format!("{}/{}", config.frames, config.sample_rate),
        );

        self.config = config.clone();
        *self.callback.lock() = Some(callback);
        self.initialised = true;
        info!(
            "pipewire backend ready: {} Hz, {} frames",
            config.sample_rate, config.frames
        );
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if !self.initialised {
            return Err(Error::BackendInit("pipewire backend not initialised".into()));
        }
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);

        let (quit_tx, quit_rx) = pw::channel::channel();
        self.quit_tx = Some(quit_tx);

        let config = self.config.clone();
        let callback = self.callback.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        self.thread = Some(thread::spawn(move || {
            Self::loop_thread_main(config, callback, running, stats, quit_rx);
        }));

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(quit_tx) = self.quit_tx.take() {
            let _ = quit_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.running.store(false, Ordering::SeqCst);
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
            playback_xruns: self.stats.playback_xruns.load(Ordering::Relaxed),
            glitches: 0,
        }
    }

    fn reported_latency_ms(&self) -> f64 {
        // One server quantum plus the period queued between the streams.
        2.0 * self.config.frames as f64 * 1000.0 / self.config.sample_rate as f64
    }
}

impl Drop for PipewireBackend {
    fn drop(&mut self) {
        self.cleanup();
    }
}

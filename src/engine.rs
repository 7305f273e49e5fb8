//! Transport engine.
//!
//! Owns the sockets, the play-out ring buffer, the latency manager and the
//! audio backend, and wires them together with two realtime paths:
//!
//! - the **audio callback**, invoked by the backend once per period:
//!   packetize the capture input, stamp the send timestamp, fire the
//!   datagram, then pop one period from the ring buffer into the playback
//!   outputs. It never blocks beyond the two short mutexes, never
//!   allocates, and a send failure is counted rather than propagated;
//! - the **receive thread**, spawned at init: block on the socket with a
//!   short timeout, dispatch datagrams by exact length (audio packet, peer
//!   report, junk), feed the latency manager and push into the ring.
//!
//! Lifecycle is driven only through the control API: `init` builds an owned
//! engine, `start`/`stop` gate the backend, `shutdown` (or drop) stops the
//! backend first so no new callbacks fire, then joins the receive thread
//! within one read timeout, then releases sockets and devices.

use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::backend::{self, AudioBackend, BackendStats, ProcessFn};
use crate::clock;
use crate::config::EngineConfig;
use crate::latency::{LatencyManager, LatencyMetrics};
use crate::net;
use crate::packet::{Packet, PeerReport, PACKET_BYTES, PEER_REPORT_BYTES};
use crate::ring::{PlayoutRing, PopStatus};
use crate::{Error, Result, CHANNELS, MAX_CHUNK};

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    invalid_datagrams: AtomicU64,
}

/// Runtime counters of one engine, readable while running.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    /// Datagrams dropped for wrong length or failed parse.
    pub invalid_datagrams: u64,
    pub ring_overruns: u64,
    pub ring_underruns: u64,
    pub backend: BackendStats,
}

pub struct Engine {
    config: EngineConfig,
    backend: Box<dyn AudioBackend>,
    ring: Arc<PlayoutRing>,
    latency: Arc<LatencyManager>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    passthrough: Arc<AtomicBool>,
    peer_buffer: Arc<AtomicU32>,
    recv_thread: Option<JoinHandle<()>>,
    running: bool,
}

impl Engine {
    /// Build a ready-to-start engine: sockets bound and connected, ring
    /// buffer pre-filled, backend initialised with the process callback,
    /// receive thread live. Any failure unwinds everything built so far.
    pub fn init(config: EngineConfig) -> Result<Engine> {
        config.validate()?;

        let peer = SocketAddrV4::new(config.peer_ip, config.peer_port);
        let sender = Arc::new(net::connect_sender(peer)?);
        let receiver = net::bind_receiver(config.listen_port)?;

        let mut backend = backend::create(config.backend)?;

        let ring = Arc::new(PlayoutRing::new(
            config.ring_depth as usize,
            CHANNELS,
            config.packet_buffer as usize,
        ));
        let latency = Arc::new(LatencyManager::new(
            config.audio.sample_rate,
            config.packet_buffer,
            0.0,
        ));
        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let passthrough = Arc::new(AtomicBool::new(config.passthrough));
        let peer_buffer = Arc::new(AtomicU32::new(0));

        let callback = build_callback(
            sender,
            ring.clone(),
            latency.clone(),
            counters.clone(),
            passthrough.clone(),
        );
        backend.init(&config.audio, callback)?;
        latency.set_backend_latency_ms(backend.reported_latency_ms());

        let recv_thread = {
            let ring = ring.clone();
            let latency = latency.clone();
            let counters = counters.clone();
            let stop = stop.clone();
            let peer_buffer = peer_buffer.clone();
            thread::spawn(move || {
                receive_loop(receiver, ring, latency, counters, stop, peer_buffer);
            })
        };

        info!(
            "engine initialised: peer {}:{}, listening on {}, {} backend, \
             {} Hz, period {} frames, packet grouping {} frames \
             ({:.2} ms expected interval), ring depth {} frames",
            config.peer_ip,
            config.peer_port,
            config.listen_port,
            config.backend,
            config.audio.sample_rate,
            config.device_buffer,
            config.packet_buffer,
            latency.expected_interval_ms(),
            config.ring_depth,
        );

        Ok(Engine {
            config,
            backend,
            ring,
            latency,
            counters,
            stop,
            passthrough,
            peer_buffer,
            recv_thread: Some(recv_thread),
            running: false,
        })
    }

    /// Start the backend; the audio callback then fires autonomously.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }
        self.backend.start()?;
        self.running = true;
        info!("engine started");
        Ok(())
    }

    /// Stop the backend. The receive thread keeps running so packets still
    /// in flight are drained into the ring buffer.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(Error::NotRunning);
        }
        self.backend.stop();
        self.running = false;
        info!("engine stopped");
        Ok(())
    }

    /// Synchronous teardown: no new callbacks, receive thread joined within
    /// one read timeout, sockets and devices released.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.running {
            self.backend.stop();
            self.running = false;
        }
        self.backend.cleanup();
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
            info!("engine shut down");
        }
    }

    /// Apply runtime-changeable settings in place. Anything baked into
    /// sockets, threads or allocations returns [`Error::RestartRequired`]
    /// so the caller can shutdown + re-init.
    pub fn update(&mut self, new: &EngineConfig) -> Result<()> {
        new.validate()?;
        if self.config.requires_restart(new) {
            return Err(Error::RestartRequired);
        }
        self.passthrough.store(new.passthrough, Ordering::SeqCst);
        self.config = new.clone();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Last completed latency window; safe to call while running.
    pub fn latency_snapshot(&self) -> LatencyMetrics {
        self.latency.snapshot()
    }

    /// Frame count of the peer's most recent packet; zero before any packet
    /// arrived. A mid-stream change only affects this query, never the ring
    /// buffer geometry.
    pub fn peer_buffer_size(&self) -> u32 {
        self.peer_buffer.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
            invalid_datagrams: self.counters.invalid_datagrams.load(Ordering::Relaxed),
            ring_overruns: self.ring.overruns(),
            ring_underruns: self.ring.underruns(),
            backend: self.backend.stats(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Build the per-period process callback. All scratch space is owned by the
/// closure so the hot path never allocates.
fn build_callback(
    sender: Arc<UdpSocket>,
    ring: Arc<PlayoutRing>,
    latency: Arc<LatencyManager>,
    counters: Arc<Counters>,
    passthrough: Arc<AtomicBool>,
) -> ProcessFn {
    let mut packet = Packet::new();
    let mut wire = [0u8; PACKET_BYTES];
    let mut scratch = vec![0.0f32; MAX_CHUNK * CHANNELS];

    Box::new(move |input, out_left, out_right| {
        if passthrough.load(Ordering::Relaxed) {
            let n = input.len().min(out_left.len()).min(out_right.len());
            out_left[..n].copy_from_slice(&input[..n]);
            out_right[..n].copy_from_slice(&input[..n]);
            return;
        }

        packet.fill_mono(input);
        packet.t1_send = clock::now_ns();
        packet.encode_into(&mut wire);
        match sender.send(&wire) {
            Ok(_) => {
                counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if counters.send_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("packet send failed: {}", e);
                }
            }
        }

        let n = input.len().min(MAX_CHUNK).min(out_left.len()).min(out_right.len());
        let frames = &mut scratch[..n * CHANNELS];
        match ring.pop(frames, CHANNELS) {
            Ok(PopStatus::Filled) => {}
            Ok(PopStatus::Underrun) => latency.report_xrun(),
            // Channel geometry is fixed at init; unreachable in practice.
            Err(_) => latency.report_xrun(),
        }
        for i in 0..n {
            out_left[i] = frames[i * CHANNELS];
            out_right[i] = frames[i * CHANNELS + 1];
        }
    })
}

fn receive_loop(
    socket: UdpSocket,
    ring: Arc<PlayoutRing>,
    latency: Arc<LatencyManager>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    peer_buffer: Arc<AtomicU32>,
) {
    net::set_realtime_priority();

    // One byte larger than the biggest valid frame so oversized datagrams
    // read back with a distinguishable length instead of being truncated
    // into a false match.
    let mut buf = [0u8; PACKET_BYTES + 1];

    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) if len == PACKET_BYTES => match Packet::parse(&buf[..len]) {
                Ok(mut packet) => {
                    latency.on_receive(&mut packet);
                    counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    peer_buffer.store(packet.n_samples as u32, Ordering::Relaxed);
                    let _ = ring.push(packet.frames(), CHANNELS);
                    latency.report_ring_fill(ring.available() as u32);
                }
                Err(_) => {
                    counters.invalid_datagrams.fetch_add(1, Ordering::Relaxed);
                }
            },
            Ok((len, _from)) if len == PEER_REPORT_BYTES => {
                match PeerReport::parse(&buf[..len]) {
                    Ok(report) => latency.handle_peer_report(&report),
                    Err(_) => {
                        counters.invalid_datagrams.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(_) => {
                counters.invalid_datagrams.fetch_add(1, Ordering::Relaxed);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if counters.recv_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("receive failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use rand::{Rng, SeedableRng};
    use std::net::Ipv4Addr;

    fn sim_config(listen_port: u16) -> EngineConfig {
        EngineConfig {
            backend: BackendKind::Simulated,
            peer_ip: Ipv4Addr::LOCALHOST,
            peer_port: 9,
            listen_port,
            ..EngineConfig::default()
        }
    }

    fn callback_fixture(
        passthrough: bool,
        ring_depth: usize,
    ) -> (ProcessFn, UdpSocket, Arc<PlayoutRing>, Arc<Counters>, Arc<LatencyManager>) {
        let receiver = net::bind_receiver(0).unwrap();
        let port = receiver.local_addr().unwrap().port();
        let sender = Arc::new(
            net::connect_sender(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap(),
        );
        let ring = Arc::new(PlayoutRing::new(ring_depth, CHANNELS, 64));
        let latency = Arc::new(LatencyManager::new(48000, 64, 0.0));
        let counters = Arc::new(Counters::default());
        let callback = build_callback(
            sender,
            ring.clone(),
            latency.clone(),
            counters.clone(),
            Arc::new(AtomicBool::new(passthrough)),
        );
        (callback, receiver, ring, counters, latency)
    }

    #[test]
    fn test_passthrough_bit_identity() {
        let (mut callback, _receiver, _ring, _counters, _latency) =
            callback_fixture(true, 2048);

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x6A616D);
        let input: Vec<f32> = (0..4096)
            .map(|_| rng.gen_range(-1.0f32..=1.0))
            .collect();

        let mut left = Vec::with_capacity(4096);
        let mut right = Vec::with_capacity(4096);
        for chunk in input.chunks(128) {
            let mut out_l = vec![0.0f32; chunk.len()];
            let mut out_r = vec![0.0f32; chunk.len()];
            callback(chunk, &mut out_l, &mut out_r);
            left.extend_from_slice(&out_l);
            right.extend_from_slice(&out_r);
        }

        for i in 0..input.len() {
            let want = input[i].clamp(-1.0, 1.0).to_bits();
            assert_eq!(left[i].to_bits(), want, "left sample {}", i);
            assert_eq!(right[i].to_bits(), want, "right sample {}", i);
        }
    }

    #[test]
    fn test_callback_sends_then_pops() {
        let (mut callback, receiver, ring, counters, _latency) =
            callback_fixture(false, 2048);

        let input: Vec<f32> = (0..32).map(|i| i as f32 / 64.0).collect();
        let mut out_l = vec![0.5f32; 32];
        let mut out_r = vec![0.5f32; 32];
        callback(&input, &mut out_l, &mut out_r);

        // The period went out as one packet with the input duplicated into
        // both channels and a live send timestamp.
        let mut buf = [0u8; PACKET_BYTES + 1];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(len, PACKET_BYTES);
        let packet = Packet::parse(&buf[..len]).unwrap();
        assert_eq!(packet.n_samples, 32);
        for (i, &s) in input.iter().enumerate() {
            assert_eq!(packet.samples[i * CHANNELS], s);
            assert_eq!(packet.samples[i * CHANNELS + 1], s);
        }
        assert_eq!(counters.packets_sent.load(Ordering::Relaxed), 1);

        // The pop came out of the silent pre-fill.
        assert!(out_l.iter().all(|&s| s == 0.0));
        assert!(out_r.iter().all(|&s| s == 0.0));
        assert_eq!(ring.available(), 2048 - 64 - 32);
    }

    #[test]
    fn test_callback_reports_xrun_on_underrun() {
        let (mut callback, _receiver, ring, _counters, latency) =
            callback_fixture(false, 96);

        // Pre-fill is 96 - 64 = 32 frames; the second period underruns.
        let input = vec![0.0f32; 32];
        let mut out_l = vec![0.0f32; 32];
        let mut out_r = vec![0.0f32; 32];
        callback(&input, &mut out_l, &mut out_r);
        assert_eq!(latency.snapshot().xruns, 0);

        callback(&input, &mut out_l, &mut out_r);
        assert_eq!(latency.snapshot().xruns, 1);
        assert_eq!(ring.underruns(), 1);
    }

    #[test]
    fn test_engine_lifecycle_and_update() {
        let mut engine = Engine::init(sim_config(0)).unwrap();
        assert!(!engine.is_running());

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(Error::AlreadyRunning)));

        // Passthrough toggles in place.
        let mut new = engine.config().clone();
        new.passthrough = true;
        engine.update(&new).unwrap();

        // Geometry changes demand a restart.
        let mut new = engine.config().clone();
        new.ring_depth = 4096;
        assert!(matches!(engine.update(&new), Err(Error::RestartRequired)));

        engine.stop().unwrap();
        assert!(matches!(engine.stop(), Err(Error::NotRunning)));
        engine.shutdown();
    }

    #[test]
    fn test_init_cleanup_init_same_config() {
        let config = sim_config(47123);

        let engine = Engine::init(config.clone()).unwrap();
        assert_eq!(engine.peer_buffer_size(), 0);
        assert_eq!(engine.stats().packets_sent, 0);
        engine.shutdown();

        // The listen port is free again and the fresh engine starts from
        // the same observable state.
        let engine = Engine::init(config).unwrap();
        assert_eq!(engine.peer_buffer_size(), 0);
        assert_eq!(engine.stats().packets_sent, 0);
        assert_eq!(engine.stats().ring_underruns, 0);
        engine.shutdown();
    }

    #[test]
    fn test_receive_loop_drops_junk() {
        let config = sim_config(47125);
        let engine = Engine::init(config).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .send_to(&[0u8; 17], ("127.0.0.1", 47125))
            .unwrap();

        // Give the receive thread a moment to pick it up.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(engine.stats().invalid_datagrams, 1);
        assert_eq!(engine.stats().packets_received, 0);
        engine.shutdown();
    }

    #[test]
    fn test_receive_loop_accepts_packet_and_peer_report() {
        let config = sim_config(47127);
        let engine = Engine::init(config).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        // A processing peer returns already-interleaved stereo.
        let mut packet = Packet::from_frames(&vec![0.25f32; 64 * CHANNELS]);
        packet.t1_send = clock::now_ns();
        let mut wire = [0u8; PACKET_BYTES];
        packet.encode_into(&mut wire);
        socket.send_to(&wire, ("127.0.0.1", 47127)).unwrap();

        let report = PeerReport {
            xruns: 2,
            proc_avg_us: 900,
            fill_avg_us: 15000,
        };
        let mut wire = [0u8; PEER_REPORT_BYTES];
        report.encode_into(&mut wire);
        socket.send_to(&wire, ("127.0.0.1", 47127)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(100));

        assert_eq!(engine.stats().packets_received, 1);
        assert_eq!(engine.peer_buffer_size(), 64);
        let metrics = engine.latency_snapshot();
        assert_eq!(metrics.rtt_count, 1);
        assert_eq!(metrics.peer_report, Some(report));
        engine.shutdown();
    }

    #[test]
    fn test_config_is_validated_at_init() {
        let mut config = sim_config(0);
        config.packet_buffer = 48;
        assert!(matches!(
            Engine::init(config),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_unavailable_backend_fails_init() {
        let mut config = sim_config(0);
        config.backend = BackendKind::Alsa;
        if !backend::is_available(BackendKind::Alsa) {
            assert!(matches!(
                Engine::init(config),
                Err(Error::BackendUnavailable("alsa"))
            ));
        }
    }
}

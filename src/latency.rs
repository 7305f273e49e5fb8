//! Latency manager.
//!
//! Keeps running min/avg/max distributions over the quantities the
//! four-point timestamp schema exposes: round-trip time (t4 - t1), peer
//! processing time (t3 - t2), peer-side receive jitter (successive t2
//! deltas), local receive jitter (successive t4 deltas) and the play-out
//! buffer fill level. Every report period the running window is logged,
//! copied into a snapshot readable from the control thread and reset.
//!
//! Written to by the receive thread (per packet) and by the audio callback
//! (xrun reports); both go through one short mutex with no I/O inside the
//! critical section except the once-per-period report line.

use parking_lot::Mutex;

use crate::clock;
use crate::packet::{Packet, PeerReport};

/// Report and snapshot window length.
const REPORT_PERIOD_NS: u64 = 2_000_000_000;

/// Running {min, max, sum, count} over nanosecond (or sample-count) values.
#[derive(Debug, Default, Clone, Copy)]
struct Stat {
    min: u64,
    max: u64,
    sum: u64,
    count: u64,
}

impl Stat {
    fn fold(&mut self, value: u64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.sum += value;
        self.count += 1;
    }

    fn avg(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }

    /// (min, avg, max) in milliseconds, treating folded values as
    /// nanoseconds.
    fn ns_to_ms(&self) -> (f64, f64, f64) {
        (
            self.min as f64 / 1e6,
            self.avg() as f64 / 1e6,
            self.max as f64 / 1e6,
        )
    }

    /// (min, avg, max) in milliseconds, treating folded values as frame
    /// counts at `sample_rate`.
    fn frames_to_ms(&self, sample_rate: u32) -> (f64, f64, f64) {
        let scale = 1000.0 / sample_rate as f64;
        (
            self.min as f64 * scale,
            self.avg() as f64 * scale,
            self.max as f64 * scale,
        )
    }
}

#[derive(Default)]
struct Window {
    rtt: Stat,
    processing: Stat,
    peer_jitter: Stat,
    local_jitter: Stat,
    ring_fill: Stat,
}

struct State {
    running: Window,
    completed: Window,
    have_completed: bool,
    prev_t2: u64,
    prev_t4: u64,
    last_report: u64,
    xruns: u64,
    backend_latency_ms: f64,
    peer: Option<PeerReport>,
}

/// Snapshot of one completed report window, all values in milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyMetrics {
    pub rtt_min_ms: f64,
    pub rtt_avg_ms: f64,
    pub rtt_max_ms: f64,
    /// Count of RTT samples folded into the window; zero means the peer is
    /// not answering.
    pub rtt_count: u64,

    pub processing_min_ms: f64,
    pub processing_avg_ms: f64,
    pub processing_max_ms: f64,

    pub peer_jitter_min_ms: f64,
    pub peer_jitter_avg_ms: f64,
    pub peer_jitter_max_ms: f64,

    pub local_jitter_min_ms: f64,
    pub local_jitter_avg_ms: f64,
    pub local_jitter_max_ms: f64,

    pub ring_fill_min_ms: f64,
    pub ring_fill_avg_ms: f64,
    pub ring_fill_max_ms: f64,

    /// Xruns since engine start (cumulative, not per window).
    pub xruns: u64,
    /// Fixed audio-device add-on to every end-to-end figure.
    pub backend_latency_ms: f64,
    /// Most recent side-channel report from the peer, if it sends one.
    pub peer_report: Option<PeerReport>,
}

pub struct LatencyManager {
    sample_rate: u32,
    expected_interval_ms: f64,
    inner: Mutex<State>,
}

impl LatencyManager {
    /// `buffer_frames` is the peer packet grouping; its duration is the
    /// expected packet cadence on the wire.
    pub fn new(sample_rate: u32, buffer_frames: u32, backend_latency_ms: f64) -> Self {
        Self {
            sample_rate,
            expected_interval_ms: buffer_frames as f64 * 1000.0 / sample_rate as f64,
            inner: Mutex::new(State {
                running: Window::default(),
                completed: Window::default(),
                have_completed: false,
                prev_t2: 0,
                prev_t4: 0,
                last_report: 0,
                xruns: 0,
                backend_latency_ms,
                peer: None,
            }),
        }
    }

    /// Expected packet interval derived from the configured grouping.
    pub fn expected_interval_ms(&self) -> f64 {
        self.expected_interval_ms
    }

    /// The device latency is only known once the backend is up; the engine
    /// fills it in after backend init.
    pub fn set_backend_latency_ms(&self, ms: f64) {
        self.inner.lock().backend_latency_ms = ms;
    }

    /// Stamp the arrival time into the packet and fold its timestamps into
    /// the running window. Emits the periodic report line when due.
    pub fn on_receive(&self, packet: &mut Packet) {
        packet.t4_recv = clock::now_ns();
        self.fold_stamped(packet);
    }

    /// Fold an already-stamped packet. Split out of [`on_receive`] so the
    /// fold math is testable against fixed timestamp quadruples.
    fn fold_stamped(&self, packet: &Packet) {
        let mut st = self.inner.lock();

        st.running
            .rtt
            .fold(packet.t4_recv.saturating_sub(packet.t1_send));
        st.running
            .processing
            .fold(packet.t3_peer_send.saturating_sub(packet.t2_peer_recv));

        // First packet has no predecessor; folding a delta against zero
        // would poison the window with a bogus multi-second value.
        if st.prev_t2 != 0 {
            let delta = packet.t2_peer_recv.saturating_sub(st.prev_t2);
            st.running.peer_jitter.fold(delta);
        }
        if st.prev_t4 != 0 {
            let delta = packet.t4_recv.saturating_sub(st.prev_t4);
            st.running.local_jitter.fold(delta);
        }
        st.prev_t2 = packet.t2_peer_recv;
        st.prev_t4 = packet.t4_recv;

        let now = packet.t4_recv;
        if st.last_report == 0 {
            st.last_report = now;
        } else if now.saturating_sub(st.last_report) >= REPORT_PERIOD_NS {
            self.rotate(&mut st, now);
        }
    }

    /// Close the running window: log it, make it the snapshot, zero it.
    fn rotate(&self, st: &mut State, now: u64) {
        let ring = st.running.ring_fill.frames_to_ms(self.sample_rate);
        let rtt = st.running.rtt.ns_to_ms();
        let processing = st.running.processing.ns_to_ms();
        let peer_jitter = st.running.peer_jitter.ns_to_ms();
        let local_jitter = st.running.local_jitter.ns_to_ms();

        tracing::info!(
            "buffer delay min={:.2}ms avg={:.2}ms max={:.2}ms | \
             rtt min={:.2}ms avg={:.2}ms max={:.2}ms | \
             processing min={:.2}ms avg={:.2}ms max={:.2}ms | \
             peer jitter min={:.2}ms avg={:.2}ms max={:.2}ms | \
             local jitter min={:.2}ms avg={:.2}ms max={:.2}ms | \
             xruns={}",
            ring.0,
            ring.1,
            ring.2,
            rtt.0,
            rtt.1,
            rtt.2,
            processing.0,
            processing.1,
            processing.2,
            peer_jitter.0,
            peer_jitter.1,
            peer_jitter.2,
            local_jitter.0,
            local_jitter.1,
            local_jitter.2,
            st.xruns,
        );

        st.completed = std::mem::take(&mut st.running);
        st.have_completed = true;
        st.last_report = now;
    }

    /// Fold the play-out buffer fill level (in frames) after a push.
    pub fn report_ring_fill(&self, frames: u32) {
        self.inner.lock().running.ring_fill.fold(frames as u64);
    }

    /// Count one xrun (underrun or overrun) seen by the audio path.
    pub fn report_xrun(&self) {
        self.inner.lock().xruns += 1;
    }

    /// Retain the peer's most recent side-channel report.
    pub fn handle_peer_report(&self, report: &PeerReport) {
        self.inner.lock().peer = Some(*report);
    }

    /// Copy out the last completed window in milliseconds. Until the first
    /// window completes the running window is returned, so a control caller
    /// polling right after start sees live values instead of zeros.
    pub fn snapshot(&self) -> LatencyMetrics {
        let st = self.inner.lock();
        let win = if st.have_completed {
            &st.completed
        } else {
            &st.running
        };

        let rtt = win.rtt.ns_to_ms();
        let processing = win.processing.ns_to_ms();
        let peer_jitter = win.peer_jitter.ns_to_ms();
        let local_jitter = win.local_jitter.ns_to_ms();
        let ring = win.ring_fill.frames_to_ms(self.sample_rate);

        LatencyMetrics {
            rtt_min_ms: rtt.0,
            rtt_avg_ms: rtt.1,
            rtt_max_ms: rtt.2,
            rtt_count: win.rtt.count,
            processing_min_ms: processing.0,
            processing_avg_ms: processing.1,
            processing_max_ms: processing.2,
            peer_jitter_min_ms: peer_jitter.0,
            peer_jitter_avg_ms: peer_jitter.1,
            peer_jitter_max_ms: peer_jitter.2,
            local_jitter_min_ms: local_jitter.0,
            local_jitter_avg_ms: local_jitter.1,
            local_jitter_max_ms: local_jitter.2,
            ring_fill_min_ms: ring.0,
            ring_fill_avg_ms: ring.1,
            ring_fill_max_ms: ring.2,
            xruns: st.xruns,
            backend_latency_ms: st.backend_latency_ms,
            peer_report: st.peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(t1: u64, t2: u64, t3: u64, t4: u64) -> Packet {
        let mut packet = Packet::new();
        packet.n_samples = 32;
        packet.t1_send = t1;
        packet.t2_peer_recv = t2;
        packet.t3_peer_send = t3;
        packet.t4_recv = t4;
        packet
    }

    #[test]
    fn test_rtt_and_processing_from_injected_timestamps() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        manager.fold_stamped(&stamped(1_000_000, 1_100_000, 2_300_000, 2_500_000));

        let metrics = manager.snapshot();
        assert_eq!(metrics.rtt_count, 1);
        assert!((metrics.rtt_avg_ms - 1.5).abs() < 1e-9);
        assert!((metrics.processing_avg_ms - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_fold_min_avg_max() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        // RTTs of 1 ms, 2 ms and 3 ms.
        manager.fold_stamped(&stamped(0, 10, 10, 1_000_000));
        manager.fold_stamped(&stamped(0, 10, 10, 2_000_000));
        manager.fold_stamped(&stamped(0, 10, 10, 3_000_000));

        let metrics = manager.snapshot();
        assert_eq!(metrics.rtt_count, 3);
        assert!((metrics.rtt_min_ms - 1.0).abs() < 1e-9);
        assert!((metrics.rtt_avg_ms - 2.0).abs() < 1e-9);
        assert!((metrics.rtt_max_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_skips_first_packet() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        manager.fold_stamped(&stamped(0, 5_000_000, 5_000_000, 10_000_000));
        {
            let st = manager.inner.lock();
            assert_eq!(st.running.peer_jitter.count, 0);
            assert_eq!(st.running.local_jitter.count, 0);
        }

        manager.fold_stamped(&stamped(0, 6_000_000, 6_000_000, 11_500_000));
        let metrics = manager.snapshot();
        assert!((metrics.peer_jitter_avg_ms - 1.0).abs() < 1e-9);
        assert!((metrics.local_jitter_avg_ms - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_ring_fill_converted_to_ms() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        // 480 frames at 48 kHz = 10 ms.
        manager.report_ring_fill(480);
        let metrics = manager.snapshot();
        assert!((metrics.ring_fill_avg_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_rotation() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        // First packet arms last_report, second lands past the period and
        // rotates the window.
        manager.fold_stamped(&stamped(0, 10, 10, 1_000_000));
        manager.fold_stamped(&stamped(0, 10, 10, 1_000_000 + REPORT_PERIOD_NS));

        let metrics = manager.snapshot();
        // Snapshot now holds the completed window with both samples.
        assert_eq!(metrics.rtt_count, 2);

        // The running window starts empty again.
        let st = manager.inner.lock();
        assert_eq!(st.running.rtt.count, 0);
    }

    #[test]
    fn test_xruns_cumulative() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        manager.report_xrun();
        manager.report_xrun();
        assert_eq!(manager.snapshot().xruns, 2);
    }

    #[test]
    fn test_peer_report_retained() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        assert!(manager.snapshot().peer_report.is_none());
        let report = PeerReport {
            xruns: 3,
            proc_avg_us: 800,
            fill_avg_us: 12000,
        };
        manager.handle_peer_report(&report);
        assert_eq!(manager.snapshot().peer_report, Some(report));
    }

    #[test]
    fn test_expected_interval() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        assert!((manager.expected_interval_ms() - 64.0 * 1000.0 / 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_backend_latency_add_on() {
        let manager = LatencyManager::new(48000, 64, 0.0);
        manager.set_backend_latency_ms(2.5);
        assert!((manager.snapshot().backend_latency_ms - 2.5).abs() < 1e-9);
    }
}

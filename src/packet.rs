//! Wire frame codec for the relay protocol.
//!
//! One UDP datagram carries one fixed-size little-endian packet: a frame
//! count, four nanosecond timestamps and an interleaved stereo sample block.
//! The packet size is constant regardless of the frame count; trailing
//! sample slots beyond `n_samples` are undefined and never read. The codec
//! guarantees field positions and endianness only - it does not interpret
//! timestamps.

use crate::{Error, Result, CHANNELS, MAX_CHUNK};

/// Byte offset of the sample block inside a packet.
const SAMPLES_OFFSET: usize = 40;

/// Fixed wire size of an audio packet.
pub const PACKET_BYTES: usize = SAMPLES_OFFSET + 4 * CHANNELS * MAX_CHUNK;

/// Fixed wire size of a peer latency report datagram.
pub const PEER_REPORT_BYTES: usize = 24;

/// Magic tag leading a peer latency report ("JLRP", little-endian).
pub const PEER_REPORT_MAGIC: u32 = u32::from_le_bytes(*b"JLRP");

/// One audio packet.
///
/// Timestamp roles:
/// - `t1_send`: stamped by the producer immediately before the send,
/// - `t2_peer_recv` / `t3_peer_send`: stamped by the peer on its own clock,
/// - `t4_recv`: stamped locally on arrival.
pub struct Packet {
    pub n_samples: u16,
    pub t1_send: u64,
    pub t2_peer_recv: u64,
    pub t3_peer_send: u64,
    pub t4_recv: u64,
    /// Interleaved samples; only the leading `n_samples * CHANNELS` slots
    /// are meaningful.
    pub samples: [f32; CHANNELS * MAX_CHUNK],
}

impl Packet {
    pub fn new() -> Self {
        Self {
            n_samples: 0,
            t1_send: 0,
            t2_peer_recv: 0,
            t3_peer_send: 0,
            t4_recv: 0,
            samples: [0.0; CHANNELS * MAX_CHUNK],
        }
    }

    /// Fill the packet from a mono input period, duplicating the input into
    /// both interleaved channels and zeroing every timestamp. The caller
    /// stamps `t1_send` right before the send.
    ///
    /// `input.len()` must not exceed [`MAX_CHUNK`]; the engine validates the
    /// period size at init so this never truncates in practice.
    pub fn fill_mono(&mut self, input: &[f32]) {
        let n = input.len().min(MAX_CHUNK);
        self.n_samples = n as u16;
        self.t1_send = 0;
        self.t2_peer_recv = 0;
        self.t3_peer_send = 0;
        self.t4_recv = 0;
        for (i, &s) in input[..n].iter().enumerate() {
            self.samples[i * CHANNELS] = s;
            self.samples[i * CHANNELS + 1] = s;
        }
    }

    /// Build a packet from already-interleaved frames, timestamps zeroed.
    /// This is the path a processing peer takes when returning audio that
    /// is already stereo; [`fill_mono`](Packet::fill_mono) is the capture
    /// path. The frame count is `frames.len() / CHANNELS`, capped at
    /// [`MAX_CHUNK`].
    pub fn from_frames(frames: &[f32]) -> Packet {
        let n = (frames.len() / CHANNELS).min(MAX_CHUNK);
        let mut packet = Packet::new();
        packet.n_samples = n as u16;
        packet.samples[..n * CHANNELS].copy_from_slice(&frames[..n * CHANNELS]);
        packet
    }

    /// The meaningful interleaved frames of this packet.
    pub fn frames(&self) -> &[f32] {
        &self.samples[..self.n_samples as usize * CHANNELS]
    }

    /// Serialise into a fixed wire buffer. Writes every byte of `out`,
    /// including the undefined trailing sample slots.
    pub fn encode_into(&self, out: &mut [u8; PACKET_BYTES]) {
        out[0..2].copy_from_slice(&self.n_samples.to_le_bytes());
        out[2..8].fill(0);
        out[8..16].copy_from_slice(&self.t1_send.to_le_bytes());
        out[16..24].copy_from_slice(&self.t2_peer_recv.to_le_bytes());
        out[24..32].copy_from_slice(&self.t3_peer_send.to_le_bytes());
        out[32..40].copy_from_slice(&self.t4_recv.to_le_bytes());
        for (i, &s) in self.samples.iter().enumerate() {
            let at = SAMPLES_OFFSET + i * 4;
            out[at..at + 4].copy_from_slice(&s.to_le_bytes());
        }
    }

    /// Parse a datagram. The length must match the packet size exactly and
    /// the frame count must be in `1..=MAX_CHUNK`; anything else is rejected
    /// so the receive loop can drop and count it. Only the meaningful
    /// leading frames are copied out of the sample block.
    pub fn parse(data: &[u8]) -> Result<Packet> {
        if data.len() != PACKET_BYTES {
            return Err(Error::WrongLength {
                got: data.len(),
                want: PACKET_BYTES,
            });
        }

        let n_samples = u16::from_le_bytes([data[0], data[1]]);
        if n_samples == 0 || n_samples as usize > MAX_CHUNK {
            return Err(Error::InvalidSampleCount(n_samples));
        }

        let mut packet = Packet::new();
        packet.n_samples = n_samples;
        packet.t1_send = read_u64(data, 8);
        packet.t2_peer_recv = read_u64(data, 16);
        packet.t3_peer_send = read_u64(data, 24);
        packet.t4_recv = read_u64(data, 32);

        for i in 0..n_samples as usize * CHANNELS {
            let at = SAMPLES_OFFSET + i * 4;
            packet.samples[i] = f32::from_le_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ]);
        }

        Ok(packet)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Side-channel datagram a peer may send alongside the audio stream,
/// carrying its own view of the link. Dispatched by exact length in the
/// receive loop; peers that never send it lose nothing.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PeerReport {
    /// Xruns the peer has seen since it started.
    pub xruns: u32,
    /// Peer's average processing time per period, microseconds.
    pub proc_avg_us: u64,
    /// Peer's average play-out buffer fill, microseconds.
    pub fill_avg_us: u64,
}

impl PeerReport {
    pub fn encode_into(&self, out: &mut [u8; PEER_REPORT_BYTES]) {
        out[0..4].copy_from_slice(&PEER_REPORT_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.xruns.to_le_bytes());
        out[8..16].copy_from_slice(&self.proc_avg_us.to_le_bytes());
        out[16..24].copy_from_slice(&self.fill_avg_us.to_le_bytes());
    }

    pub fn parse(data: &[u8]) -> Result<PeerReport> {
        if data.len() != PEER_REPORT_BYTES {
            return Err(Error::WrongLength {
                got: data.len(),
                want: PEER_REPORT_BYTES,
            });
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != PEER_REPORT_MAGIC {
            return Err(Error::PacketInvalid);
        }
        Ok(PeerReport {
            xruns: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            proc_avg_us: read_u64(data, 8),
            fill_avg_us: read_u64(data, 16),
        })
    }
}

//! jamlink - low-latency bidirectional UDP audio relay
//!
//! Streams PCM frames over UDP between two hosts so that audio captured on
//! one machine can be processed on the other and played back locally with
//! bounded delay. Each side runs the same engine:
//! - the audio backend delivers capture periods to the engine's callback,
//! - the callback packetizes them, stamps a send timestamp and fires them
//!   at the peer over UDP,
//! - a dedicated receive thread parses returning packets, feeds the latency
//!   manager and pushes the samples into a play-out ring buffer,
//! - the callback pops the ring buffer into the playback outputs.
//!
//! Audio format notes:
//! - the wire carries 32-bit float interleaved stereo in [-1.0, 1.0],
//! - sample rate and channel count are fixed at startup, never negotiated,
//! - delivery is fire-and-forget UDP; a play-out ring buffer absorbs jitter
//!   and replaces lost audio with silence.

pub mod backend;
pub mod clock;
pub mod config;
pub mod engine;
pub mod latency;
pub mod net;
pub mod packet;
pub mod ring;

/// Number of interleaved channels on the wire and in the play-out buffer.
pub const CHANNELS: usize = 2;

/// Largest frame count a single packet can carry.
pub const MAX_CHUNK: usize = 128;

/// Error kinds of the relay. Init-time kinds are fatal and returned to the
/// control caller; runtime kinds on the realtime threads are counted in
/// statistics instead of being propagated.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] std::io::Error),

    #[error("audio backend `{0}` is not available in this build")]
    BackendUnavailable(&'static str),

    #[error("audio backend init failed: {0}")]
    BackendInit(String),

    #[error("datagram length {got} does not match frame length {want}")]
    WrongLength { got: usize, want: usize },

    #[error("sample count {0} outside 1..={max}", max = MAX_CHUNK)]
    InvalidSampleCount(u16),

    #[error("malformed datagram")]
    PacketInvalid,

    #[error("channel count {got} does not match ring buffer channels {want}")]
    ChannelMismatch { got: usize, want: usize },

    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("configuration change requires engine restart")]
    RestartRequired,
}

pub type Result<T> = std::result::Result<T, Error>;

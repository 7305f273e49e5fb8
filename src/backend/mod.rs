//! Audio backend abstraction.
//!
//! The engine never talks to a device API directly: it hands one process
//! callback to a backend and the backend invokes it exactly once per period
//! with `frames` mono input samples and two output buffers of `frames`
//! samples each, on a thread the backend owns and prioritises. Variants:
//!
//! - [`BackendKind::Alsa`]: direct low-level PCM, S32LE interleaved
//!   (feature `alsa-backend`),
//! - [`BackendKind::Pipewire`]: server-routed filter with mono float ports
//!   (feature `pipewire-backend`),
//! - [`BackendKind::Simulated`]: a paced thread with a generated sine
//!   input, always available, used for testing without hardware.

mod simulated;

#[cfg(feature = "alsa-backend")]
mod alsa;

#[cfg(feature = "pipewire-backend")]
mod pipewire;

use std::str::FromStr;

use crate::{config::AudioConfig, Error, Result};

/// Process callback: `(input, out_left, out_right)`. Invoked on the
/// backend's realtime thread; it must not block on anything beyond the
/// engine's two short mutexes.
pub type ProcessFn = Box<dyn FnMut(&[f32], &mut [f32], &mut [f32]) + Send + 'static>;

/// Counters a backend accumulates on its audio thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendStats {
    pub callbacks: u64,
    pub capture_xruns: u64,
    pub playback_xruns: u64,
    /// Output discontinuities detected by the simulated backend's analyser.
    pub glitches: u64,
}

/// Uniform capability set over all device variants. `cleanup` releases
/// device handles and is idempotent; every implementation also runs it on
/// drop so an engine teardown can never leak a device.
pub trait AudioBackend: Send {
    fn init(&mut self, config: &AudioConfig, callback: ProcessFn) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn cleanup(&mut self);
    fn is_running(&self) -> bool;
    fn stats(&self) -> BackendStats;
    /// Fixed device latency to add on top of transport figures.
    fn reported_latency_ms(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Alsa,
    Pipewire,
    Simulated,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Alsa,
        BackendKind::Pipewire,
        BackendKind::Simulated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Alsa => "alsa",
            BackendKind::Pipewire => "pipewire",
            BackendKind::Simulated => "sim",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "alsa" => Ok(BackendKind::Alsa),
            "pipewire" => Ok(BackendKind::Pipewire),
            "sim" | "simulated" => Ok(BackendKind::Simulated),
            other => Err(format!(
                "unknown backend `{}` (expected alsa, pipewire or sim)",
                other
            )),
        }
    }
}

/// Whether a variant was compiled into this build.
pub fn is_available(kind: BackendKind) -> bool {
    match kind {
        BackendKind::Alsa => cfg!(feature = "alsa-backend"),
        BackendKind::Pipewire => cfg!(feature = "pipewire-backend"),
        BackendKind::Simulated => true,
    }
}

/// Instantiate a backend. The handle is inert until `init`.
pub fn create(kind: BackendKind) -> Result<Box<dyn AudioBackend>> {
    match kind {
        BackendKind::Simulated => Ok(Box::new(simulated::SimulatedBackend::new())),

        #[cfg(feature = "alsa-backend")]
        BackendKind::Alsa => Ok(Box::new(alsa::AlsaBackend::new())),
        #[cfg(not(feature = "alsa-backend"))]
        BackendKind::Alsa => Err(Error::BackendUnavailable("alsa")),

        #[cfg(feature = "pipewire-backend")]
        BackendKind::Pipewire => Ok(Box::new(pipewire::PipewireBackend::new())),
        #[cfg(not(feature = "pipewire-backend"))]
        BackendKind::Pipewire => Err(Error::BackendUnavailable("pipewire")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_always_available() {
        assert!(is_available(BackendKind::Simulated));
        assert!(create(BackendKind::Simulated).is_ok());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("alsa".parse::<BackendKind>().unwrap(), BackendKind::Alsa);
        assert_eq!(
            "pipewire".parse::<BackendKind>().unwrap(),
            BackendKind::Pipewire
        );
        assert_eq!("sim".parse::<BackendKind>().unwrap(), BackendKind::Simulated);
        assert_eq!(
            "simulated".parse::<BackendKind>().unwrap(),
            BackendKind::Simulated
        );
        assert!("pulse".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_unavailable_create_is_an_error() {
        for kind in BackendKind::ALL {
            if !is_available(kind) {
                assert!(matches!(
                    create(kind),
                    Err(Error::BackendUnavailable(_))
                ));
            }
        }
    }
}

//! Engine and audio-device configuration.
//!
//! All parameters are fixed at init; a subset can be changed at runtime via
//! the control API, everything else demands a full cleanup + re-init, which
//! [`EngineConfig::requires_restart`] detects for the caller. Configuration
//! comes from the CLI each start; the only persisted input is an optional
//! key=value file with a single recognised key, `udp_send_ip`.

use std::net::Ipv4Addr;
use std::path::Path;

use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::{Error, Result, MAX_CHUNK};

pub const DEFAULT_SAMPLE_RATE: u32 = 48000;
pub const DEFAULT_DEVICE_BUFFER: u32 = 32;
pub const DEFAULT_PACKET_BUFFER: u32 = 64;
pub const DEFAULT_RING_DEPTH: u32 = 2048;
pub const DEFAULT_PEER_PORT: u16 = 8321;
pub const DEFAULT_LISTEN_PORT: u16 = 8321;

/// Options every backend recognises; device identifiers are only meaningful
/// for the direct-PCM variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Frames per second.
    pub sample_rate: u32,
    /// Period size: frames delivered per callback.
    pub frames: u32,
    pub playback_channels: u32,
    /// Multichannel capture is reduced to mono by taking channel 0.
    pub capture_channels: u32,
    pub device_playback: String,
    pub device_capture: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames: DEFAULT_DEVICE_BUFFER,
            playback_channels: 2,
            capture_channels: 2,
            device_playback: "default".to_string(),
            device_capture: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub listen_port: u16,
    /// Period size in frames; kept in sync with `audio.frames`.
    pub device_buffer: u32,
    /// Peer packet grouping in frames; a positive multiple of
    /// `device_buffer`.
    pub packet_buffer: u32,
    /// Play-out ring buffer depth in frames.
    pub ring_depth: u32,
    /// Bypass the network and copy capture to playback locally.
    pub passthrough: bool,
    pub audio: AudioConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Pipewire,
            peer_ip: Ipv4Addr::LOCALHOST,
            peer_port: DEFAULT_PEER_PORT,
            listen_port: DEFAULT_LISTEN_PORT,
            device_buffer: DEFAULT_DEVICE_BUFFER,
            packet_buffer: DEFAULT_PACKET_BUFFER,
            ring_depth: DEFAULT_RING_DEPTH,
            passthrough: false,
            audio: AudioConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject option combinations the engine cannot run with. Called once
    /// at init; runtime paths can then rely on the invariants.
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::ConfigInvalid("sample rate must be positive".into()));
        }
        if self.device_buffer == 0 || self.device_buffer as usize > MAX_CHUNK {
            return Err(Error::ConfigInvalid(format!(
                "device buffer {} outside 1..={} frames",
                self.device_buffer, MAX_CHUNK
            )));
        }
        if self.audio.frames != self.device_buffer {
            return Err(Error::ConfigInvalid(format!(
                "audio period {} does not match device buffer {}",
                self.audio.frames, self.device_buffer
            )));
        }
        if self.packet_buffer == 0 || self.packet_buffer % self.device_buffer != 0 {
            return Err(Error::ConfigInvalid(format!(
                "packet buffer {} must be a positive multiple of device buffer {}",
                self.packet_buffer, self.device_buffer
            )));
        }
        if self.ring_depth <= self.packet_buffer {
            return Err(Error::ConfigInvalid(format!(
                "ring depth {} must exceed packet buffer {}",
                self.ring_depth, self.packet_buffer
            )));
        }
        if self.audio.playback_channels == 0 || self.audio.capture_channels == 0 {
            return Err(Error::ConfigInvalid("channel counts must be positive".into()));
        }
        Ok(())
    }

    /// True when switching from `self` to `new` cannot be done in place:
    /// buffer geometry, peer endpoint and backend selection are all baked
    /// into sockets, threads and allocations at init.
    pub fn requires_restart(&self, new: &EngineConfig) -> bool {
        self.backend != new.backend
            || self.peer_ip != new.peer_ip
            || self.peer_port != new.peer_port
            || self.listen_port != new.listen_port
            || self.device_buffer != new.device_buffer
            || self.packet_buffer != new.packet_buffer
            || self.ring_depth != new.ring_depth
            || self.audio != new.audio
    }

    /// Overlay recognised keys from a key=value file. Missing file is fine;
    /// unknown keys are ignored so the file can be shared with other tools.
    pub fn apply_config_file(&mut self, path: &Path) -> Result<()> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("config file {} not found, using defaults", path.display());
                return Ok(());
            }
            Err(e) => {
                return Err(Error::ConfigInvalid(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() == "udp_send_ip" {
                let value = value.trim();
                self.peer_ip = value.parse().map_err(|_| {
                    Error::ConfigInvalid(format!("bad udp_send_ip `{}`", value))
                })?;
                info!("config file: peer ip = {}", self.peer_ip);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_config() -> EngineConfig {
        EngineConfig {
            backend: BackendKind::Simulated,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        sim_config().validate().unwrap();
    }

    #[test]
    fn test_packet_buffer_must_be_multiple() {
        let mut config = sim_config();
        config.packet_buffer = 48;
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_device_buffer_bounded_by_chunk() {
        let mut config = sim_config();
        config.device_buffer = 256;
        config.audio.frames = 256;
        config.packet_buffer = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ring_depth_must_exceed_packet_buffer() {
        let mut config = sim_config();
        config.ring_depth = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requires_restart_matrix() {
        let base = sim_config();

        let mut new = base.clone();
        new.passthrough = true;
        assert!(!base.requires_restart(&new));

        let mut new = base.clone();
        new.peer_port = 9000;
        assert!(base.requires_restart(&new));

        let mut new = base.clone();
        new.ring_depth = 4096;
        assert!(base.requires_restart(&new));

        let mut new = base.clone();
        new.backend = BackendKind::Alsa;
        assert!(base.requires_restart(&new));

        let mut new = base.clone();
        new.device_buffer = 64;
        assert!(base.requires_restart(&new));
    }

    #[test]
    fn test_config_file_overlay() {
        let dir = std::env::temp_dir();
        let path = dir.join("jamlink_test_cfg");
        std::fs::write(&path, "# comment\nother_key=1\nudp_send_ip=10.0.0.9\n").unwrap();

        let mut config = sim_config();
        config.apply_config_file(&path).unwrap();
        assert_eq!(config.peer_ip, Ipv4Addr::new(10, 0, 0, 9));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_config_file_missing_is_ok() {
        let mut config = sim_config();
        config
            .apply_config_file(Path::new("/nonexistent/jamlink.cfg"))
            .unwrap();
    }

    #[test]
    fn test_config_file_bad_ip() {
        let dir = std::env::temp_dir();
        let path = dir.join("jamlink_test_bad_cfg");
        std::fs::write(&path, "udp_send_ip=not-an-ip\n").unwrap();

        let mut config = sim_config();
        assert!(config.apply_config_file(&path).is_err());

        std::fs::remove_file(&path).unwrap();
    }
}

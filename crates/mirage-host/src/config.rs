use std::path::PathBuf;

use serde::Deserialize;

use mirage_protocol::types::{BitDepth, EncoderSettings, TargetFrameRate};

/// Host configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for the control channel.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// UDP port for media datagrams.
    #[serde(default = "default_data_port")]
    pub data_port: u16,

    /// Name reported to clients in the hello response.
    #[serde(default = "default_name")]
    pub name: String,

    /// Directory holding the device identity; platform default when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Display refresh target offered to clients.
    #[serde(default)]
    pub target_frame_rate: TargetFrameRate,

    /// Encoder bitrate in bits per second.
    #[serde(default = "default_bitrate")]
    pub bitrate_bps: u64,

    /// Keyframe interval in frames.
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,

    /// Capture queue depth between capture and encode.
    #[serde(default = "default_capture_queue_depth")]
    pub capture_queue_depth: u32,

    #[serde(default)]
    pub bit_depth: BitDepth,

    #[serde(default = "default_true")]
    pub allow_runtime_quality_adjustment: bool,

    /// Stream the full native resolution even above 4K.
    #[serde(default)]
    pub disable_resolution_cap: bool,

    #[serde(default = "default_true")]
    pub adaptive_fallback_enabled: bool,

    /// Refuse sessions that do not negotiate media encryption.
    #[serde(default = "default_true")]
    pub require_encrypted_media_on_local_network: bool,

    /// Allow clients with a newer protocol to trigger a host update check.
    #[serde(default)]
    pub allow_update_trigger: bool,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_control_port() -> u16 {
    47100
}

fn default_data_port() -> u16 {
    47101
}

fn default_name() -> String {
    "mirage-host".into()
}

fn default_bitrate() -> u64 {
    30_000_000
}

fn default_keyframe_interval() -> u32 {
    600
}

fn default_capture_queue_depth() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            name: default_name(),
            state_dir: None,
            target_frame_rate: TargetFrameRate::default(),
            bitrate_bps: default_bitrate(),
            keyframe_interval: default_keyframe_interval(),
            capture_queue_depth: default_capture_queue_depth(),
            bit_depth: BitDepth::default(),
            allow_runtime_quality_adjustment: true,
            disable_resolution_cap: false,
            adaptive_fallback_enabled: true,
            require_encrypted_media_on_local_network: true,
            allow_update_trigger: false,
        }
    }
}

impl HostConfig {
    /// Per-stream encoder settings derived from the static config.
    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            bitrate_bps: self.bitrate_bps,
            keyframe_interval: self.keyframe_interval,
            capture_queue_depth: self.capture_queue_depth,
            bit_depth: self.bit_depth,
            allow_runtime_quality_adjustment: self.allow_runtime_quality_adjustment,
        }
    }
}

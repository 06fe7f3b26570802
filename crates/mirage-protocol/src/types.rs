use serde::{Deserialize, Serialize};

/// Stream identifier assigned by the host, unique within a session.
pub type StreamId = u32;

/// Frame number, strictly increasing per stream on the wire.
pub type FrameNumber = u32;

/// Wire sequence number, incremented per fragment sent.
pub type SequenceNumber = u32;

/// Epoch tag for the current output resolution. A change invalidates any
/// partial reassembly and forces a stream controller reset.
pub type DimensionToken = u16;

/// What a stream carries. Negotiated over the control channel; the data
/// plane only sees stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    DesktopVideo,
    AppVideo,
    Audio,
}

/// Client latency/smoothness preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LatencyMode {
    /// Always present the newest frame; minimal queueing.
    LowestLatency,
    /// Balance latency and smoothness, with typing-burst overrides.
    #[default]
    Auto,
    /// Deeper buffering for even pacing.
    Smoothest,
}

/// Display refresh targets the protocol recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TargetFrameRate {
    #[default]
    Fps60,
    Fps120,
}

impl TargetFrameRate {
    pub fn as_u16(self) -> u16 {
        match self {
            TargetFrameRate::Fps60 => 60,
            TargetFrameRate::Fps120 => 120,
        }
    }

    pub fn frame_interval(self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / self.as_u16() as u64)
    }
}

/// Encoder bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BitDepth {
    #[default]
    Eight,
    Ten,
}

/// Chroma/pixel layout of the encoded stream. The adaptive fallback ladder
/// walks down this list under sustained client decode stress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaFormat {
    /// 10-bit 4:2:0, full fidelity.
    TenBit420,
    /// 10-bit packed P010.
    P010,
    /// 8-bit NV12.
    Nv12,
}

/// Per-stream encoder settings negotiated over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub bitrate_bps: u64,
    /// Keyframe interval in frames (> 0).
    pub keyframe_interval: u32,
    pub capture_queue_depth: u32,
    pub bit_depth: BitDepth,
    pub allow_runtime_quality_adjustment: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bitrate_bps: 30_000_000,
            keyframe_interval: 600,
            capture_queue_depth: 3,
            bit_depth: BitDepth::Eight,
            allow_runtime_quality_adjustment: true,
        }
    }
}

/// Negotiable protocol features, carried as a bit set so unknown bits from
/// newer peers pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FeatureSet(pub u64);

impl FeatureSet {
    pub const MEDIA_ENCRYPTION: FeatureSet = FeatureSet(1 << 0);
    pub const AUDIO_STREAMS: FeatureSet = FeatureSet(1 << 1);
    pub const ADAPTIVE_FALLBACK: FeatureSet = FeatureSet(1 << 2);
    pub const QUALITY_PROBES: FeatureSet = FeatureSet(1 << 3);
    pub const TYPING_BURST: FeatureSet = FeatureSet(1 << 4);

    /// Everything this build implements.
    pub fn all_supported() -> FeatureSet {
        FeatureSet(
            Self::MEDIA_ENCRYPTION.0
                | Self::AUDIO_STREAMS.0
                | Self::ADAPTIVE_FALLBACK.0
                | Self::QUALITY_PROBES.0
                | Self::TYPING_BURST.0,
        )
    }

    /// Features a host cannot run a session without.
    pub fn required() -> FeatureSet {
        Self::MEDIA_ENCRYPTION
    }

    pub fn contains(self, other: FeatureSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersection(self, other: FeatureSet) -> FeatureSet {
        FeatureSet(self.0 & other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_set_contains() {
        let all = FeatureSet::all_supported();
        assert!(all.contains(FeatureSet::MEDIA_ENCRYPTION));
        assert!(all.contains(FeatureSet::required()));
        assert!(!FeatureSet(0).contains(FeatureSet::MEDIA_ENCRYPTION));
    }

    #[test]
    fn feature_intersection() {
        let a = FeatureSet(0b0110);
        let b = FeatureSet(0b0011);
        assert_eq!(a.intersection(b), FeatureSet(0b0010));
    }

    #[test]
    fn frame_interval_60() {
        let dt = TargetFrameRate::Fps60.frame_interval();
        assert_eq!(dt.as_nanos(), 1_000_000_000 / 60);
    }
}

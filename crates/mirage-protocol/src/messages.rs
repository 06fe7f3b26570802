//! Control-channel message types.
//!
//! Client→host and host→client messages are separate enums; both travel as
//! length-prefixed postcard envelopes (see [`crate::codec`]). Input events
//! are ordinary client messages on the wire but are routed around the
//! control queue on receive, so a burst of settings changes can never delay
//! a keystroke.

use serde::{Deserialize, Serialize};

use crate::types::{
    DimensionToken, EncoderSettings, FeatureSet, StreamId, StreamKind, TargetFrameRate,
};

/// Signing domain for client hellos.
pub const HELLO_SIGNING_LABEL: &[u8] = b"mirage hello v1";

/// Signing domain for host hello responses.
pub const HELLO_RESPONSE_SIGNING_LABEL: &[u8] = b"mirage hello response v1";

/// Signed identity material carried in both handshake directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEnvelope {
    /// SHA-256 fingerprint of `public_key`.
    pub key_id: [u8; 32],
    /// 32-byte Ed25519 signing key.
    pub public_key: Vec<u8>,
    /// Ephemeral X25519 key for media key agreement.
    pub dh_public: Vec<u8>,
    /// Sender clock, milliseconds since the Unix epoch.
    pub ts_ms: u64,
    /// Random per-handshake nonce; doubles as replay token and KDF salt.
    pub nonce: [u8; 16],
    /// Ed25519 signature over the canonical payload.
    pub signature: Vec<u8>,
}

impl IdentityEnvelope {
    /// Canonical byte string the signature covers. `context` binds
    /// direction-specific fields (see [`hello_signing_context`] and
    /// [`hello_response_signing_context`]).
    pub fn canonical_payload(&self, label: &[u8], context: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            label.len() + 8 + 16 + self.public_key.len() + self.dh_public.len() + context.len(),
        );
        buf.extend_from_slice(label);
        buf.extend_from_slice(&self.ts_ms.to_le_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.dh_public);
        buf.extend_from_slice(context);
        buf
    }
}

/// Direction-specific context a client hello signature covers.
pub fn hello_signing_context(
    device_id: &[u8; 16],
    protocol_version: u16,
    features: FeatureSet,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 2 + 8);
    buf.extend_from_slice(device_id);
    buf.extend_from_slice(&protocol_version.to_le_bytes());
    buf.extend_from_slice(&features.0.to_le_bytes());
    buf
}

/// Direction-specific context a hello response signature covers. Echoing
/// the client nonce inside the signed payload is what proves freshness to
/// the client.
pub fn hello_response_signing_context(
    request_nonce: &[u8; 16],
    udp_registration_token: &[u8; 32],
    data_port: u16,
    accepted: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + 32 + 2 + 1);
    buf.extend_from_slice(request_nonce);
    buf.extend_from_slice(udp_registration_token);
    buf.extend_from_slice(&data_port.to_le_bytes());
    buf.push(accepted as u8);
    buf
}

/// Static facts a client reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeviceInfo {
    pub device_id: [u8; 16],
    pub name: String,
    pub platform: String,
}

/// Static facts about the host, returned in the hello response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub device_id: [u8; 16],
    pub name: String,
    pub platform: String,
}

/// Opening message of every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub device_info: ClientDeviceInfo,
    pub protocol_version: u16,
    pub features: FeatureSet,
    pub identity: IdentityEnvelope,
    /// Ask the host to trigger its own software update if our protocol
    /// version is newer than it can serve.
    pub request_host_update_on_protocol_mismatch: bool,
}

/// Why a hello was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    ProtocolVersionMismatch,
    ProtocolFeaturesMismatch,
    HostBusy,
    NotTrusted,
    InvalidIdentity,
}

/// Version/feature agreement reached by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiation {
    pub protocol_version: u16,
    pub supported_features: FeatureSet,
    pub selected_features: FeatureSet,
}

/// Detail attached to a `ProtocolVersionMismatch` rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMismatch {
    pub host_version: u16,
    pub client_version: u16,
    /// Whether the host accepted the client's update trigger request.
    pub update_trigger_accepted: Option<bool>,
    pub update_trigger_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub accepted: bool,
    pub host_info: HostInfo,
    /// UDP port the client should register on.
    pub data_port: u16,
    pub negotiation: Negotiation,
    /// Echo of the client's hello nonce.
    pub request_nonce: [u8; 16],
    pub media_encryption_enabled: bool,
    pub udp_registration_token: [u8; 32],
    pub identity: IdentityEnvelope,
    pub rejection_reason: Option<RejectionReason>,
    pub protocol_mismatch: Option<ProtocolMismatch>,
}

/// Keyboard/mouse input, client→host, fire-and-forget in send order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
    Key {
        key_code: u32,
        pressed: bool,
        modifiers: u32,
    },
    MouseMove {
        x: f32,
        y: f32,
    },
    MouseButton {
        button: u8,
        pressed: bool,
    },
    Scroll {
        dx: f32,
        dy: f32,
    },
}

impl InputEvent {
    /// Whether this event should arm the typing-burst latency override.
    pub fn is_typing(&self) -> bool {
        matches!(self, InputEvent::Key { pressed: true, .. })
    }
}

/// Announcement of a newly started media stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAnnounce {
    pub stream_id: StreamId,
    pub kind: StreamKind,
    pub width: u32,
    pub height: u32,
    pub fps: u16,
    pub dimension_token: DimensionToken,
}

/// Messages sent from client to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Hello(Hello),

    /// Routed to the input fast path on the host, never queued behind
    /// control work.
    InputEvent(InputEvent),

    /// Ask for a fresh keyframe after loss or on bootstrap.
    KeyframeRequest { stream_id: StreamId },

    /// Change encoder settings for a stream. Coalesced.
    StreamEncoderSettingsChange {
        stream_id: StreamId,
        settings: EncoderSettings,
    },

    /// Change the stream's target refresh rate. Coalesced.
    StreamRefreshRateChange {
        stream_id: StreamId,
        target: TargetFrameRate,
    },

    /// Change the post-capture stream scale. Coalesced.
    StreamScaleChange { stream_id: StreamId, scale: f32 },

    /// Periodic decode-health report driving host-side adaptation.
    DecodeHealthReport {
        stream_id: StreamId,
        decoded_fps: f32,
        decode_errors: u32,
        frames_lost: u32,
        cache_evictions: u32,
    },

    /// The client's decoder is drowning; ask the host to step down the
    /// adaptive fallback ladder.
    AdaptiveFallbackRequest { stream_id: StreamId },

    /// Round-trip probe; the host echoes it back.
    QualityProbeRequest { probe_id: u32, sent_at_ms: u64 },

    /// Ask the host to run a bulk throughput test of `byte_count` bytes.
    QualityTestRequest { test_id: u32, byte_count: u32 },

    Disconnect,
}

/// Messages sent from host to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostMessage {
    HelloResponse(HelloResponse),

    DesktopStreamStarted { stream: StreamAnnounce },
    DesktopStreamStopped { stream_id: StreamId },
    AppStreamStarted { stream: StreamAnnounce, app_name: String },

    AudioStreamStarted {
        stream_id: StreamId,
        codec: u32,
        sample_rate: u32,
        channel_count: u16,
        samples_per_frame: u16,
    },
    AudioStreamStopped { stream_id: StreamId },

    /// The encoded picture changed size. Coalesced.
    ResolutionChange {
        stream_id: StreamId,
        width: u32,
        height: u32,
        dimension_token: DimensionToken,
    },

    /// Ask the client to re-send its UDP registration datagram.
    TransportRefreshRequest,

    QualityProbeResult { probe_id: u32, sent_at_ms: u64 },
    QualityTestResult {
        test_id: u32,
        byte_count: u32,
        duration_ms: u32,
    },

    /// The host began updating itself after a protocol-mismatch trigger.
    HostSoftwareUpdateStarted { message: String },

    Disconnect,
}

/// Control-message types whose queue entries collapse to the newest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoalesceKind {
    Resolution,
    StreamScale,
    RefreshRate,
    EncoderSettings,
}

/// Key identifying one coalescing slot: message type plus stream.
pub type CoalesceKey = (CoalesceKind, StreamId);

/// Implemented by both message enums so the control queue can coalesce
/// without knowing the direction it serves.
pub trait Coalesce {
    /// `Some(key)` if only the newest message of this kind per stream
    /// matters; `None` for messages that must all be dispatched.
    fn coalesce_key(&self) -> Option<CoalesceKey>;
}

impl Coalesce for ClientMessage {
    fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self {
            ClientMessage::StreamEncoderSettingsChange { stream_id, .. } => {
                Some((CoalesceKind::EncoderSettings, *stream_id))
            }
            ClientMessage::StreamRefreshRateChange { stream_id, .. } => {
                Some((CoalesceKind::RefreshRate, *stream_id))
            }
            ClientMessage::StreamScaleChange { stream_id, .. } => {
                Some((CoalesceKind::StreamScale, *stream_id))
            }
            _ => None,
        }
    }
}

impl Coalesce for HostMessage {
    fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self {
            HostMessage::ResolutionChange { stream_id, .. } => {
                Some((CoalesceKind::Resolution, *stream_id))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_detection() {
        assert!(InputEvent::Key {
            key_code: 30,
            pressed: true,
            modifiers: 0
        }
        .is_typing());
        assert!(!InputEvent::Key {
            key_code: 30,
            pressed: false,
            modifiers: 0
        }
        .is_typing());
        assert!(!InputEvent::MouseMove { x: 1.0, y: 2.0 }.is_typing());
    }

    #[test]
    fn canonical_payload_is_deterministic_and_binding() {
        let envelope = IdentityEnvelope {
            key_id: [1; 32],
            public_key: vec![2; 32],
            dh_public: vec![3; 32],
            ts_ms: 1234,
            nonce: [4; 16],
            signature: vec![],
        };
        let ctx = hello_signing_context(&[5; 16], 1, FeatureSet::all_supported());
        let a = envelope.canonical_payload(HELLO_SIGNING_LABEL, &ctx);
        let b = envelope.canonical_payload(HELLO_SIGNING_LABEL, &ctx);
        assert_eq!(a, b);

        let other_ctx = hello_signing_context(&[6; 16], 1, FeatureSet::all_supported());
        assert_ne!(a, envelope.canonical_payload(HELLO_SIGNING_LABEL, &other_ctx));
        assert_ne!(
            a,
            envelope.canonical_payload(HELLO_RESPONSE_SIGNING_LABEL, &ctx)
        );
    }

    #[test]
    fn coalesce_keys() {
        let scale = ClientMessage::StreamScaleChange {
            stream_id: 3,
            scale: 0.8,
        };
        assert_eq!(scale.coalesce_key(), Some((CoalesceKind::StreamScale, 3)));

        let kf = ClientMessage::KeyframeRequest { stream_id: 3 };
        assert_eq!(kf.coalesce_key(), None);

        let res = HostMessage::ResolutionChange {
            stream_id: 1,
            width: 1920,
            height: 1080,
            dimension_token: 4,
        };
        assert_eq!(res.coalesce_key(), Some((CoalesceKind::Resolution, 1)));
    }
}

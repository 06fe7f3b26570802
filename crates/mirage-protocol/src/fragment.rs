//! Byte-exact datagram headers for the media plane.
//!
//! Layout is fixed little-endian for compatibility across implementations.
//! Video fragments carry a content rect; audio fragments replace it with
//! codec/sample-rate fields. Everything up to and including the checksum is
//! shared between the two.

use crate::error::ProtocolError;
use crate::types::{DimensionToken, FrameNumber, SequenceNumber, StreamId};

/// Datagram magic, shared by media fragments and the UDP registration.
pub const MAGIC: [u8; 4] = *b"MIRG";

/// Fixed video fragment header size.
pub const VIDEO_HEADER_SIZE: usize = 62;

/// Fixed audio fragment header size.
pub const AUDIO_HEADER_SIZE: usize = 58;

/// Byte range of the checksum field within either header.
pub const CHECKSUM_RANGE: std::ops::Range<usize> = 38..42;

/// Maximum total datagram size. 1280 bytes is safe for virtually all local
/// paths including VPN-tunnelled links and the IPv6 minimum MTU.
pub const MAX_DATAGRAM_SIZE: usize = 1280;

/// Maximum payload per unencrypted video fragment.
pub const MAX_VIDEO_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - VIDEO_HEADER_SIZE;

/// Fragment header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentFlags(pub u16);

impl FragmentFlags {
    pub const KEYFRAME: u16 = 1 << 0;
    pub const END_OF_FRAME: u16 = 1 << 1;
    pub const ENCRYPTED_PAYLOAD: u16 = 1 << 2;
    pub const DISCONTINUITY: u16 = 1 << 3;

    pub fn keyframe(self) -> bool {
        self.0 & Self::KEYFRAME != 0
    }

    pub fn end_of_frame(self) -> bool {
        self.0 & Self::END_OF_FRAME != 0
    }

    pub fn encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED_PAYLOAD != 0
    }

    pub fn discontinuity(self) -> bool {
        self.0 & Self::DISCONTINUITY != 0
    }

    pub fn with(self, bit: u16) -> Self {
        Self(self.0 | bit)
    }

    pub fn without(self, bit: u16) -> Self {
        Self(self.0 & !bit)
    }
}

/// Visible subregion of the encoded picture, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Video fragment header.
///
/// Wire format (little-endian):
/// ```text
/// [magic: 4] [flags: u16] [stream_id: u32] [sequence_number: u32]
/// [timestamp: u64 ns] [frame_number: u32] [fragment_index: u16]
/// [fragment_count: u16] [payload_length: u32] [frame_byte_count: u32]
/// [checksum: u32] [content_rect: 4 x i32] [dimension_token: u16] [epoch: u16]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub flags: FragmentFlags,
    pub stream_id: StreamId,
    pub sequence_number: SequenceNumber,
    /// Capture timestamp in nanoseconds.
    pub timestamp: u64,
    pub frame_number: FrameNumber,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_length: u32,
    pub frame_byte_count: u32,
    /// CRC-32 of the plaintext payload; 0 permitted when encrypted.
    pub checksum: u32,
    pub content_rect: ContentRect,
    pub dimension_token: DimensionToken,
    pub epoch: u16,
}

impl FragmentHeader {
    /// Serialize to the fixed wire layout.
    pub fn encode(&self) -> [u8; VIDEO_HEADER_SIZE] {
        let mut buf = [0u8; VIDEO_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[6..10].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[10..14].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[14..22].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[22..26].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[26..28].copy_from_slice(&self.fragment_index.to_le_bytes());
        buf[28..30].copy_from_slice(&self.fragment_count.to_le_bytes());
        buf[30..34].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[34..38].copy_from_slice(&self.frame_byte_count.to_le_bytes());
        buf[38..42].copy_from_slice(&self.checksum.to_le_bytes());
        buf[42..46].copy_from_slice(&self.content_rect.x.to_le_bytes());
        buf[46..50].copy_from_slice(&self.content_rect.y.to_le_bytes());
        buf[50..54].copy_from_slice(&self.content_rect.width.to_le_bytes());
        buf[54..58].copy_from_slice(&self.content_rect.height.to_le_bytes());
        buf[58..60].copy_from_slice(&self.dimension_token.to_le_bytes());
        buf[60..62].copy_from_slice(&self.epoch.to_le_bytes());
        buf
    }

    /// Header bytes with the checksum field zeroed, used as the AEAD
    /// associated data so an attacker cannot re-route a sealed payload.
    pub fn aad_bytes(&self) -> [u8; VIDEO_HEADER_SIZE] {
        let mut buf = self.encode();
        buf[CHECKSUM_RANGE].fill(0);
        buf
    }

    /// Parse the fixed header from the front of a datagram.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < VIDEO_HEADER_SIZE {
            return Err(ProtocolError::ShortHeader { got: data.len() });
        }
        if data[0..4] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let u16_at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let i32_at = |o: usize| i32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);

        Ok(Self {
            flags: FragmentFlags(u16_at(4)),
            stream_id: u32_at(6),
            sequence_number: u32_at(10),
            timestamp: u64::from_le_bytes(data[14..22].try_into().expect("8 bytes")),
            frame_number: u32_at(22),
            fragment_index: u16_at(26),
            fragment_count: u16_at(28),
            payload_length: u32_at(30),
            frame_byte_count: u32_at(34),
            checksum: u32_at(38),
            content_rect: ContentRect {
                x: i32_at(42),
                y: i32_at(46),
                width: i32_at(50),
                height: i32_at(54),
            },
            dimension_token: u16_at(58),
            epoch: u16_at(60),
        })
    }
}

/// Audio fragment header. Identical to [`FragmentHeader`] up to the
/// checksum; the content rect is replaced by codec parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFragmentHeader {
    pub flags: FragmentFlags,
    pub stream_id: StreamId,
    pub sequence_number: SequenceNumber,
    pub timestamp: u64,
    pub frame_number: FrameNumber,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_length: u32,
    pub frame_byte_count: u32,
    pub checksum: u32,
    /// FourCC-style codec tag.
    pub codec: u32,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub samples_per_frame: u16,
    pub dimension_token: DimensionToken,
    pub epoch: u16,
}

impl AudioFragmentHeader {
    pub fn encode(&self) -> [u8; AUDIO_HEADER_SIZE] {
        let mut buf = [0u8; AUDIO_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[6..10].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[10..14].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[14..22].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[22..26].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[26..28].copy_from_slice(&self.fragment_index.to_le_bytes());
        buf[28..30].copy_from_slice(&self.fragment_count.to_le_bytes());
        buf[30..34].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[34..38].copy_from_slice(&self.frame_byte_count.to_le_bytes());
        buf[38..42].copy_from_slice(&self.checksum.to_le_bytes());
        buf[42..46].copy_from_slice(&self.codec.to_le_bytes());
        buf[46..50].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[50..52].copy_from_slice(&self.channel_count.to_le_bytes());
        buf[52..54].copy_from_slice(&self.samples_per_frame.to_le_bytes());
        buf[54..56].copy_from_slice(&self.dimension_token.to_le_bytes());
        buf[56..58].copy_from_slice(&self.epoch.to_le_bytes());
        buf
    }

    pub fn aad_bytes(&self) -> [u8; AUDIO_HEADER_SIZE] {
        let mut buf = self.encode();
        buf[CHECKSUM_RANGE].fill(0);
        buf
    }

    /// Project onto the shared fragment fields so the reassembler can
    /// treat audio and video frames uniformly.
    pub fn reassembly_view(&self) -> FragmentHeader {
        FragmentHeader {
            flags: self.flags,
            stream_id: self.stream_id,
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            frame_number: self.frame_number,
            fragment_index: self.fragment_index,
            fragment_count: self.fragment_count,
            payload_length: self.payload_length,
            frame_byte_count: self.frame_byte_count,
            checksum: self.checksum,
            content_rect: ContentRect::default(),
            dimension_token: self.dimension_token,
            epoch: self.epoch,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < AUDIO_HEADER_SIZE {
            return Err(ProtocolError::ShortHeader { got: data.len() });
        }
        if data[0..4] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        let u16_at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);

        Ok(Self {
            flags: FragmentFlags(u16_at(4)),
            stream_id: u32_at(6),
            sequence_number: u32_at(10),
            timestamp: u64::from_le_bytes(data[14..22].try_into().expect("8 bytes")),
            frame_number: u32_at(22),
            fragment_index: u16_at(26),
            fragment_count: u16_at(28),
            payload_length: u32_at(30),
            frame_byte_count: u32_at(34),
            checksum: u32_at(38),
            codec: u32_at(42),
            sample_rate: u32_at(46),
            channel_count: u16_at(50),
            samples_per_frame: u16_at(52),
            dimension_token: u16_at(54),
            epoch: u16_at(56),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FragmentHeader {
        FragmentHeader {
            flags: FragmentFlags(FragmentFlags::KEYFRAME | FragmentFlags::END_OF_FRAME),
            stream_id: 7,
            sequence_number: 1234,
            timestamp: 987_654_321_000,
            frame_number: 42,
            fragment_index: 3,
            fragment_count: 5,
            payload_length: 1100,
            frame_byte_count: 5400,
            checksum: 0xDEADBEEF,
            content_rect: ContentRect {
                x: 0,
                y: 0,
                width: 2560,
                height: 1440,
            },
            dimension_token: 2,
            epoch: 1,
        }
    }

    #[test]
    fn video_header_roundtrip() {
        let h = header();
        let bytes = h.encode();
        assert_eq!(bytes.len(), VIDEO_HEADER_SIZE);
        assert_eq!(&bytes[0..4], b"MIRG");
        let decoded = FragmentHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn video_header_is_little_endian() {
        let h = header();
        let bytes = h.encode();
        // stream_id = 7 at offset 6
        assert_eq!(&bytes[6..10], &[7, 0, 0, 0]);
        // fragment_count = 5 at offset 28
        assert_eq!(&bytes[28..30], &[5, 0]);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = header().encode();
        bytes[0] = b'X';
        assert!(matches!(
            FragmentHeader::decode(&bytes),
            Err(ProtocolError::BadMagic)
        ));
    }

    #[test]
    fn short_header_rejected() {
        let bytes = header().encode();
        assert!(matches!(
            FragmentHeader::decode(&bytes[..VIDEO_HEADER_SIZE - 1]),
            Err(ProtocolError::ShortHeader { .. })
        ));
    }

    #[test]
    fn aad_zeroes_only_checksum() {
        let h = header();
        let wire = h.encode();
        let aad = h.aad_bytes();
        assert_eq!(&aad[CHECKSUM_RANGE], &[0, 0, 0, 0]);
        assert_eq!(wire[..38], aad[..38]);
        assert_eq!(wire[42..], aad[42..]);
    }

    #[test]
    fn flag_accessors() {
        let f = FragmentFlags(0).with(FragmentFlags::ENCRYPTED_PAYLOAD);
        assert!(f.encrypted());
        assert!(!f.keyframe());
        assert!(!f.without(FragmentFlags::ENCRYPTED_PAYLOAD).encrypted());
    }

    #[test]
    fn audio_header_roundtrip() {
        let h = AudioFragmentHeader {
            flags: FragmentFlags::default(),
            stream_id: 9,
            sequence_number: 55,
            timestamp: 1,
            frame_number: 2,
            fragment_index: 0,
            fragment_count: 1,
            payload_length: 240,
            frame_byte_count: 240,
            checksum: 0xABCD,
            codec: u32::from_le_bytes(*b"opus"),
            sample_rate: 48_000,
            channel_count: 2,
            samples_per_frame: 960,
            dimension_token: 0,
            epoch: 0,
        };
        let bytes = h.encode();
        assert_eq!(bytes.len(), AUDIO_HEADER_SIZE);
        assert_eq!(AudioFragmentHeader::decode(&bytes).unwrap(), h);
    }
}
